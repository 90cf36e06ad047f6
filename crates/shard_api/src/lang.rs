//! Localized message bundles.
//!
//! An archive ships bundles as exports named
//! `shard::lang::<title>_<lang>_<variant>` whose value is a `.properties`
//! document. [`ShardContext::lang`](crate::ShardContext::lang) copies the
//! bundle into `<data directory>/lang/` the first time it is requested and
//! always reads the copy on disk, so operators can edit translations.
//!
//! Patterns use `{0}`, `{1}`, ... placeholders. A single quote starts a
//! literal section and `''` is a literal quote.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub const LANG_EXPORT_PREFIX: &str = "shard::lang::";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LangError {
    #[error("no language bundle '{0}' in the archive or the data directory")]
    MissingBundle(String),
    #[error("bundle '{bundle}' has no key '{key}'")]
    MissingKey { bundle: String, key: String },
    #[error("language bundle I/O failed for {path}: {reason}")]
    Io { path: String, reason: String },
}

/// `<title>_<lang>_<variant>`, the file and export name of a bundle.
pub fn bundle_name(title: &str, lang: &str, variant: &str) -> String {
    format!("{}_{}_{}", title, lang, variant)
}

/// A loaded message bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lang {
    name: String,
    messages: HashMap<String, String>,
}

impl Lang {
    /// Parses a `.properties` document.
    pub fn parse(name: impl Into<String>, source: &str) -> Self {
        let mut messages = HashMap::new();
        let mut lines = source.lines();

        while let Some(line) = lines.next() {
            let mut logical = line.trim_start().to_string();
            if logical.is_empty() || logical.starts_with('#') || logical.starts_with('!') {
                continue;
            }
            while ends_with_continuation(&logical) {
                logical.pop();
                match lines.next() {
                    Some(next) => logical.push_str(next.trim_start()),
                    None => break,
                }
            }

            let (key, value) = split_entry(&logical);
            messages.insert(unescape(key.trim_end()), unescape(value));
        }

        Self {
            name: name.into(),
            messages,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The raw pattern stored under `key`.
    pub fn get(&self, key: &str) -> Result<&str, LangError> {
        self.messages
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| LangError::MissingKey {
                bundle: self.name.clone(),
                key: key.to_string(),
            })
    }

    /// Formats the pattern under `key` with positional arguments.
    ///
    /// A placeholder without a matching argument is kept as written.
    pub fn format(&self, key: &str, args: &[&dyn fmt::Display]) -> Result<String, LangError> {
        Ok(format_pattern(self.get(key)?, args))
    }
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Splits at the first unescaped `=`, `:` or whitespace.
fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (index, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return (&line[..index], line[index + 1..].trim_start()),
            c if c.is_whitespace() => {
                let rest = line[index..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                return (&line[..index], rest.trim_start());
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&code);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn format_pattern(pattern: &str, args: &[&dyn fmt::Display]) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            '\'' => quoted = !quoted,
            '{' if !quoted => {
                let mut placeholder = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    placeholder.push(next);
                }
                let argument = placeholder
                    .trim()
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| args.get(index));
                match (argument, closed) {
                    (Some(argument), true) => out.push_str(&argument.to_string()),
                    (_, true) => {
                        out.push('{');
                        out.push_str(&placeholder);
                        out.push('}');
                    }
                    (_, false) => {
                        out.push('{');
                        out.push_str(&placeholder);
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLE: &str = r"
# greetings
greeting = Hello, {0}! You are visitor #{1}.
farewell: Bye {0}
quote=It''s '{literal}' {0}
multi = first \
        second
tab\ key = a\tb
snow = ❄
empty
";

    #[test]
    fn test_parse_properties() {
        let lang = Lang::parse("demo_en_US", BUNDLE);
        assert_eq!(lang.get("farewell").unwrap(), "Bye {0}");
        assert_eq!(lang.get("multi").unwrap(), "first second");
        assert_eq!(lang.get("tab key").unwrap(), "a\tb");
        assert_eq!(lang.get("snow").unwrap(), "❄");
        assert_eq!(lang.get("empty").unwrap(), "");
        assert_eq!(lang.len(), 7);
    }

    #[test]
    fn test_format_arguments() {
        let lang = Lang::parse("demo_en_US", BUNDLE);
        assert_eq!(
            lang.format("greeting", &[&"Alex", &3]).unwrap(),
            "Hello, Alex! You are visitor #3."
        );
        assert_eq!(lang.format("quote", &[&7]).unwrap(), "It's {literal} 7");
        // Missing arguments leave the placeholder alone.
        assert_eq!(lang.format("farewell", &[]).unwrap(), "Bye {0}");
    }

    #[test]
    fn test_missing_key() {
        let lang = Lang::parse("demo_en_US", BUNDLE);
        assert_eq!(
            lang.get("nope").unwrap_err(),
            LangError::MissingKey {
                bundle: "demo_en_US".into(),
                key: "nope".into()
            }
        );
        assert_eq!(bundle_name("demo", "en", "US"), "demo_en_US");
    }
}
