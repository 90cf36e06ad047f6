//! Declarative command model.
//!
//! A shard command carries [`CommandMeta`] and any number of [`Subcommand`]s.
//! Each subcommand declares the value kinds its handler takes (its signature)
//! and, per parameter, the argument type the dispatcher should parse. The host
//! checks the two against each other when the command is bound, not when it is
//! first run.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Command identity and access metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMeta {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub usage: String,
    /// Permission node required to run the command, if any
    #[serde(default)]
    pub permission: Option<String>,
}

impl CommandMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: String::new(),
            usage: String::new(),
            permission: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }
}

/// Kind of a parsed argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// How the dispatcher parses one argument token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgumentType {
    /// A single word
    String,
    /// Every remaining token joined by spaces; must be the last argument
    GreedyString,
    /// One word out of a fixed set
    Choice(Vec<String>),
    Integer,
    Float,
    Boolean,
}

impl ArgumentType {
    /// The value kind this argument type produces.
    pub fn produces(&self) -> ValueKind {
        match self {
            ArgumentType::String | ArgumentType::GreedyString | ArgumentType::Choice(_) => {
                ValueKind::String
            }
            ArgumentType::Integer => ValueKind::Integer,
            ArgumentType::Float => ValueKind::Float,
            ArgumentType::Boolean => ValueKind::Boolean,
        }
    }

    pub fn is_greedy(&self) -> bool {
        matches!(self, ArgumentType::GreedyString)
    }

    pub fn parse(&self, input: &str) -> Result<ArgValue, CommandError> {
        let invalid = |expected: &str| {
            CommandError::InvalidArguments(format!("expected {} but got '{}'", expected, input))
        };
        match self {
            ArgumentType::String | ArgumentType::GreedyString => {
                Ok(ArgValue::String(input.to_string()))
            }
            ArgumentType::Choice(options) => options
                .iter()
                .find(|option| option.eq_ignore_ascii_case(input))
                .map(|option| ArgValue::String(option.clone()))
                .ok_or_else(|| invalid(&format!("one of [{}]", options.join(", ")))),
            ArgumentType::Integer => input
                .parse()
                .map(ArgValue::Integer)
                .map_err(|_| invalid("an integer")),
            ArgumentType::Float => input
                .parse()
                .map(ArgValue::Float)
                .map_err(|_| invalid("a number")),
            ArgumentType::Boolean => match input.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" => Ok(ArgValue::Boolean(true)),
                "false" | "no" | "off" => Ok(ArgValue::Boolean(false)),
                _ => Err(invalid("true or false")),
            },
        }
    }
}

/// A parsed argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl ArgValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ArgValue::String(_) => ValueKind::String,
            ArgValue::Integer(_) => ValueKind::Integer,
            ArgValue::Float(_) => ValueKind::Float,
            ArgValue::Boolean(_) => ValueKind::Boolean,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float(value) => Some(*value),
            ArgValue::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::String(value) => f.write_str(value),
            ArgValue::Integer(value) => write!(f, "{}", value),
            ArgValue::Float(value) => write!(f, "{}", value),
            ArgValue::Boolean(value) => write!(f, "{}", value),
        }
    }
}

/// Whoever issued a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSender {
    pub name: String,
    pub permissions: HashSet<String>,
    /// The server console holds every permission
    pub console: bool,
}

impl CommandSender {
    pub fn console() -> Self {
        Self {
            name: "console".to_string(),
            permissions: HashSet::new(),
            console: true,
        }
    }

    pub fn player(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permissions: HashSet::new(),
            console: false,
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.console || self.permissions.contains(permission)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Handler body of a subcommand. Receives arguments already parsed according
/// to the subcommand's parameters.
pub type SubcommandHandler =
    Arc<dyn Fn(&CommandSender, &[ArgValue]) -> Result<(), CommandError> + Send + Sync>;

/// One declared handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Argument type used for parsing; a plain string when absent
    pub argument: Option<ArgumentType>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: None,
        }
    }

    pub fn typed(name: impl Into<String>, argument: ArgumentType) -> Self {
        Self {
            name: name.into(),
            argument: Some(argument),
        }
    }

    pub fn argument_type(&self) -> ArgumentType {
        self.argument.clone().unwrap_or(ArgumentType::String)
    }
}

/// A handler reachable under a path of literal tokens.
#[derive(Clone)]
pub struct Subcommand {
    /// Literal tokens separated by spaces, e.g. `"bank deposit"`
    pub path: String,
    pub description: String,
    pub usage: String,
    /// Value kinds the handler expects, in order
    pub signature: Vec<ValueKind>,
    pub params: Vec<Param>,
    pub handler: SubcommandHandler,
}

impl Subcommand {
    pub fn new<F>(path: impl Into<String>, signature: impl Into<Vec<ValueKind>>, handler: F) -> Self
    where
        F: Fn(&CommandSender, &[ArgValue]) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            description: String::new(),
            usage: String::new(),
            signature: signature.into(),
            params: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn usage(mut self, usage: impl Into<String>) -> Self {
        self.usage = usage.into();
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn tokens(&self) -> Vec<&str> {
        self.path.split_whitespace().collect()
    }
}

impl fmt::Debug for Subcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subcommand")
            .field("path", &self.path)
            .field("signature", &self.signature)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A command object exported by a shard.
pub trait ShardCommand: Send + Sync {
    /// Command metadata. A command without metadata is skipped at registration.
    fn metadata(&self) -> Option<CommandMeta>;

    fn subcommands(&self) -> Vec<Subcommand> {
        Vec::new()
    }

    /// Runs before every handler of this command; returning `false` vetoes it.
    ///
    /// `path` is the matched subcommand path, empty for the default handler.
    fn middleware(&self, _sender: &CommandSender, _path: &str, _args: &[ArgValue]) -> bool {
        true
    }

    /// The default handler, run when no subcommand path matches.
    fn execute(&self, sender: &CommandSender) -> Result<(), CommandError>;
}
