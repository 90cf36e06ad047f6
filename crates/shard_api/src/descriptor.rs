//! Shard descriptor: the identity document embedded in every archive.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Immutable identity and metadata of a shard.
///
/// Archives embed this as a TOML document:
///
/// ```toml
/// id = "economy"
/// name = "Economy"
/// version = "2.1.0"
/// description = "Balances and shops"
/// authors = ["someone"]
/// dependencies = ["storage-core"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Unique, stable id matching `[0-9a-z-]+`
    pub id: String,
    /// Human readable name
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub authors: Vec<String>,
    /// Ids of shards that must be active before this one sets up, in declaration order
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Reasons a descriptor document is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("descriptor is not valid TOML: {0}")]
    Parse(String),
    #[error("invalid shard id '{0}': ids must match [0-9a-z-]+")]
    InvalidId(String),
    #[error("descriptor field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("invalid dependency id '{0}': ids must match [0-9a-z-]+")]
    InvalidDependencyId(String),
}

impl ShardDescriptor {
    /// Parses and validates a TOML descriptor document.
    pub fn parse(document: &str) -> Result<Self, DescriptorError> {
        let descriptor: ShardDescriptor =
            toml::from_str(document).map_err(|e| DescriptorError::Parse(e.message().to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !is_valid_shard_id(&self.id) {
            return Err(DescriptorError::InvalidId(self.id.clone()));
        }
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyField("name"));
        }
        if self.version.trim().is_empty() {
            return Err(DescriptorError::EmptyField("version"));
        }
        if let Some(bad) = self.dependencies.iter().find(|id| !is_valid_shard_id(id)) {
            return Err(DescriptorError::InvalidDependencyId(bad.clone()));
        }
        Ok(())
    }

    pub fn depends_on(&self, id: &str) -> bool {
        self.dependencies.iter().any(|dep| dep == id)
    }
}

/// Checks a shard id against `[0-9a-z-]+`.
pub fn is_valid_shard_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase() || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let descriptor = ShardDescriptor::parse(
            r#"
            id = "economy"
            name = "Economy"
            version = "2.1.0"
            description = "Balances and shops"
            authors = ["a", "b"]
            dependencies = ["storage-core", "perms"]
            "#,
        )
        .unwrap();

        assert_eq!(descriptor.id, "economy");
        assert_eq!(descriptor.dependencies, vec!["storage-core", "perms"]);
        assert!(descriptor.depends_on("perms"));
        assert!(!descriptor.depends_on("economy"));
    }

    #[test]
    fn test_optional_fields_default() {
        let descriptor =
            ShardDescriptor::parse("id = \"a\"\nname = \"A\"\nversion = \"1\"").unwrap();
        assert!(descriptor.dependencies.is_empty());
        assert!(descriptor.description.is_empty());
    }

    #[test]
    fn test_invalid_ids_rejected() {
        for id in ["", "Upper", "with_underscore", "sp ace", "dot.ted"] {
            assert!(!is_valid_shard_id(id), "{id:?} should be rejected");
        }
        for id in ["a", "a-b", "0-9", "shard-42"] {
            assert!(is_valid_shard_id(id), "{id:?} should be accepted");
        }

        let err = ShardDescriptor::parse("id = \"Bad\"\nname = \"B\"\nversion = \"1\"").unwrap_err();
        assert_eq!(err, DescriptorError::InvalidId("Bad".to_string()));

        let err = ShardDescriptor::parse(
            "id = \"ok\"\nname = \"B\"\nversion = \"1\"\ndependencies = [\"No\"]",
        )
        .unwrap_err();
        assert_eq!(err, DescriptorError::InvalidDependencyId("No".to_string()));
    }

    #[test]
    fn test_unparsable_document() {
        assert!(matches!(
            ShardDescriptor::parse("id = "),
            Err(DescriptorError::Parse(_))
        ));
        assert!(matches!(
            ShardDescriptor::parse("name = \"missing id\""),
            Err(DescriptorError::Parse(_))
        ));
    }
}
