//! Runtime library declarations.
//!
//! Shards do not bundle their third-party libraries. During pre-setup a shard
//! declares a [`DependencyLoader`]; the host runs it against a fresh resolver
//! session and appends the resolved files to the shard's loader.

use crate::error::ShardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A Maven-style artifact coordinate.
///
/// Textual form: `group:artifact[:extension[:classifier]]:version`, extension
/// defaulting to `jar`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    pub group: String,
    pub artifact: String,
    pub extension: String,
    pub classifier: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinateError {
    #[error("invalid coordinate '{0}': expected group:artifact[:extension[:classifier]]:version")]
    Malformed(String),
    #[error("coordinate '{0}' has an empty segment")]
    EmptySegment(String),
}

impl Coordinate {
    pub const DEFAULT_EXTENSION: &'static str = "jar";

    pub fn new(
        group: impl Into<String>,
        artifact: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            artifact: artifact.into(),
            extension: Self::DEFAULT_EXTENSION.to_string(),
            classifier: None,
            version: version.into(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_classifier(mut self, classifier: impl Into<String>) -> Self {
        self.classifier = Some(classifier.into());
        self
    }

    /// `artifact-version[-classifier].extension`
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.artifact, self.version, classifier, self.extension
            ),
            None => format!("{}-{}.{}", self.artifact, self.version, self.extension),
        }
    }

    /// Relative path in the standard repository layout, `/` separated.
    pub fn repository_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.file_name()
        )
    }
}

impl FromStr for Coordinate {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.iter().any(|part| part.trim().is_empty()) {
            return Err(CoordinateError::EmptySegment(s.to_string()));
        }

        let coordinate = match parts.as_slice() {
            [group, artifact, version] => Coordinate::new(*group, *artifact, *version),
            [group, artifact, extension, version] => {
                Coordinate::new(*group, *artifact, *version).with_extension(*extension)
            }
            [group, artifact, extension, classifier, version] => {
                Coordinate::new(*group, *artifact, *version)
                    .with_extension(*extension)
                    .with_classifier(*classifier)
            }
            _ => return Err(CoordinateError::Malformed(s.to_string())),
        };
        Ok(coordinate)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.artifact)?;
        match &self.classifier {
            Some(classifier) => write!(f, ":{}:{}", self.extension, classifier)?,
            None if self.extension != Self::DEFAULT_EXTENSION => write!(f, ":{}", self.extension)?,
            None => {}
        }
        write!(f, ":{}", self.version)
    }
}

/// A remote artifact repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRepository {
    /// Base URL, always ending in `/`
    pub url: String,
}

impl RemoteRepository {
    pub const MAVEN_CENTRAL_URL: &'static str = "https://repo1.maven.org/maven2/";

    pub fn new(url: impl Into<String>) -> Self {
        let mut url = url.into().trim().to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        Self { url }
    }

    pub fn maven_central() -> Self {
        Self::new(Self::MAVEN_CENTRAL_URL)
    }

    pub fn artifact_url(&self, relative_path: &str) -> String {
        format!("{}{}", self.url, relative_path.trim_start_matches('/'))
    }
}

impl fmt::Display for RemoteRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// The declaration surface handed to a [`DependencyLoader`].
pub trait DependencyCollector: Send {
    fn add_dependency(&mut self, coordinate: Coordinate) -> Result<(), ShardError>;

    fn add_repository(&mut self, repository: RemoteRepository) -> Result<(), ShardError>;
}

impl dyn DependencyCollector + '_ {
    /// Parses and declares a textual coordinate.
    pub fn dependency(&mut self, coordinate: &str) -> Result<(), ShardError> {
        let coordinate = coordinate
            .parse::<Coordinate>()
            .map_err(|e| ShardError::Dependency(e.to_string()))?;
        self.add_dependency(coordinate)
    }

    pub fn repository(&mut self, url: &str) -> Result<(), ShardError> {
        self.add_repository(RemoteRepository::new(url))
    }
}

/// Declares the libraries a shard needs at runtime.
pub trait DependencyLoader: Send + Sync {
    fn load_dependencies(&self, collector: &mut dyn DependencyCollector) -> Result<(), ShardError>;
}
