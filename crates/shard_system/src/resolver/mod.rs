//! Library Resolver: turns declared coordinates into verified local files.
//!
//! A [`LibraryResolver`] is one resolution session. Coordinates and
//! repositories are collected, each tagged with the shard that asked for it,
//! then [`resolve`](LibraryResolver::resolve) makes exactly one attempt: local
//! cache first, then every repository in order. Retrying is the caller's
//! business and always uses a fresh session.
//!
//! Checksums are mandatory. An artifact without a published checksum, or
//! whose bytes do not match it, fails resolution.

mod cache;
mod checksum;
mod fetch;

pub use cache::{CachedArtifact, LocalRepository};
pub use checksum::ChecksumAlgorithm;
pub use fetch::{ArtifactFetcher, FetchError, HttpFetcher, MemoryFetcher};

use shard_api::{Coordinate, DependencyCollector, RemoteRepository, ShardError};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Resolver settings shared by every session.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Local artifact cache, consulted before any repository
    pub local_repository: PathBuf,
    /// Repositories tried after the ones a shard declares
    pub default_repositories: Vec<RemoteRepository>,
    /// Resolution attempts per shard; only transport failures are retried
    pub attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            local_repository: PathBuf::from("libraries"),
            default_repositories: vec![RemoteRepository::maven_central()],
            attempts: 3,
            retry_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Why one coordinate could not be resolved.
#[derive(Debug, Clone, Error)]
pub enum ResolutionCause {
    #[error("not found in any repository (tried {})", tried.join(", "))]
    NotFound { tried: Vec<String> },
    #[error("checksum mismatch for {location}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        location: String,
        expected: String,
        actual: String,
    },
    #[error("no checksum published for {url}")]
    MissingChecksum { url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("resolver session was already resolved")]
    SessionConsumed,
}

/// Resolution failure for one coordinate.
#[derive(Debug, Clone, Error)]
#[error("failed to resolve {coordinate}: {cause}")]
pub struct DependencyResolutionError {
    pub coordinate: String,
    /// Shard that declared the coordinate
    pub requester: Option<String>,
    #[source]
    pub cause: ResolutionCause,
}

impl DependencyResolutionError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.cause, ResolutionCause::Transport(_))
    }
}

/// A dependency declaration pending in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyDeclaration {
    pub coordinate: Coordinate,
    pub requester: String,
}

/// One single-use resolution session.
pub struct LibraryResolver {
    cache: LocalRepository,
    default_repositories: Vec<RemoteRepository>,
    fetcher: Arc<dyn ArtifactFetcher>,
    dependencies: Vec<DependencyDeclaration>,
    repositories: Vec<(RemoteRepository, String)>,
    consumed: bool,
}

impl LibraryResolver {
    pub fn new(config: &ResolverConfig, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            cache: LocalRepository::new(&config.local_repository),
            default_repositories: config.default_repositories.clone(),
            fetcher,
            dependencies: Vec::new(),
            repositories: Vec::new(),
            consumed: false,
        }
    }

    pub fn add_dependency(&mut self, coordinate: Coordinate, requester: &str) -> Result<(), ResolutionCause> {
        if self.consumed {
            return Err(ResolutionCause::SessionConsumed);
        }
        debug!("{} requested dependency {}", requester, coordinate);
        self.dependencies.push(DependencyDeclaration {
            coordinate,
            requester: requester.to_string(),
        });
        Ok(())
    }

    pub fn add_repository(&mut self, repository: RemoteRepository, requester: &str) -> Result<(), ResolutionCause> {
        if self.consumed {
            return Err(ResolutionCause::SessionConsumed);
        }
        debug!("{} added repository {}", requester, repository);
        self.repositories.push((repository, requester.to_string()));
        Ok(())
    }

    pub fn pending(&self) -> &[DependencyDeclaration] {
        &self.dependencies
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    /// Declaration surface for one requesting shard.
    pub fn collector<'a>(&'a mut self, requester: &'a str) -> SessionCollector<'a> {
        SessionCollector {
            resolver: self,
            requester,
        }
    }

    /// Declared repositories first, then the defaults, without duplicates.
    fn repository_order(&self) -> Vec<RemoteRepository> {
        let mut seen = HashSet::new();
        self.repositories
            .iter()
            .map(|(repository, _)| repository)
            .chain(self.default_repositories.iter())
            .filter(|repository| seen.insert(repository.url.clone()))
            .cloned()
            .collect()
    }

    /// Performs one resolution attempt and consumes the session.
    ///
    /// # Returns
    ///
    /// The local path of every declared artifact, or the first coordinate that
    /// could not be resolved or verified.
    pub async fn resolve(&mut self) -> Result<BTreeSet<PathBuf>, DependencyResolutionError> {
        if self.consumed {
            return Err(DependencyResolutionError {
                coordinate: "<session>".to_string(),
                requester: None,
                cause: ResolutionCause::SessionConsumed,
            });
        }
        self.consumed = true;

        let repositories = self.repository_order();
        let declarations = std::mem::take(&mut self.dependencies);
        let mut seen = HashSet::new();
        let mut resolved = BTreeSet::new();

        for declaration in declarations {
            if !seen.insert(declaration.coordinate.clone()) {
                continue;
            }
            let path = self
                .resolve_one(&declaration.coordinate, &repositories)
                .await
                .map_err(|cause| DependencyResolutionError {
                    coordinate: declaration.coordinate.to_string(),
                    requester: Some(declaration.requester.clone()),
                    cause,
                })?;
            resolved.insert(path);
        }

        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        coordinate: &Coordinate,
        repositories: &[RemoteRepository],
    ) -> Result<PathBuf, ResolutionCause> {
        match self.cache.lookup(coordinate).await? {
            CachedArtifact::Verified(path) => {
                debug!("Using cached {} at {}", coordinate, path.display());
                return Ok(path);
            }
            CachedArtifact::Unverified(path) => {
                debug!(
                    "Cached {} at {} has no checksum, fetching again",
                    coordinate,
                    path.display()
                );
            }
            CachedArtifact::Missing => {}
        }

        let relative = coordinate.repository_path();
        let mut tried = Vec::new();
        let mut transport_error = None;

        for repository in repositories {
            let url = repository.artifact_url(&relative);
            tried.push(repository.url.clone());
            info!("Downloading {}{}", repository.url, relative);

            let bytes = match self.fetcher.fetch(&url).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Fetching {} failed: {}", url, e);
                    transport_error = Some(e.to_string());
                    continue;
                }
            };

            let (algorithm, expected) = self.fetch_checksum(&url).await?;
            let actual = algorithm.digest_hex(&bytes);
            if actual != expected {
                return Err(ResolutionCause::ChecksumMismatch {
                    location: url,
                    expected,
                    actual,
                });
            }
            return self.cache.store(coordinate, &bytes, algorithm, &actual).await;
        }

        Err(match transport_error {
            Some(error) => ResolutionCause::Transport(error),
            None => ResolutionCause::NotFound { tried },
        })
    }

    async fn fetch_checksum(&self, artifact_url: &str) -> Result<(ChecksumAlgorithm, String), ResolutionCause> {
        for algorithm in ChecksumAlgorithm::PREFERRED {
            let url = format!("{}.{}", artifact_url, algorithm.extension());
            match self.fetcher.fetch(&url).await {
                Ok(Some(body)) => match algorithm.parse_sidecar(&String::from_utf8_lossy(&body)) {
                    Some(digest) => return Ok((algorithm, digest)),
                    None => warn!("Ignoring malformed checksum at {}", url),
                },
                Ok(None) => continue,
                Err(e) => return Err(ResolutionCause::Transport(e.to_string())),
            }
        }
        Err(ResolutionCause::MissingChecksum {
            url: artifact_url.to_string(),
        })
    }
}

/// [`DependencyCollector`] view of a session bound to one requester.
pub struct SessionCollector<'a> {
    resolver: &'a mut LibraryResolver,
    requester: &'a str,
}

impl DependencyCollector for SessionCollector<'_> {
    fn add_dependency(&mut self, coordinate: Coordinate) -> Result<(), ShardError> {
        self.resolver
            .add_dependency(coordinate, self.requester)
            .map_err(|e| ShardError::Dependency(e.to_string()))
    }

    fn add_repository(&mut self, repository: RemoteRepository) -> Result<(), ShardError> {
        self.resolver
            .add_repository(repository, self.requester)
            .map_err(|e| ShardError::Dependency(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ResolverConfig {
        ResolverConfig {
            local_repository: dir.path().join("libraries"),
            default_repositories: vec![RemoteRepository::new("https://central.test/maven2")],
            attempts: 1,
            retry_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_resolves_and_caches() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        let coordinate = Coordinate::new("org.test", "lib", "1.0");
        fetcher.publish(&RemoteRepository::new("https://central.test/maven2"), &coordinate, b"lib");

        let mut session = LibraryResolver::new(&config(&dir), fetcher.clone());
        session.add_dependency(coordinate.clone(), "alpha").unwrap();
        session.add_dependency(coordinate.clone(), "alpha").unwrap();
        let first = session.resolve().await.unwrap();
        assert_eq!(first.len(), 1);
        let fetched = fetcher.request_count();

        let mut again = LibraryResolver::new(&config(&dir), fetcher.clone());
        again.add_dependency(coordinate, "alpha").unwrap();
        let second = again.resolve().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.request_count(), fetched, "cache hit must not fetch");
    }

    #[tokio::test]
    async fn test_session_is_single_use() {
        let dir = TempDir::new().unwrap();
        let mut session = LibraryResolver::new(&config(&dir), Arc::new(MemoryFetcher::new()));
        assert!(session.resolve().await.unwrap().is_empty());

        assert!(matches!(
            session.add_dependency(Coordinate::new("g", "a", "1"), "x"),
            Err(ResolutionCause::SessionConsumed)
        ));
        assert!(session.add_repository(RemoteRepository::new("https://r"), "x").is_err());
        assert!(matches!(
            session.resolve().await,
            Err(DependencyResolutionError {
                cause: ResolutionCause::SessionConsumed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_declared_repository_tried_first() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        let private = RemoteRepository::new("https://private.test/repo");
        let coordinate = Coordinate::new("org.private", "thing", "2.0");
        fetcher.publish(&private, &coordinate, b"private bytes");

        let mut session = LibraryResolver::new(&config(&dir), fetcher.clone());
        {
            let mut collector = session.collector("beta");
            collector.add_repository(private.clone()).unwrap();
            collector.add_dependency(coordinate.clone()).unwrap();
        }
        assert_eq!(session.pending()[0].requester, "beta");

        let paths = session.resolve().await.unwrap();
        let path = paths.iter().next().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"private bytes");
    }

    #[tokio::test]
    async fn test_missing_checksum_fails() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        let coordinate = Coordinate::new("org.test", "bare", "1.0");
        fetcher.insert(
            "https://central.test/maven2/org/test/bare/1.0/bare-1.0.jar",
            b"no checksum".to_vec(),
        );

        let mut session = LibraryResolver::new(&config(&dir), fetcher);
        session.add_dependency(coordinate, "alpha").unwrap();
        let error = session.resolve().await.unwrap_err();

        assert!(matches!(error.cause, ResolutionCause::MissingChecksum { .. }));
        assert_eq!(error.requester.as_deref(), Some("alpha"));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_remote_checksum_mismatch_fails() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        let coordinate = Coordinate::new("org.test", "lib", "1.0");
        let url = fetcher.publish(&RemoteRepository::new("https://central.test/maven2"), &coordinate, b"good");
        fetcher.insert(url, b"tampered".to_vec());

        let mut session = LibraryResolver::new(&config(&dir), fetcher);
        session.add_dependency(coordinate.clone(), "alpha").unwrap();
        let error = session.resolve().await.unwrap_err();

        assert!(matches!(error.cause, ResolutionCause::ChecksumMismatch { .. }));
        assert!(!LocalRepository::new(dir.path().join("libraries"))
            .artifact_path(&coordinate)
            .exists());
    }

    #[tokio::test]
    async fn test_not_found_and_transport_errors() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());

        let mut session = LibraryResolver::new(&config(&dir), fetcher.clone());
        session.add_dependency(Coordinate::new("g", "nowhere", "1"), "alpha").unwrap();
        let error = session.resolve().await.unwrap_err();
        assert!(matches!(error.cause, ResolutionCause::NotFound { ref tried } if tried.len() == 1));

        fetcher.fail_next(1);
        let mut session = LibraryResolver::new(&config(&dir), fetcher);
        session.add_dependency(Coordinate::new("g", "nowhere", "1"), "alpha").unwrap();
        let error = session.resolve().await.unwrap_err();
        assert!(error.is_retryable());
    }
}
