//! The local artifact cache, laid out like a remote repository.

use super::checksum::ChecksumAlgorithm;
use super::ResolutionCause;
use shard_api::Coordinate;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Result of looking an artifact up in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedArtifact {
    /// Present and matching its cached checksum
    Verified(PathBuf),
    /// Present but without a usable checksum sidecar
    Unverified(PathBuf),
    Missing,
}

#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, coordinate: &Coordinate) -> PathBuf {
        coordinate
            .repository_path()
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    pub fn sidecar_path(artifact: &Path, algorithm: ChecksumAlgorithm) -> PathBuf {
        let mut name = artifact.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(algorithm.extension());
        artifact.with_file_name(name)
    }

    /// Looks a coordinate up and verifies it against its cached sidecar.
    ///
    /// A cached artifact whose digest differs from its sidecar is a hard
    /// [`ResolutionCause::ChecksumMismatch`], never a silent refetch.
    pub async fn lookup(&self, coordinate: &Coordinate) -> Result<CachedArtifact, ResolutionCause> {
        let path = self.artifact_path(coordinate);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(CachedArtifact::Missing);
        }

        for algorithm in ChecksumAlgorithm::PREFERRED {
            let sidecar = Self::sidecar_path(&path, algorithm);
            let Ok(body) = tokio::fs::read_to_string(&sidecar).await else {
                continue;
            };
            let Some(expected) = algorithm.parse_sidecar(&body) else {
                debug!("Ignoring unreadable checksum sidecar {}", sidecar.display());
                continue;
            };

            let bytes = tokio::fs::read(&path).await.map_err(|e| ResolutionCause::Io(e.to_string()))?;
            let actual = algorithm.digest_hex(&bytes);
            if actual != expected {
                return Err(ResolutionCause::ChecksumMismatch {
                    location: path.display().to_string(),
                    expected,
                    actual,
                });
            }
            return Ok(CachedArtifact::Verified(path));
        }

        Ok(CachedArtifact::Unverified(path))
    }

    /// Writes a verified artifact and its sidecar into the cache.
    ///
    /// Every write goes through its own temporary file in the target
    /// directory, so sessions storing the same coordinate concurrently never
    /// see each other's partial files. Losing a race to a writer that already
    /// placed identical bytes counts as success.
    pub async fn store(
        &self,
        coordinate: &Coordinate,
        bytes: &[u8],
        algorithm: ChecksumAlgorithm,
        checksum: &str,
    ) -> Result<PathBuf, ResolutionCause> {
        let io = |e: std::io::Error| ResolutionCause::Io(e.to_string());
        let path = self.artifact_path(coordinate);
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&parent).await.map_err(io)?;

        let artifact = bytes.to_vec();
        let sidecar = checksum.as_bytes().to_vec();
        let sidecar_path = Self::sidecar_path(&path, algorithm);
        let expected = checksum.to_string();
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), ResolutionCause> {
            if let Err(e) = write_atomic(&parent, &target, &artifact) {
                if !already_stored(&target, algorithm, &expected) {
                    return Err(ResolutionCause::Io(e.to_string()));
                }
                debug!("{} was stored concurrently", target.display());
            }
            for stale in ChecksumAlgorithm::PREFERRED {
                if stale != algorithm {
                    let _ = std::fs::remove_file(Self::sidecar_path(&target, stale));
                }
            }
            write_atomic(&parent, &sidecar_path, &sidecar).map_err(io)
        })
        .await
        .map_err(|e| ResolutionCause::Io(format!("cache writer failed: {}", e)))??;

        Ok(path)
    }
}

fn write_atomic(directory: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tempfile::NamedTempFile::new_in(directory)?;
    file.write_all(bytes)?;
    file.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn already_stored(target: &Path, algorithm: ChecksumAlgorithm, expected: &str) -> bool {
    std::fs::read(target)
        .map(|bytes| algorithm.digest_hex(&bytes) == expected)
        .unwrap_or(false)
}
