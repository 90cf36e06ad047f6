//! Artifact checksum sidecars.

use sha2::Digest;

/// Digest algorithms accepted for artifact verification, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha512,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Order in which sidecars are looked for.
    pub const PREFERRED: [ChecksumAlgorithm; 2] = [ChecksumAlgorithm::Sha512, ChecksumAlgorithm::Sha256];

    /// Sidecar file extension, appended to the artifact name.
    pub fn extension(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha512 => "sha512",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Lowercase hex digest of `bytes`.
    pub fn digest_hex(self, bytes: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Sha512 => hex::encode(sha2::Sha512::digest(bytes)),
            ChecksumAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(bytes)),
        }
    }

    fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha512 => 128,
            ChecksumAlgorithm::Sha256 => 64,
        }
    }

    /// Extracts the digest from a sidecar body.
    ///
    /// Repositories publish either the bare digest or `digest  file-name`.
    pub fn parse_sidecar(self, body: &str) -> Option<String> {
        let digest = body.split_whitespace().next()?.to_ascii_lowercase();
        let valid = digest.len() == self.hex_len() && digest.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then_some(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            ChecksumAlgorithm::Sha256.digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(ChecksumAlgorithm::Sha512.digest_hex(b"abc").len(), 128);
    }

    #[test]
    fn test_sidecar_formats() {
        let digest = ChecksumAlgorithm::Sha256.digest_hex(b"payload");
        let upper = digest.to_ascii_uppercase();

        assert_eq!(ChecksumAlgorithm::Sha256.parse_sidecar(&digest), Some(digest.clone()));
        assert_eq!(
            ChecksumAlgorithm::Sha256.parse_sidecar(&format!("{}  lib-1.0.jar\n", upper)),
            Some(digest.clone())
        );
        assert_eq!(ChecksumAlgorithm::Sha256.parse_sidecar("not-a-digest"), None);
        assert_eq!(ChecksumAlgorithm::Sha512.parse_sidecar(&digest), None);
        assert_eq!(ChecksumAlgorithm::Sha256.parse_sidecar(""), None);
    }
}
