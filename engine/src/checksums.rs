//! Content digests for post-copy integrity verification.
//!
//! Files are hashed in streaming fashion (64 KB reads), so file size is not
//! bounded by memory. MD5 is the default because it is what existing snapshot
//! stores hold; SHA-256 and BLAKE3 are available per profile.

use crate::error::{EngineError, Result};
use crate::fs_ops;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const READ_BUFFER: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(EngineError::Config(format!(
                "unknown hash algorithm '{}' (expected md5, sha256 or blake3)",
                other
            ))),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Digest equality, ignoring hex case.
    pub fn matches(&self, other: &ChecksumValue) -> bool {
        self.algorithm == other.algorithm && self.hex.eq_ignore_ascii_case(&other.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Trait for incremental digest computation
pub trait ChecksumHasher {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute the digest of a whole file.
///
/// The file is opened with shared read access so a file held open by another
/// process can still be hashed.
pub fn compute_file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<ChecksumValue> {
    let mut file = fs_ops::open_shared_read(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok(hasher.finalize())
}

/// Hash `source` and `destination` and fail if they differ.
///
/// Returns the source digest on success.
pub fn verify_copy(
    source: &Path,
    destination: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue> {
    let source_checksum = compute_file_checksum(source, algorithm)?;
    let dest_checksum = compute_file_checksum(destination, algorithm)?;

    if source_checksum.matches(&dest_checksum) {
        Ok(source_checksum)
    } else {
        Err(EngineError::VerificationFailed {
            path: destination.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_algorithm_display_and_parse() {
        for algo in [ChecksumAlgorithm::Md5, ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Blake3] {
            assert_eq!(algo.to_string().parse::<ChecksumAlgorithm>().unwrap(), algo);
        }
        assert_eq!("SHA256".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha256);
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn test_md5_known_value() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Md5);
        hasher.update(b"hello");
        assert_eq!(hasher.finalize().hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_known_value() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Sha256);
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(
            hasher.finalize().hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_blake3_incremental_equals_oneshot() {
        let mut split = create_hasher(ChecksumAlgorithm::Blake3);
        split.update(b"hel");
        split.update(b"lo");
        assert_eq!(split.finalize().hex(), blake3::hash(b"hello").to_hex().as_str());
    }

    #[test]
    fn test_matches_ignores_hex_case() {
        let lower = ChecksumValue::new(ChecksumAlgorithm::Md5, "abcdef".into());
        let upper = ChecksumValue::new(ChecksumAlgorithm::Md5, "ABCDEF".into());
        assert!(lower.matches(&upper));
        let other_algo = ChecksumValue::new(ChecksumAlgorithm::Sha256, "abcdef".into());
        assert!(!lower.matches(&other_algo));
    }

    #[test]
    fn test_file_checksum_spans_multiple_buffers() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("big.bin");
        let data: Vec<u8> = (0..(READ_BUFFER * 3 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).expect("Failed to write file");

        let from_file = compute_file_checksum(&path, ChecksumAlgorithm::Md5).expect("hash");
        assert_eq!(from_file.hex(), format!("{:x}", md5::compute(&data)));
    }

    #[test]
    fn test_verify_copy_match_and_mismatch() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.txt");
        let same = temp_dir.path().join("same.txt");
        let different = temp_dir.path().join("different.txt");
        fs::write(&src, b"identical content").unwrap();
        fs::write(&same, b"identical content").unwrap();
        fs::write(&different, b"other content").unwrap();

        let digest = verify_copy(&src, &same, ChecksumAlgorithm::Sha256).expect("should match");
        assert_eq!(digest.algorithm(), ChecksumAlgorithm::Sha256);

        let err = verify_copy(&src, &different, ChecksumAlgorithm::Sha256).unwrap_err();
        assert!(matches!(err, EngineError::VerificationFailed { .. }));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let err = compute_file_checksum(&temp_dir.path().join("nope"), ChecksumAlgorithm::Md5)
            .unwrap_err();
        assert!(matches!(err, EngineError::ReadError { .. }));
    }
}
