//! Checksum utilities for file verification
//!
//! SHA-256 (hex) is the integrity checksum recorded in manifests and state;
//! MD5 (base64) is only produced for transport-level `Content-MD5` assertions.

use crate::error::{CommonError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Digests of one piece of content, computed in a single pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigests {
    /// Lowercase hex SHA-256
    pub sha256_hex: String,
    /// Base64 MD5, as expected by the `Content-MD5` header
    pub md5_base64: String,
    /// Content length in bytes
    pub size: u64,
}

/// Compute SHA-256 of in-memory bytes
pub fn compute_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA-256 for any readable source
pub fn compute_reader_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA-256 of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_reader_checksum(&mut file)
}

/// Compute SHA-256, MD5 and size of a file in a single pass
pub fn compute_file_digests(path: impl AsRef<Path>) -> Result<ContentDigests> {
    let mut file = std::fs::File::open(path)?;
    let mut sha256 = Sha256::new();
    let mut md5 = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        sha256.update(&buffer[..bytes_read]);
        md5.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(ContentDigests {
        sha256_hex: hex::encode(sha256.finalize()),
        md5_base64: BASE64.encode(md5.finalize()),
        size,
    })
}

/// Base64 MD5 of in-memory bytes (one multipart part, a probe body)
pub fn md5_base64(data: &[u8]) -> String {
    BASE64.encode(Md5::digest(data))
}

/// Verify that a file matches the expected SHA-256
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let path = path.as_ref();
    let actual = compute_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            subject: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Whether `value` looks like a hex SHA-256 digest
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
