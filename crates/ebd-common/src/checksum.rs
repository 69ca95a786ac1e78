//! SHA-256 digests for published artifacts

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Digest and length of a finished file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256
    pub sha256: String,
    pub size: u64,
}

/// Hash a reader to completion, returning the hex digest and byte count
pub fn digest_reader<R: Read>(reader: &mut R) -> Result<FileDigest> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut size = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileDigest {
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

pub fn digest_file(path: impl AsRef<Path>) -> Result<FileDigest> {
    let mut file = std::fs::File::open(path)?;
    digest_reader(&mut file)
}

/// Digest of an in-memory buffer
pub fn digest_bytes(bytes: &[u8]) -> FileDigest {
    FileDigest {
        sha256: hex::encode(Sha256::digest(bytes)),
        size: bytes.len() as u64,
    }
}
