use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Read size used while streaming a file through the digest.
pub const HASH_BLOCK_BYTES: usize = 4096;

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Lowercase hex SHA-256 of the file at `path`, read in fixed blocks.
pub fn sha256_file_hex(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; HASH_BLOCK_BYTES];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// True iff the file exists and its digest matches `expected_hex`
/// (case-insensitive). I/O failures are reported as a mismatch.
pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> bool {
    let actual = match sha256_file_hex(path) {
        Ok(actual) => actual,
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "hash verification could not read file");
            return false;
        }
    };

    let matches = actual.eq_ignore_ascii_case(expected_hex.trim());
    if !matches {
        tracing::warn!(
            path = %path.display(),
            expected = expected_hex,
            actual = %actual,
            "sha256 mismatch"
        );
    }
    matches
}
