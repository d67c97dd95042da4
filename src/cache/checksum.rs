//! SHA-256 verification of cached files.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::CfdevError;

/// Hex-encoded SHA-256 of a file, hashed on the blocking pool so
/// multi-gigabyte images don't stall the runtime.
pub async fn sha256_file(path: &Path) -> Result<String, CfdevError> {
    let owned: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&owned)
            .map_err(|e| CfdevError::io(format!("opening {}", owned.display()), e))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)
            .map_err(|e| CfdevError::io(format!("hashing {}", owned.display()), e))?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| CfdevError::io("hashing task failed", std::io::Error::other(e)))?
}

/// Hex-encoded SHA-256 of an in-memory buffer.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
