use anyhow::Context;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?} for hashing", path))?;
    Ok(sha256_hex(&data))
}

/// Combined hash of several files, order-sensitive. Missing files hash as empty.
pub fn sha256_files(paths: &[&Path]) -> anyhow::Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        if path.exists() {
            hasher.update(std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?);
        }
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
