//! SHA-256 helpers shared by the journal, sealer and evidence index

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::canonical::canonical_bytes;
use crate::Result;

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Lowercase hex SHA-256 of the canonical form of a value
pub fn sha256_canonical<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Stream a file through SHA-256, returning its hex digest and size in bytes
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_file_matches_in_memory() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob.bin");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();

        let (digest, size) = hash_file(&path).unwrap();
        assert_eq!(digest, sha256_hex(&data));
        assert_eq!(size, 200_000);
    }
}
