//! Integrity: SHA-256 digests for whole files, compared end to end after reassembly.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_BUF: usize = 64 * 1024;

/// Hash a byte slice. Returns 32-byte digest.
pub fn hash_bytes(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Stream a file through SHA-256.
pub fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Verify a file on disk against an expected digest.
pub fn verify_file(path: &Path, expected: &[u8; 32]) -> io::Result<bool> {
    Ok(hash_file(path)? == *expected)
}

/// Short hex prefix of a digest, for log lines.
pub fn short_hex(digest: &[u8; 32]) -> String {
    digest[..6].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_digest_matches_byte_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..(READ_BUF * 2 + 17)).map(|i| (i % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
        assert!(verify_file(&path, &hash_bytes(&data)).unwrap());
    }

    #[test]
    fn verify_rejects_tampered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        File::create(&path).unwrap().write_all(b"tampered").unwrap();
        assert!(!verify_file(&path, &hash_bytes(b"hello chunk")).unwrap());
    }

    #[test]
    fn empty_file_has_sha256_of_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&[]));
        assert_eq!(short_hex(&hash_bytes(&[])), "e3b0c44298fc");
    }
}
