//! Content hashing for end-to-end transfer integrity
//!
//! Both directions feed chunks into a [`ContentHasher`] in stream order and
//! finalize once at end-of-stream. Digests are SHA-256, rendered as lowercase
//! hex for the wire and the namespace table.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::Result;

/// Read buffer used when hashing a file from disk.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Incremental SHA-256 digest.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
    absorbed: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb the next chunk of the stream.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.absorbed += chunk.len() as u64;
    }

    /// Bytes absorbed so far.
    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }

    /// Finalize into a lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Digest of an in-memory byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Digest of a file's current contents, streamed from disk.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Case-insensitive comparison of two hex digests.
pub fn digests_match(claimed: &str, computed: &str) -> bool {
    claimed.eq_ignore_ascii_case(computed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn known_digest() {
        assert_eq!(hash_bytes(b"hello"), HELLO_SHA256);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"he");
        hasher.update(b"");
        hasher.update(b"llo");
        assert_eq!(hasher.absorbed(), 5);
        assert_eq!(hasher.finalize_hex(), HELLO_SHA256);
    }

    #[test]
    fn empty_stream_digest() {
        assert_eq!(
            ContentHasher::new().finalize_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(hash_file(&path).await.unwrap(), HELLO_SHA256);
    }

    #[test]
    fn digest_comparison_ignores_case() {
        assert!(digests_match(&HELLO_SHA256.to_uppercase(), HELLO_SHA256));
        assert!(!digests_match("00", HELLO_SHA256));
    }
}
