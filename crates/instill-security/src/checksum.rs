use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Streams `reader` through SHA-256 and returns the lowercase hex digest.
pub fn sha256_reader_hex<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buf)
            .context("failed reading payload for sha256")?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<()> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let actual = sha256_reader_hex(BufReader::new(file))
        .with_context(|| format!("failed hashing {}", path.display()))?;
    if !actual.eq_ignore_ascii_case(expected_hex.trim()) {
        return Err(anyhow!(
            "sha256 mismatch for {}: expected {}, got {}",
            path.display(),
            expected_hex.trim(),
            actual
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn sha256_of_empty_payload_matches_known_digest() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }

    #[test]
    fn sha256_reader_matches_slice_digest() {
        let payload = b"instill payload".to_vec();
        let streamed = sha256_reader_hex(payload.as_slice()).expect("hashing must complete");
        assert_eq!(streamed, sha256_hex(&payload));
    }

    #[test]
    fn verify_sha256_file_reports_mismatch_with_path() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("instill-security-{nanos}.bin"));
        std::fs::write(&path, b"abc").expect("must write payload");

        let err = verify_sha256_file(&path, EMPTY_SHA256).expect_err("digest must mismatch");
        assert!(err.to_string().contains("sha256 mismatch"), "unexpected error: {err}");
        verify_sha256_file(&path, &sha256_hex(b"abc").to_ascii_uppercase())
            .expect("digest comparison ignores case");

        let _ = std::fs::remove_file(&path);
    }
}
