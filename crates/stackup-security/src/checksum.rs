use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

pub fn verify_sha256(payload: &[u8], expected_hex: &str) -> bool {
    sha256_hex(payload).eq_ignore_ascii_case(expected_hex.trim())
}

pub fn verify_sha256_reader<R: Read>(reader: &mut R, expected_hex: &str) -> Result<bool> {
    let actual = sha256_reader(reader)?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    sha256_reader(&mut reader).with_context(|| format!("failed to hash file: {}", path.display()))
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    Ok(sha256_file(path)?.eq_ignore_ascii_case(expected_hex.trim()))
}

fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).context("failed reading hash input")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn sha256_hex_matches_known_vectors() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
        assert_eq!(sha256_hex(b"abc"), ABC_SHA256);
    }

    #[test]
    fn verify_sha256_is_case_insensitive_and_trims() {
        assert!(verify_sha256(b"abc", &format!(" {} ", ABC_SHA256.to_uppercase())));
        assert!(!verify_sha256(b"abd", ABC_SHA256));
    }

    #[test]
    fn verify_sha256_reader_streams_input() {
        let mut reader = std::io::Cursor::new(b"abc".to_vec());
        assert!(verify_sha256_reader(&mut reader, ABC_SHA256).expect("must hash"));
    }

    #[test]
    fn verify_sha256_file_reads_from_disk() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("stackup-checksum-{nanos}.bin"));
        std::fs::write(&path, b"abc").expect("must write");

        assert!(verify_sha256_file(&path, ABC_SHA256).expect("must hash"));
        assert!(!verify_sha256_file(&path, EMPTY_SHA256).expect("must hash"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sha256_file_errors_for_missing_path() {
        let missing = std::env::temp_dir().join("stackup-checksum-missing/none.bin");
        assert!(sha256_file(&missing).is_err());
    }
}
