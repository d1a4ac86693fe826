//! Checksum utilities for source file fingerprinting

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the hex SHA-256 digest of a file's bytes
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Compute the hex SHA-256 digest of any readable source
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA-256 digest of an in-memory buffer
pub fn sha256_bytes(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::CommonError;
    use proptest::prelude::*;
    use std::io::{Cursor, Write};

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_reader() {
        let mut cursor = Cursor::new(b"hello world");
        assert_eq!(sha256_reader(&mut cursor).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_sha256_bytes() {
        assert_eq!(sha256_bytes("hello world"), HELLO_WORLD);
    }

    #[test]
    fn test_sha256_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        assert_eq!(sha256_file(file.path()).unwrap(), HELLO_WORLD);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = sha256_file("/nonexistent/osha/source.xlsx").unwrap_err();
        assert!(matches!(err, CommonError::Io(_)));
    }

    proptest! {
        #[test]
        fn streaming_matches_in_memory(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let mut cursor = Cursor::new(data.clone());
            prop_assert_eq!(sha256_reader(&mut cursor).unwrap(), sha256_bytes(&data));
        }
    }
}
