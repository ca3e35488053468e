//! SHA-256 content digests

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hex SHA-256 digest of an in-memory buffer.
pub fn hex_digest(bytes: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hex SHA-256 digest of a file, streamed rather than read whole.
pub fn hex_digest_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn digest_of_bytes() {
        assert_eq!(
            hex_digest("rem"),
            "8fbd42ad079a6ceeaf6cecc9f333f41f53335eba32cafff07f5c9555680fdce4"
        );
    }

    #[test]
    fn digest_of_file_matches_bytes() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(&mut f, "rem").unwrap();
        let from_file = hex_digest_file(f.path()).unwrap();
        assert_eq!(from_file, hex_digest("rem"));
    }
}
