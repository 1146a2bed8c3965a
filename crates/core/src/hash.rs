//! BLAKE3 checksums for finished containers

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Digest and size of a file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex BLAKE3
    pub blake3: String,
    pub len: u64,
}

/// Hash a file using BLAKE3 (streaming for large files)
pub fn hash_file(path: &Path) -> std::io::Result<FileDigest> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut len = 0u64;

    let mut buffer = [0u8; 64 * 1024];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        len += bytes_read as u64;
    }

    Ok(FileDigest {
        blake3: hasher.finalize().to_hex().to_string(),
        len,
    })
}
