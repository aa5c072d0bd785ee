//! SHA-256 helpers used for snapshot identity and table comparison.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FeedError, Result};

/// Size and checksum of a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

/// Streams `path` through SHA-256.
pub fn digest_file(path: &Path) -> Result<FileDigest> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FeedError::NotFound(path.to_path_buf()),
        _ => FeedError::Io(e),
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let size = io::copy(&mut reader, &mut hasher)?;
    Ok(FileDigest {
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}
