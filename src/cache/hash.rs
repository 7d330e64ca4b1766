// src/cache/hash.rs

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use blake3::Hasher;

/// Compute the hex checksum of a single file.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("opening file for hashing: {:?}", path))?;
    compute_reader_hash(file).with_context(|| format!("hashing {:?}", path))
}

/// Compute the hex checksum of everything `reader` yields.
pub fn compute_reader_hash(mut reader: impl Read) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}
