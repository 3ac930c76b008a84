//! Deterministic gzip.
//!
//! Fixed parameters: best compression, mtime 0, no file name, no comment,
//! unknown OS byte. Identical input always yields identical output.

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, Read, Write};
use std::path::Path;

pub fn gzip_deterministic(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(bytes.len() / 4 + 64), Compression::best());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Read a gzip NDJSON file into typed rows. Blank lines are skipped; a
/// malformed line is an error.
pub fn read_gzip_ndjson<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let file = std::fs::File::open(path)?;
    let reader = io::BufReader::new(GzDecoder::new(file));
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(&line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        rows.push(row);
    }
    Ok(rows)
}
