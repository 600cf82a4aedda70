//! Shared helpers for reading query and database files.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Open a file into a buffered reader, decompressing transparently when
/// the extension says gzip.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let gzipped = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    Ok(if gzipped {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "PEPTIDE\n").unwrap();

        let mut lines = open_reader(&path).unwrap().lines();
        assert_eq!(lines.next().unwrap().unwrap(), "PEPTIDE");
    }

    #[test]
    fn test_gz_extension_decompresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt.GZ");
        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(b"PEPTIDE\n").unwrap();
        enc.finish().unwrap();

        let mut lines = open_reader(&path).unwrap().lines();
        assert_eq!(lines.next().unwrap().unwrap(), "PEPTIDE");
    }

    #[test]
    fn test_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_reader(&dir.path().join("nope.txt")).is_err());
    }
}
