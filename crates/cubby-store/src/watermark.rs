//! Persistence of the migration watermark.
//!
//! The watermark is the version number of the most recently applied
//! migration unit, stored across restarts as a single integer in a
//! plain text file. A missing file means no migration has ever been
//! applied.

use std::fs;
use std::io;
use std::path::Path;

/// Reads the persisted watermark, or `-1` if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or does not
/// hold a single integer.
pub fn read_watermark(path: &Path) -> io::Result<i64> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(-1),
        Err(err) => return Err(err),
    };
    text.trim().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("watermark file {} is not an integer", path.display()),
        )
    })
}

/// Persists the watermark.
pub fn write_watermark(path: &Path, version: i64) -> io::Result<()> {
    fs::write(path, version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_minus_one() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let version = read_watermark(&dir.path().join("absent")).expect("read should succeed");
        assert_eq!(version, -1);
    }

    #[test]
    fn written_watermark_reads_back() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("state");
        write_watermark(&path, 7).expect("write should succeed");
        assert_eq!(read_watermark(&path).expect("read should succeed"), 7);
    }

    #[test]
    fn garbage_contents_are_an_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("state");
        std::fs::write(&path, "seven").expect("should write fixture");
        assert!(read_watermark(&path).is_err());
    }
}
