//! Keeping capture files after a test finishes.
//!
//! Captures normally live in a temp file that is deleted with the test. When
//! `output.keep_captures` is set they are moved under `captures/` and,
//! optionally, zstd-compressed to `{name}.log.zst`.

use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Move a capture temp file to `dest`, compressing it if requested.
///
/// Returns the final path.
pub fn keep_capture(capture: NamedTempFile, dest: &Path, compress: bool) -> std::io::Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if compress {
        let zst = compressed_path(dest);
        compress_into(capture.path(), &zst)?;
        // Dropping the NamedTempFile removes the uncompressed copy.
        drop(capture);
        return Ok(zst);
    }
    capture.persist(dest).map_err(|e| e.error)?;
    Ok(dest.to_path_buf())
}

fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".zst");
    PathBuf::from(name)
}

fn compress_into(src: &Path, dest: &Path) -> std::io::Result<()> {
    let input = std::fs::read(src)?;
    let compressed = zstd::encode_all(input.as_slice(), 3)?;
    std::fs::write(dest, compressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn capture_with(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_keep_uncompressed() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("captures/CL_DEVICE_TYPE_GPU/Images.log");
        let capture = capture_with("a PASSED\n");
        let tmp_path = capture.path().to_path_buf();

        let kept = keep_capture(capture, &dest, false).unwrap();

        assert_eq!(kept, dest);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "a PASSED\n");
        assert!(!tmp_path.exists());
    }

    #[test]
    fn test_keep_compressed_is_valid_zstd() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("Images.log");
        let original = "line 1\nline 2 FAILED\n";
        let capture = capture_with(original);
        let tmp_path = capture.path().to_path_buf();

        let kept = keep_capture(capture, &dest, true).unwrap();

        assert_eq!(kept, dir.path().join("Images.log.zst"));
        assert!(!dest.exists());
        assert!(!tmp_path.exists());
        let compressed = std::fs::read(&kept).unwrap();
        let decompressed = zstd::decode_all(compressed.as_slice()).unwrap();
        assert_eq!(String::from_utf8(decompressed).unwrap(), original);
    }

    #[test]
    fn test_compressed_path_appends_extension() {
        assert_eq!(
            compressed_path(Path::new("a/b.shard1.log")),
            PathBuf::from("a/b.shard1.log.zst")
        );
    }
}
