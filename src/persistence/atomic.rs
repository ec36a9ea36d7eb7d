//! Atomic whole-file writes.
//!
//! Both the pending-webhook queue and the installation token file are small
//! blobs that are loaded and saved as a whole. They are written using the
//! write-to-temp-then-rename pattern:
//!
//! 1. Write to `<name>.tmp`
//! 2. fsync the temp file
//! 3. Rename to `<name>`
//! 4. fsync the directory
//!
//! A concurrent reader therefore always observes either the old or the new
//! contents, never a partial write.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use super::fsync::{fsync_dir, fsync_file};

/// Writes `contents` to `path` atomically.
///
/// The parent directory must exist; create it with `create_dir_all` first.
///
/// # Errors
///
/// Returns an IO error if any step of the write sequence fails. On failure
/// the destination file is untouched (a stale `.tmp` file may remain; it is
/// overwritten by the next attempt).
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(contents)?;
        fsync_file(&file)?;
    }

    std::fs::rename(&tmp_path, path)?;
    fsync_dir(dir)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.json");

        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn overwrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.json");

        write_atomic(&path, b"data").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn fails_on_missing_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("blob.json");

        assert!(write_atomic(&path, b"data").is_err());
    }

    proptest! {
        /// Arbitrary payloads survive the write sequence byte-for-byte.
        #[test]
        fn arbitrary_payload_roundtrips(payload in prop::collection::vec(any::<u8>(), 0..2000)) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("blob.bin");

            write_atomic(&path, &payload).unwrap();
            prop_assert_eq!(std::fs::read(&path).unwrap(), payload);
        }

        /// A stale temp file from a crashed previous attempt never corrupts
        /// the next write.
        #[test]
        fn stale_temp_file_is_harmless(
            stale in prop::collection::vec(any::<u8>(), 0..100),
            payload in prop::collection::vec(any::<u8>(), 0..100),
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("blob.bin");

            std::fs::write(path.with_extension("tmp"), &stale).unwrap();
            write_atomic(&path, &payload).unwrap();
            prop_assert_eq!(std::fs::read(&path).unwrap(), payload);
        }
    }
}
