//! fsync primitives backing the atomic write path.
//!
//! Durability takes two syncs, not one: the file's contents, and the parent
//! directory entry. A rename that was never followed by a directory fsync
//! can revert after a power loss even though the renamed file's bytes made
//! it to disk.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Flushes a file's contents and metadata to disk (`fsync(2)`).
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Makes the directory's entries durable.
///
/// Called after creating or renaming a file inside `dir_path`; until then
/// the new entry only exists in the page cache.
///
/// # Errors
///
/// Fails if the path cannot be opened or the sync call fails.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    // A read-only handle is enough to fsync a directory.
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}
