//! Shared-lock reads built on `fs2` advisory locks.
//!
//! Snapshots are written by the coordinator through an atomic
//! temp-file-then-rename, but may be read by external reporters while a
//! run is in flight. Readers take a shared advisory lock so a cooperating
//! writer holding an exclusive lock is never interleaved with.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Read file contents under a shared lock. Concurrent readers are fine;
/// blocks while an exclusive lock is held.
pub fn locked_read(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    file.lock_shared()
        .with_context(|| format!("Failed to acquire shared lock: {}", path.display()))?;
    let mut content = String::new();
    BufReader::new(&file)
        .read_to_string(&mut content)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    Ok(content)
}
