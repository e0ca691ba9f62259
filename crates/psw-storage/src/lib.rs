pub mod cache;
pub mod lock;
pub mod recent;

pub use cache::{CacheStore, RebuildReport, RepairReport};
pub use lock::{FileLock, InstanceLock};
pub use recent::{rank_by_recency, RecencyTracker};

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project not found: {name}")]
    NotFound { name: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Replaces `path` with `contents` through a sibling temp file and a rename,
/// so readers observe either the old or the new file, never a partial one.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "psw".to_string());
    let tmp_path = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Reads a line-oriented state file; a missing file reads as empty.
pub(crate) fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested/table");
        write_atomic(&path, "one\n").expect("first write");
        write_atomic(&path, "two\n").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "two\n");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_file_reads_as_no_lines() {
        let dir = TempDir::new().expect("tempdir");
        assert!(read_lines(&dir.path().join("absent")).expect("read").is_empty());
    }
}
