use chrono::Utc;
use fs2::FileExt;
use psw_core::Config;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a file. Released on drop, and by the kernel
/// when the owning process dies.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock is granted.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Self::stamp(file, path)
    }

    /// Returns `None` when another holder has the lock.
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Self::stamp(file, path).map(Some)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp(mut file: File, path: &Path) -> io::Result<Self> {
        let metadata = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Guards interactive pick-and-launch flows; never waits.
#[derive(Debug)]
pub struct InstanceLock {
    _lock: FileLock,
}

impl InstanceLock {
    pub fn try_acquire(config: &Config) -> io::Result<Option<Self>> {
        Self::try_acquire_at(&config.instance_lock_path())
    }

    pub fn try_acquire_at(path: &Path) -> io::Result<Option<Self>> {
        Ok(FileLock::try_acquire(path)?.map(|lock| Self { _lock: lock }))
    }
}
