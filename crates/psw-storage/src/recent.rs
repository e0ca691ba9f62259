use crate::lock::FileLock;
use crate::{read_lines, write_atomic, StoreError};
use chrono::Utc;
use psw_core::{Config, RecentEntry};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bounded most-recently-used list, newest first, one entry per project name.
#[derive(Debug, Clone)]
pub struct RecencyTracker {
    path: PathBuf,
    lock_path: PathBuf,
    capacity: usize,
}

impl RecencyTracker {
    pub fn new(config: &Config) -> Self {
        Self::at(config.recent_path(), config.max_recent)
    }

    pub fn at(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            capacity: capacity.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_access(&self, name: &str) -> Result<(), StoreError> {
        self.record_access_at(name, Utc::now().timestamp())
    }

    pub fn record_access_at(&self, name: &str, timestamp: i64) -> Result<(), StoreError> {
        let _guard = FileLock::acquire(&self.lock_path)?;
        let mut entries = self.entries()?;
        entries.retain(|entry| entry.name != name);
        entries.insert(
            0,
            RecentEntry {
                name: name.to_string(),
                timestamp,
            },
        );
        entries.truncate(self.capacity);

        let mut contents = String::new();
        for entry in &entries {
            contents.push_str(&entry.to_line());
            contents.push('\n');
        }
        write_atomic(&self.path, &contents)?;
        debug!(name, entries = entries.len(), "recorded project access");
        Ok(())
    }

    /// Entries in file order; unparseable lines are ignored.
    pub fn entries(&self) -> Result<Vec<RecentEntry>, StoreError> {
        let mut entries: Vec<RecentEntry> = Vec::new();
        for entry in read_lines(&self.path)?
            .iter()
            .filter_map(|line| RecentEntry::from_line(line))
        {
            if !entries.iter().any(|existing| existing.name == entry.name) {
                entries.push(entry);
            }
        }
        entries.truncate(self.capacity);
        Ok(entries)
    }

    pub fn recent_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries()?.into_iter().map(|entry| entry.name).collect())
    }
}

/// Orders `items` with recently opened ones first (newest first), then the
/// rest in their original order. Each recent name claims its first match.
pub fn rank_by_recency<'a, T>(
    items: &'a [T],
    recent: &[String],
    name_of: impl Fn(&T) -> &str,
) -> Vec<&'a T> {
    let mut claimed = vec![false; items.len()];
    let mut ranked = Vec::with_capacity(items.len());
    for name in recent {
        if let Some(index) = items
            .iter()
            .enumerate()
            .position(|(index, item)| !claimed[index] && name_of(item) == name.as_str())
        {
            claimed[index] = true;
            ranked.push(&items[index]);
        }
    }
    for (index, item) in items.iter().enumerate() {
        if !claimed[index] {
            ranked.push(item);
        }
    }
    ranked
}
