use crate::lock::FileLock;
use crate::{read_lines, write_atomic, StoreError};
use psw_core::{descriptor, Config, DescriptorEvaluator, ProjectRecord, CACHE_SCHEMA_HEADER};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub projects: usize,
    pub missing_dirs: Vec<PathBuf>,
    pub duplicate_names: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub migrated: usize,
    pub dropped: usize,
    pub rewritten: bool,
}

/// Owner of the on-disk project table.
///
/// Writers serialize on a blocking advisory lock and publish through an
/// atomic rename; readers take no lock.
#[derive(Clone)]
pub struct CacheStore {
    table_path: PathBuf,
    lock_path: PathBuf,
    descriptor_name: String,
    evaluator: Arc<dyn DescriptorEvaluator>,
}

impl CacheStore {
    pub fn new(config: &Config, evaluator: Arc<dyn DescriptorEvaluator>) -> Self {
        Self {
            table_path: config.cache_path(),
            lock_path: config.cache_lock_path(),
            descriptor_name: config.descriptor_name.clone(),
            evaluator,
        }
    }

    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    pub fn evaluator(&self) -> &dyn DescriptorEvaluator {
        self.evaluator.as_ref()
    }

    pub fn rebuild(&self, dirs: &[PathBuf]) -> Result<RebuildReport, StoreError> {
        let _guard = FileLock::acquire(&self.lock_path)?;
        let mut report = RebuildReport::default();
        let mut lines = BTreeSet::new();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        for dir in dirs {
            if !dir.is_dir() {
                warn!(dir = %dir.display(), "project directory missing, skipping");
                report.missing_dirs.push(dir.clone());
                continue;
            }
            for path in self.descriptors_under(dir) {
                let record = descriptor::parse(self.evaluator.as_ref(), &path);
                if let Some(previous) = seen.get(&record.name) {
                    if previous != &record.config_path {
                        warn!(
                            name = %record.name,
                            first = %previous.display(),
                            second = %record.config_path.display(),
                            "duplicate project name"
                        );
                        report.duplicate_names.push(record.name.clone());
                    }
                } else {
                    seen.insert(record.name.clone(), record.config_path.clone());
                }
                lines.insert(record.to_line());
            }
        }

        report.projects = lines.len();
        write_atomic(&self.table_path, &render_table(lines.iter()))?;
        info!(projects = report.projects, table = %self.table_path.display(), "cache rebuilt");
        Ok(report)
    }

    /// Upgrades a headerless table written in the legacy
    /// `name|workspace|directory|configPath|tags` order. Idempotent.
    pub fn repair_schema(&self) -> Result<RepairReport, StoreError> {
        let _guard = FileLock::acquire(&self.lock_path)?;
        let lines = read_lines(&self.table_path)?;
        let mut report = RepairReport::default();
        if lines.is_empty() || lines[0] == CACHE_SCHEMA_HEADER {
            return Ok(report);
        }

        let mut repaired = BTreeSet::new();
        for line in &lines {
            if line.starts_with('#') {
                continue;
            }
            match repair_line(line) {
                Some((canonical, migrated)) => {
                    if migrated {
                        report.migrated += 1;
                    }
                    repaired.insert(canonical);
                }
                None => {
                    warn!(line = %line, "dropping malformed cache line");
                    report.dropped += 1;
                }
            }
        }

        write_atomic(&self.table_path, &render_table(repaired.iter()))?;
        report.rewritten = true;
        info!(
            migrated = report.migrated,
            dropped = report.dropped,
            "cache schema repaired"
        );
        Ok(report)
    }

    /// Point-in-time snapshot of every record, in table order.
    pub fn records(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        Ok(read_lines(&self.table_path)?
            .iter()
            .filter_map(|line| ProjectRecord::from_line(line))
            .collect())
    }

    /// First record whose name field matches exactly.
    pub fn lookup(&self, name: &str) -> Result<ProjectRecord, StoreError> {
        let prefix = format!("{name}|");
        read_lines(&self.table_path)?
            .iter()
            .filter(|line| line.starts_with(&prefix))
            .find_map(|line| ProjectRecord::from_line(line))
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    /// A table holding only the schema header counts as built: it is the
    /// result of scanning a tree with no projects.
    pub fn is_built(&self) -> bool {
        read_lines(&self.table_path)
            .map(|lines| !lines.is_empty())
            .unwrap_or(false)
    }

    /// Rebuilds once when the table is absent or empty, and upgrades a
    /// headerless table in place. Returns whether a rebuild ran.
    pub fn ensure_built(&self, dirs: &[PathBuf]) -> Result<bool, StoreError> {
        let lines = read_lines(&self.table_path)?;
        match lines.first() {
            None => {
                debug!(table = %self.table_path.display(), "cache empty, building");
                self.rebuild(dirs)?;
                Ok(true)
            }
            Some(first) if first != CACHE_SCHEMA_HEADER => {
                debug!(table = %self.table_path.display(), "headerless cache, repairing");
                self.repair_schema()?;
                Ok(false)
            }
            Some(_) => Ok(false),
        }
    }

    fn descriptors_under(&self, dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && entry.file_name() == self.descriptor_name.as_str() {
                found.push(entry.into_path());
            }
        }
        found
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}

fn render_table<'a>(lines: impl Iterator<Item = &'a String>) -> String {
    let mut table = String::from(CACHE_SCHEMA_HEADER);
    table.push('\n');
    for line in lines {
        table.push_str(line);
        table.push('\n');
    }
    table
}

/// Returns the canonical form of a five-field line and whether it was in the
/// legacy order. A third field that looks like an absolute path marks the
/// legacy layout.
pub fn repair_line(line: &str) -> Option<(String, bool)> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 5 {
        return None;
    }
    if fields[2].starts_with('/') {
        let canonical = [fields[0], fields[1], fields[4], fields[2], fields[3]].join("|");
        return Some((canonical, true));
    }
    Some((line.to_string(), false))
}
