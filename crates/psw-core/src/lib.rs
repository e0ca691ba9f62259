pub mod config;
pub mod descriptor;

pub use config::Config;
pub use descriptor::{DescriptorError, DescriptorEvaluator, NixEvaluator};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// First line of every table written by this version of the cache store.
pub const CACHE_SCHEMA_HEADER: &str = "# psw-cache v2";
pub const DEFAULT_WORKSPACE: &str = "1";
pub const DEFAULT_POSITION: &str = "center";
pub const FIELD_SEPARATOR: char = '|';

/// One row of the project cache table.
///
/// Serialized as `name|workspace|tags|directory|configPath`, tags comma-joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub name: String,
    pub workspace: String,
    pub tags: Vec<String>,
    pub directory: PathBuf,
    pub config_path: PathBuf,
}

impl ProjectRecord {
    pub fn tags_field(&self) -> String {
        self.tags.join(",")
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.name,
            self.workspace,
            self.tags_field(),
            self.directory.display(),
            self.config_path.display()
        )
    }

    /// Parses a canonical table line. Comment lines and lines without exactly
    /// five fields yield `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        if line.starts_with('#') {
            return None;
        }
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            workspace: fields[1].to_string(),
            tags: split_tags(fields[2]),
            directory: PathBuf::from(fields[3]),
            config_path: PathBuf::from(fields[4]),
        })
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }
}

/// Splits a comma-joined tag field, dropping blanks and repeats while keeping order.
pub fn split_tags(field: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in field.split(',').map(str::trim).filter(|tag| !tag.is_empty()) {
        if !tags.iter().any(|existing| existing == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Terminal,
    Editor,
    Browser,
    Unknown(String),
}

impl ItemKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "terminal" => ItemKind::Terminal,
            "editor" => ItemKind::Editor,
            "browser" => ItemKind::Browser,
            _ => ItemKind::Unknown(value.to_string()),
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Terminal => f.write_str("terminal"),
            ItemKind::Editor => f.write_str("editor"),
            ItemKind::Browser => f.write_str("browser"),
            ItemKind::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// One window the launcher should bring up. Read from the descriptor at
/// launch time, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentItem {
    pub kind: ItemKind,
    pub command: String,
    pub position: String,
    pub url: String,
    pub files: Vec<String>,
}

impl Default for EnvironmentItem {
    fn default() -> Self {
        Self {
            kind: ItemKind::Unknown("unknown".to_string()),
            command: String::new(),
            position: DEFAULT_POSITION.to_string(),
            url: String::new(),
            files: Vec::new(),
        }
    }
}

/// `name|unixTimestamp` line of the recent file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEntry {
    pub name: String,
    pub timestamp: i64,
}

impl RecentEntry {
    pub fn to_line(&self) -> String {
        format!("{}|{}", self.name, self.timestamp)
    }

    pub fn from_line(line: &str) -> Option<Self> {
        let (name, timestamp) = line.rsplit_once(FIELD_SEPARATOR)?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            timestamp: timestamp.trim().parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProjectRecord {
        ProjectRecord {
            name: "Foo".to_string(),
            workspace: "2".to_string(),
            tags: vec!["rust".to_string(), "cli".to_string()],
            directory: PathBuf::from("/home/u/foo"),
            config_path: PathBuf::from("/home/u/foo/.project.nix"),
        }
    }

    #[test]
    fn record_line_uses_canonical_field_order() {
        assert_eq!(
            record().to_line(),
            "Foo|2|rust,cli|/home/u/foo|/home/u/foo/.project.nix"
        );
    }

    #[test]
    fn record_line_parses_back_with_empty_tags() {
        let parsed = ProjectRecord::from_line("Foo|2||/home/u/foo|/home/u/foo/.project")
            .expect("canonical line");
        assert!(parsed.tags.is_empty());
        assert_eq!(parsed.directory, PathBuf::from("/home/u/foo"));
        assert_eq!(parsed.tags_field(), "");
    }

    #[test]
    fn header_and_short_lines_are_not_records() {
        assert!(ProjectRecord::from_line(CACHE_SCHEMA_HEADER).is_none());
        assert!(ProjectRecord::from_line("Foo|2|/home/u/foo").is_none());
    }

    #[test]
    fn split_tags_drops_blanks_and_repeats() {
        assert_eq!(split_tags(" a, b,,a ,c"), vec!["a", "b", "c"]);
        assert!(split_tags("").is_empty());
    }

    #[test]
    fn item_kind_is_case_insensitive() {
        assert_eq!(ItemKind::parse("Terminal"), ItemKind::Terminal);
        assert_eq!(
            ItemKind::parse("music"),
            ItemKind::Unknown("music".to_string())
        );
    }

    #[test]
    fn recent_entry_rejects_garbage() {
        assert_eq!(
            RecentEntry::from_line("Foo|1700000000"),
            Some(RecentEntry {
                name: "Foo".to_string(),
                timestamp: 1_700_000_000
            })
        );
        assert!(RecentEntry::from_line("Foo|later").is_none());
        assert!(RecentEntry::from_line("|12").is_none());
        assert!(RecentEntry::from_line("no separator").is_none());
    }
}
