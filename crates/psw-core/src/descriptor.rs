//! Descriptor parsing.
//!
//! A descriptor file is evaluated by an external declarative-language tool.
//! Record fields degrade to a textual scrape when the tool fails; environment
//! items have no such fallback.

use crate::{split_tags, EnvironmentItem, ItemKind, ProjectRecord, DEFAULT_POSITION, DEFAULT_WORKSPACE};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor evaluator `{program}` is not installed")]
    EvaluatorMissing { program: String },
    #[error("descriptor evaluation failed for {path}: {details}")]
    EvaluationFailed { path: PathBuf, details: String },
    #[error("descriptor output malformed for {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WorkspaceField {
    Number(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FilesField {
    List(Vec<String>),
    Joined(String),
}

/// Structured top-level fields of a descriptor, all optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFields {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub workspace: Option<WorkspaceField>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvironmentFields {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub files: Option<FilesField>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvironmentDocument {
    #[serde(default)]
    environment: Option<Vec<EnvironmentFields>>,
}

/// Capability that turns a descriptor file into structured data.
pub trait DescriptorEvaluator: Send + Sync {
    fn eval_record(&self, path: &Path) -> Result<RecordFields, DescriptorError>;
    fn eval_environment(&self, path: &Path) -> Result<Vec<EnvironmentFields>, DescriptorError>;
}

/// Runs an external evaluator (by default `nix eval --json --file <path>`)
/// and reads its JSON output.
#[derive(Debug, Clone)]
pub struct NixEvaluator {
    argv: Vec<String>,
}

impl NixEvaluator {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn evaluate(&self, path: &Path) -> Result<Vec<u8>, DescriptorError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(DescriptorError::EvaluatorMissing {
                program: String::new(),
            });
        };
        let output = Command::new(program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => DescriptorError::EvaluatorMissing {
                    program: program.clone(),
                },
                _ => DescriptorError::Io(err),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DescriptorError::EvaluationFailed {
                path: path.to_path_buf(),
                details: if stderr.is_empty() {
                    format!("{program} exited with status {}", output.status)
                } else {
                    stderr
                },
            });
        }
        Ok(output.stdout)
    }
}

impl DescriptorEvaluator for NixEvaluator {
    fn eval_record(&self, path: &Path) -> Result<RecordFields, DescriptorError> {
        let stdout = self.evaluate(path)?;
        serde_json::from_slice(&stdout).map_err(|source| DescriptorError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    fn eval_environment(&self, path: &Path) -> Result<Vec<EnvironmentFields>, DescriptorError> {
        let stdout = self.evaluate(path)?;
        let document: EnvironmentDocument =
            serde_json::from_slice(&stdout).map_err(|source| DescriptorError::Malformed {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(document.environment.unwrap_or_default())
    }
}

/// Builds a record for `path`. Never fails: evaluator errors fall back to a
/// textual scrape, and every missing field takes its default.
pub fn parse(evaluator: &dyn DescriptorEvaluator, path: &Path) -> ProjectRecord {
    let config_path = absolute(path);
    let directory = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let fields = match evaluator.eval_record(&config_path) {
        Ok(fields) => fields,
        Err(err) => {
            debug!(path = %config_path.display(), error = %err, "evaluator unavailable, scraping descriptor");
            match fs::read_to_string(&config_path) {
                Ok(raw) => scrape_fields(&raw),
                Err(err) => {
                    warn!(path = %config_path.display(), error = %err, "descriptor unreadable");
                    RecordFields::default()
                }
            }
        }
    };

    let name = fields
        .project_name
        .map(|name| sanitize(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            directory
                .file_name()
                .map(|name| sanitize(&name.to_string_lossy()))
                .unwrap_or_default()
        });

    let tags = fields
        .tags
        .map(|tags| {
            let joined = tags
                .iter()
                .map(|tag| sanitize(tag).replace(',', " "))
                .collect::<Vec<_>>()
                .join(",");
            split_tags(&joined)
        })
        .unwrap_or_default();

    ProjectRecord {
        name,
        workspace: normalize_workspace(fields.workspace.as_ref()),
        tags,
        directory,
        config_path,
    }
}

/// Reads the `environment` list. Evaluator failure is returned to the caller,
/// which is expected to fall back to a bare terminal.
pub fn parse_environment(
    evaluator: &dyn DescriptorEvaluator,
    path: &Path,
) -> Result<Vec<EnvironmentItem>, DescriptorError> {
    let items = evaluator.eval_environment(path)?;
    Ok(items.into_iter().map(environment_item).collect())
}

fn environment_item(fields: EnvironmentFields) -> EnvironmentItem {
    let files = match fields.files {
        Some(FilesField::List(files)) => files,
        Some(FilesField::Joined(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|file| !file.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };
    EnvironmentItem {
        kind: ItemKind::parse(fields.kind.as_deref().unwrap_or("unknown")),
        command: fields.command.unwrap_or_default(),
        position: fields
            .position
            .filter(|position| !position.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_POSITION.to_string()),
        url: fields.url.unwrap_or_default(),
        files,
    }
}

fn normalize_workspace(field: Option<&WorkspaceField>) -> String {
    match field {
        Some(WorkspaceField::Number(value)) if *value > 0 => value.to_string(),
        Some(WorkspaceField::Text(value)) => match value.trim().parse::<u32>() {
            Ok(value) if value > 0 => value.to_string(),
            _ => DEFAULT_WORKSPACE.to_string(),
        },
        _ => DEFAULT_WORKSPACE.to_string(),
    }
}

/// Field separators and newlines would corrupt the table line.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '|' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

struct ScrapePatterns {
    name: Regex,
    workspace: Regex,
    tags: Regex,
    quoted: Regex,
}

fn patterns() -> &'static ScrapePatterns {
    static PATTERNS: OnceLock<ScrapePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ScrapePatterns {
        name: Regex::new(r#"projectName\s*=\s*"([^"]*)""#).expect("valid name pattern"),
        workspace: Regex::new(r#"workspace\s*=\s*"?(\d+)"?"#).expect("valid workspace pattern"),
        tags: Regex::new(r"(?s)tags\s*=\s*\[(.*?)\]").expect("valid tags pattern"),
        quoted: Regex::new(r#""([^"]*)""#).expect("valid quoted pattern"),
    })
}

/// Pattern-based extraction used when the evaluator is absent or fails.
pub fn scrape_fields(raw: &str) -> RecordFields {
    let patterns = patterns();
    let project_name = patterns
        .name
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().to_string());
    let workspace = patterns
        .workspace
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|value| WorkspaceField::Text(value.as_str().to_string()));
    let tags = patterns
        .tags
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|list| {
            patterns
                .quoted
                .captures_iter(list.as_str())
                .filter_map(|caps| caps.get(1))
                .map(|tag| tag.as_str().to_string())
                .collect()
        });
    RecordFields {
        project_name,
        workspace,
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct FailingEvaluator;

    impl DescriptorEvaluator for FailingEvaluator {
        fn eval_record(&self, _path: &Path) -> Result<RecordFields, DescriptorError> {
            Err(DescriptorError::EvaluatorMissing {
                program: "nix".to_string(),
            })
        }

        fn eval_environment(
            &self,
            _path: &Path,
        ) -> Result<Vec<EnvironmentFields>, DescriptorError> {
            Err(DescriptorError::EvaluatorMissing {
                program: "nix".to_string(),
            })
        }
    }

    struct CannedEvaluator {
        record: RecordFields,
        environment: Vec<EnvironmentFields>,
    }

    impl DescriptorEvaluator for CannedEvaluator {
        fn eval_record(&self, _path: &Path) -> Result<RecordFields, DescriptorError> {
            Ok(self.record.clone())
        }

        fn eval_environment(
            &self,
            _path: &Path,
        ) -> Result<Vec<EnvironmentFields>, DescriptorError> {
            Ok(self.environment.clone())
        }
    }

    fn descriptor(dir: &TempDir, project: &str, body: &str) -> PathBuf {
        let root = dir.path().join(project);
        fs::create_dir_all(&root).expect("project dir");
        let path = root.join(".project.nix");
        fs::write(&path, body).expect("write descriptor");
        path
    }

    #[test]
    fn scrape_reads_name_workspace_and_tags() {
        let fields = scrape_fields(
            r#"{
  projectName = "Atlas";
  workspace = 3;
  tags = [ "rust" "cli" ];
}"#,
        );
        assert_eq!(fields.project_name.as_deref(), Some("Atlas"));
        assert_eq!(fields.workspace, Some(WorkspaceField::Text("3".to_string())));
        assert_eq!(
            fields.tags,
            Some(vec!["rust".to_string(), "cli".to_string()])
        );
    }

    #[test]
    fn fallback_defaults_name_to_directory_and_workspace_to_one() {
        let dir = TempDir::new().expect("tempdir");
        let path = descriptor(&dir, "webshop", "{ tags = [ ]; }");

        let record = parse(&FailingEvaluator, &path);
        assert_eq!(record.name, "webshop");
        assert_eq!(record.workspace, "1");
        assert!(record.tags.is_empty());
        assert_eq!(record.directory, path.parent().expect("parent"));
        assert_eq!(record.config_path, path);
    }

    #[test]
    fn evaluator_fields_are_normalized() {
        let dir = TempDir::new().expect("tempdir");
        let path = descriptor(&dir, "atlas", "");
        let evaluator = CannedEvaluator {
            record: RecordFields {
                project_name: Some("Atlas|Core".to_string()),
                workspace: Some(WorkspaceField::Text("nine".to_string())),
                tags: Some(vec!["a".to_string(), "b,c".to_string(), "a".to_string()]),
            },
            environment: Vec::new(),
        };

        let record = parse(&evaluator, &path);
        assert_eq!(record.name, "Atlas Core");
        assert_eq!(record.workspace, "1");
        assert_eq!(record.tags, vec!["a".to_string(), "b c".to_string()]);
    }

    #[test]
    fn numeric_workspace_is_kept() {
        assert_eq!(normalize_workspace(Some(&WorkspaceField::Number(4))), "4");
        assert_eq!(normalize_workspace(Some(&WorkspaceField::Number(0))), "1");
        assert_eq!(normalize_workspace(None), "1");
    }

    #[test]
    fn unreadable_descriptor_still_yields_record() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("ghost").join(".project.nix");
        let record = parse(&FailingEvaluator, &path);
        assert_eq!(record.name, "ghost");
        assert_eq!(record.workspace, "1");
    }

    #[test]
    fn environment_items_take_documented_defaults() {
        let evaluator = CannedEvaluator {
            record: RecordFields::default(),
            environment: vec![
                EnvironmentFields {
                    kind: Some("editor".to_string()),
                    command: Some("nvim".to_string()),
                    files: Some(FilesField::Joined("src/main.rs, README.md".to_string())),
                    ..EnvironmentFields::default()
                },
                EnvironmentFields::default(),
            ],
        };

        let items = parse_environment(&evaluator, Path::new("/x/.project.nix")).expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].kind, ItemKind::Editor);
        assert_eq!(items[0].files, vec!["src/main.rs", "README.md"]);
        assert_eq!(items[0].position, "center");
        assert_eq!(items[1].kind, ItemKind::Unknown("unknown".to_string()));
        assert_eq!(items[1].command, "");
        assert_eq!(items[1].url, "");
    }

    #[test]
    fn environment_has_no_textual_fallback() {
        let err = parse_environment(&FailingEvaluator, Path::new("/x/.project.nix"))
            .expect_err("evaluator missing");
        assert!(matches!(err, DescriptorError::EvaluatorMissing { .. }));
    }

    #[test]
    fn environment_document_parses_from_json() {
        let document: EnvironmentDocument = serde_json::from_str(
            r#"{"projectName":"x","environment":[{"type":"browser","url":"http://localhost:3000"},{"type":"editor","files":["a.rs","b.rs"]}]}"#,
        )
        .expect("json");
        let items: Vec<EnvironmentItem> = document
            .environment
            .unwrap_or_default()
            .into_iter()
            .map(environment_item)
            .collect();
        assert_eq!(items[0].kind, ItemKind::Browser);
        assert_eq!(items[0].url, "http://localhost:3000");
        assert_eq!(items[1].files, vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn missing_evaluator_binary_is_reported() {
        let evaluator = NixEvaluator::new(vec!["psw-no-such-evaluator-binary".to_string()]);
        let err = evaluator
            .eval_record(Path::new("/nonexistent/.project.nix"))
            .expect_err("missing binary");
        assert!(matches!(err, DescriptorError::EvaluatorMissing { .. }));
    }
}
