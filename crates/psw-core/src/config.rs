use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DESCRIPTOR_NAME: &str = ".project.nix";
pub const DEFAULT_MAX_RECENT: usize = 5;
pub const DEFAULT_LAUNCH_DELAY_MS: u64 = 750;
pub const DEFAULT_DEBOUNCE_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPlaneKind {
    #[default]
    Hyprland,
    Zellij,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    project_dirs: Option<Vec<String>>,
    descriptor_name: Option<String>,
    max_recent: Option<usize>,
    state_dir: Option<String>,
    control_plane: Option<ControlPlaneKind>,
    terminal: Option<Vec<String>>,
    terminal_cwd_flag: Option<String>,
    terminal_exec_flag: Option<String>,
    browser: Option<Vec<String>>,
    launch_delay_ms: Option<u64>,
    debounce_ms: Option<u64>,
    evaluator: Option<Vec<String>>,
}

/// Process-wide settings, built once at startup and handed to every component.
#[derive(Clone, Debug)]
pub struct Config {
    pub project_dirs: Vec<PathBuf>,
    pub descriptor_name: String,
    pub max_recent: usize,
    pub state_dir: PathBuf,
    pub control_plane: ControlPlaneKind,
    pub terminal: Vec<String>,
    pub terminal_cwd_flag: String,
    pub terminal_exec_flag: Option<String>,
    pub browser: Vec<String>,
    pub launch_delay: Duration,
    pub debounce: Duration,
    pub evaluator: Vec<String>,
}

impl Config {
    /// Loads `$PSW_CONFIG_PATH` or `$XDG_CONFIG_HOME/psw/config.toml`, then
    /// applies `PSW_PROJECT_DIRS`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&config_path())?;
        if let Ok(value) = env::var("PSW_PROJECT_DIRS") {
            let dirs: Vec<PathBuf> = value
                .split(':')
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(expand_home)
                .collect();
            if !dirs.is_empty() {
                config.project_dirs = dirs;
            }
        }
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::resolve(FileConfig::default()));
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::resolve(file))
    }

    /// Defaults rooted at an explicit state dir and project list.
    pub fn with_dirs(state_dir: impl Into<PathBuf>, project_dirs: Vec<PathBuf>) -> Self {
        let mut config = Self::resolve(FileConfig::default());
        config.state_dir = state_dir.into();
        config.project_dirs = project_dirs;
        config
    }

    fn resolve(file: FileConfig) -> Self {
        let project_dirs = file
            .project_dirs
            .map(|dirs| dirs.iter().map(|dir| expand_home(dir)).collect())
            .unwrap_or_else(default_project_dirs);
        let state_dir = file
            .state_dir
            .map(|dir| expand_home(&dir))
            .unwrap_or_else(default_state_dir);
        Self {
            project_dirs,
            descriptor_name: file
                .descriptor_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DESCRIPTOR_NAME.to_string()),
            max_recent: file.max_recent.unwrap_or(DEFAULT_MAX_RECENT).max(1),
            state_dir,
            control_plane: file.control_plane.unwrap_or_default(),
            terminal: non_empty(file.terminal).unwrap_or_else(|| vec!["kitty".to_string()]),
            terminal_cwd_flag: file
                .terminal_cwd_flag
                .unwrap_or_else(|| "--directory".to_string()),
            terminal_exec_flag: file
                .terminal_exec_flag
                .filter(|flag| !flag.trim().is_empty()),
            browser: non_empty(file.browser).unwrap_or_else(|| vec!["xdg-open".to_string()]),
            launch_delay: Duration::from_millis(
                file.launch_delay_ms.unwrap_or(DEFAULT_LAUNCH_DELAY_MS),
            ),
            debounce: Duration::from_millis(file.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
            evaluator: non_empty(file.evaluator).unwrap_or_else(|| {
                ["nix", "eval", "--json", "--file"]
                    .iter()
                    .map(|part| part.to_string())
                    .collect()
            }),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("projects.cache")
    }

    pub fn cache_lock_path(&self) -> PathBuf {
        self.state_dir.join("projects.cache.lock")
    }

    pub fn recent_path(&self) -> PathBuf {
        self.state_dir.join("recent")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.state_dir.join("watch.pid")
    }

    pub fn watch_log_path(&self) -> PathBuf {
        self.state_dir.join("watch.log")
    }

    pub fn instance_lock_path(&self) -> PathBuf {
        self.state_dir.join("instance.lock")
    }
}

fn non_empty(value: Option<Vec<String>>) -> Option<Vec<String>> {
    value.filter(|argv| !argv.is_empty())
}

fn config_path() -> PathBuf {
    if let Ok(path) = env::var("PSW_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("psw/config.toml")
}

fn default_state_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| home_dir().join(".cache"))
        .join("psw")
}

fn default_project_dirs() -> Vec<PathBuf> {
    let home = home_dir();
    vec![home.join("dev"), home.join("projects")]
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn expand_home(value: &str) -> PathBuf {
    if value == "~" {
        return home_dir();
    }
    match value.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(value),
    }
}
