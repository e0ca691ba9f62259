use psw_core::config::ControlPlaneKind;
use psw_core::{descriptor, Config, EnvironmentItem, ItemKind, ProjectRecord};
use psw_storage::{CacheStore, RecencyTracker, StoreError};
use std::env;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info, warn};

/// Program to run inside a new window. An empty `argv` means a plain
/// interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub cwd: PathBuf,
    pub argv: Vec<String>,
}

impl LaunchRequest {
    pub fn shell(cwd: &Path) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            argv: Vec::new(),
        }
    }
}

/// Compositor-side capability. Every call is fire-and-forget: nothing is
/// read back to confirm a window appeared.
pub trait ControlPlane {
    fn is_available(&self) -> bool;
    fn switch_workspace(&self, workspace: &str) -> io::Result<()>;
    fn spawn_window(&self, request: &LaunchRequest) -> io::Result<()>;
    fn open_url(&self, url: &str) -> io::Result<()>;
}

pub fn control_plane_for(config: &Config) -> Box<dyn ControlPlane> {
    match config.control_plane {
        ControlPlaneKind::Hyprland => Box::new(Hyprland::new(config)),
        ControlPlaneKind::Zellij => Box::new(Zellij::new(config)),
    }
}

pub struct Hyprland {
    terminal: Vec<String>,
    cwd_flag: String,
    exec_flag: Option<String>,
    browser: Vec<String>,
}

impl Hyprland {
    pub fn new(config: &Config) -> Self {
        Self {
            terminal: config.terminal.clone(),
            cwd_flag: config.terminal_cwd_flag.clone(),
            exec_flag: config.terminal_exec_flag.clone(),
            browser: config.browser.clone(),
        }
    }

    fn terminal_argv(&self, request: &LaunchRequest) -> Vec<String> {
        let mut argv = self.terminal.clone();
        if !self.cwd_flag.is_empty() {
            argv.push(self.cwd_flag.clone());
            argv.push(request.cwd.display().to_string());
        }
        if !request.argv.is_empty() {
            if let Some(flag) = &self.exec_flag {
                argv.push(flag.clone());
            }
            argv.extend(request.argv.iter().cloned());
        }
        argv
    }
}

impl ControlPlane for Hyprland {
    fn is_available(&self) -> bool {
        if env::var_os("HYPRLAND_INSTANCE_SIGNATURE").is_none() {
            return false;
        }
        Command::new("hyprctl")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn switch_workspace(&self, workspace: &str) -> io::Result<()> {
        Command::new("hyprctl")
            .args(["dispatch", "workspace", workspace])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
    }

    fn spawn_window(&self, request: &LaunchRequest) -> io::Result<()> {
        spawn_detached(&self.terminal_argv(request), &request.cwd)
    }

    fn open_url(&self, url: &str) -> io::Result<()> {
        let mut argv = self.browser.clone();
        argv.push(url.to_string());
        spawn_detached(&argv, &home_dir())
    }
}

/// Zellij session as the control plane: workspaces are tabs, windows are panes.
pub struct Zellij {
    browser: Vec<String>,
}

impl Zellij {
    pub fn new(config: &Config) -> Self {
        Self {
            browser: config.browser.clone(),
        }
    }
}

impl ControlPlane for Zellij {
    fn is_available(&self) -> bool {
        in_zellij()
    }

    fn switch_workspace(&self, workspace: &str) -> io::Result<()> {
        Command::new("zellij")
            .args(["action", "go-to-tab", workspace])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
    }

    fn spawn_window(&self, request: &LaunchRequest) -> io::Result<()> {
        let mut cmd = Command::new("zellij");
        cmd.args(["action", "new-pane", "--cwd"]).arg(&request.cwd);
        if !request.argv.is_empty() {
            cmd.arg("--").args(&request.argv);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        cmd.status().map(|_| ())
    }

    fn open_url(&self, url: &str) -> io::Result<()> {
        let mut argv = self.browser.clone();
        argv.push(url.to_string());
        spawn_detached(&argv, &home_dir())
    }
}

fn in_zellij() -> bool {
    env::var("ZELLIJ").is_ok() || env::var("ZELLIJ_SESSION_NAME").is_ok()
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
}

/// Starts `argv` in its own process group with no stdio, without waiting.
fn spawn_detached(argv: &[String], cwd: &Path) -> io::Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    debug!(program = %program, pid = child.id(), "spawned window process");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Environment items dispatched in file order.
    Launched { dispatched: usize, skipped: usize },
    /// No usable environment; one shell in the project directory.
    BareTerminal,
    /// Control plane unreachable; nothing was launched.
    Advisory,
}

pub struct EnvironmentLauncher<'a> {
    config: &'a Config,
    store: &'a CacheStore,
    recent: &'a RecencyTracker,
    plane: &'a dyn ControlPlane,
}

impl<'a> EnvironmentLauncher<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a CacheStore,
        recent: &'a RecencyTracker,
        plane: &'a dyn ControlPlane,
    ) -> Self {
        Self {
            config,
            store,
            recent,
            plane,
        }
    }

    /// Resolves `name` and recreates its environment. `interactive` selects
    /// the advisory output used when the control plane is unreachable.
    pub fn open(&self, name: &str, interactive: bool) -> Result<OpenOutcome, StoreError> {
        let record = self.store.lookup(name)?;
        if let Err(err) = self.recent.record_access(&record.name) {
            warn!(name = %record.name, error = %err, "failed to record recent project");
        }

        if !self.plane.is_available() {
            if interactive {
                println!("{}", record.directory.display());
                println!("{}", cd_suggestion(&record.directory));
            } else {
                warn!(name = %record.name, "control plane unavailable, nothing launched");
            }
            return Ok(OpenOutcome::Advisory);
        }

        if let Err(err) = self.plane.switch_workspace(&record.workspace) {
            warn!(workspace = %record.workspace, error = %err, "workspace switch failed");
        }

        let items = match descriptor::parse_environment(self.store.evaluator(), &record.config_path) {
            Ok(items) if !items.is_empty() => items,
            Ok(_) => {
                debug!(name = %record.name, "no environment items");
                return Ok(self.bare_terminal(&record));
            }
            Err(err) => {
                warn!(name = %record.name, error = %err, "environment unavailable");
                return Ok(self.bare_terminal(&record));
            }
        };

        Ok(self.dispatch_all(&record, &items))
    }

    fn bare_terminal(&self, record: &ProjectRecord) -> OpenOutcome {
        if let Err(err) = self.plane.spawn_window(&LaunchRequest::shell(&record.directory)) {
            warn!(error = %err, "failed to open terminal");
        }
        OpenOutcome::BareTerminal
    }

    fn dispatch_all(&self, record: &ProjectRecord, items: &[EnvironmentItem]) -> OpenOutcome {
        let mut dispatched = 0usize;
        let mut skipped = 0usize;
        for item in items {
            let Some(action) = plan_item(item, &record.directory) else {
                warn!(kind = %item.kind, "skipping environment item");
                skipped += 1;
                continue;
            };
            if dispatched > 0 && !self.config.launch_delay.is_zero() {
                thread::sleep(self.config.launch_delay);
            }
            let result = match &action {
                Action::Window(request) => self.plane.spawn_window(request),
                Action::Url(url) => self.plane.open_url(url),
            };
            if let Err(err) = result {
                warn!(kind = %item.kind, error = %err, "environment item failed to launch");
            }
            dispatched += 1;
        }
        info!(name = %record.name, dispatched, skipped, "environment launched");
        OpenOutcome::Launched {
            dispatched,
            skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Window(LaunchRequest),
    Url(String),
}

fn plan_item(item: &EnvironmentItem, directory: &Path) -> Option<Action> {
    match &item.kind {
        ItemKind::Terminal => {
            let command = item.command.trim();
            let argv = if command.is_empty() {
                Vec::new()
            } else {
                let shell = user_shell();
                // "$0" is the shell itself, passed as the next argument
                vec![
                    shell.clone(),
                    "-c".to_string(),
                    format!("{command}\nexec \"$0\""),
                    shell,
                ]
            };
            Some(Action::Window(LaunchRequest {
                cwd: directory.to_path_buf(),
                argv,
            }))
        }
        ItemKind::Editor => {
            let mut argv: Vec<String> = item
                .command
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if argv.is_empty() {
                argv.push(env::var("EDITOR").unwrap_or_else(|_| "vi".to_string()));
            }
            argv.extend(item.files.iter().cloned());
            Some(Action::Window(LaunchRequest {
                cwd: directory.to_path_buf(),
                argv,
            }))
        }
        ItemKind::Browser => {
            let url = item.url.trim();
            if url.is_empty() {
                None
            } else {
                Some(Action::Url(url.to_string()))
            }
        }
        ItemKind::Unknown(_) => None,
    }
}

/// `cd` line safe to paste into a POSIX shell.
fn cd_suggestion(directory: &Path) -> String {
    let quoted = directory.display().to_string().replace('\'', r"'\''");
    format!("cd '{quoted}'")
}

fn user_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|shell| !shell.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
