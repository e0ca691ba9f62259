use crate::App;
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use psw_storage::{write_atomic, CacheStore, RebuildReport, RepairReport};
use std::fs::{self, OpenOptions};
use std::future::Future;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStart {
    Started(i32),
    AlreadyRunning(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Running(i32),
    Stale(i32),
    Stopped,
}

pub fn build(app: &App) -> Result<(RebuildReport, RepairReport)> {
    let report = app
        .store
        .rebuild(&app.config.project_dirs)
        .context("Failed to rebuild project cache")?;
    let repair = app
        .store
        .repair_schema()
        .context("Failed to repair project cache")?;
    Ok((report, repair))
}

pub fn watched_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    dirs.iter().filter(|dir| dir.is_dir()).cloned().collect()
}

/// Inspects the PID file, deleting it when the recorded process is gone.
pub fn watch_status(pid_path: &Path) -> WatchState {
    let Some(pid) = read_pid(pid_path) else {
        return WatchState::Stopped;
    };
    if process_alive(pid) {
        return WatchState::Running(pid);
    }
    let _ = fs::remove_file(pid_path);
    WatchState::Stale(pid)
}

/// Launches the watcher as a detached `psw watch-daemon` process unless a
/// live one is already recorded.
pub fn start_watch(app: &App) -> Result<WatchStart> {
    let pid_path = app.config.pid_path();
    if let WatchState::Running(pid) = watch_status(&pid_path) {
        return Ok(WatchStart::AlreadyRunning(pid));
    }
    if watched_dirs(&app.config.project_dirs).is_empty() {
        bail!("No project directories exist; nothing to watch");
    }

    fs::create_dir_all(&app.config.state_dir)
        .with_context(|| format!("Failed to create {}", app.config.state_dir.display()))?;
    let log_path = app.config.watch_log_path();
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;
    let exe = std::env::current_exe().context("Failed to locate psw executable")?;

    let mut cmd = Command::new(exe);
    if app.debug {
        cmd.arg("--debug");
    }
    let child = cmd
        .arg("watch-daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log)
        .process_group(0)
        .spawn()
        .context("Failed to start watcher")?;

    let pid = child.id() as i32;
    write_atomic(&pid_path, &format!("{pid}\n"))
        .with_context(|| format!("Failed to write {}", pid_path.display()))?;
    info!(pid, "watcher started");
    Ok(WatchStart::Started(pid))
}

/// Signals the recorded watcher and removes its PID file. Returns the state
/// observed before stopping.
pub fn stop_watch(pid_path: &Path) -> Result<WatchState> {
    let state = watch_status(pid_path);
    if let WatchState::Running(pid) = state {
        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => bail!("Failed to signal watcher {pid}: {err}"),
        }
        match fs::remove_file(pid_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to remove {}", pid_path.display()))
            }
        }
    }
    Ok(state)
}

/// Body of the watcher process: build once, then rebuild after each burst of
/// descriptor changes until a termination signal arrives.
pub async fn run_watch(app: &App) -> Result<()> {
    let dirs = watched_dirs(&app.config.project_dirs);
    if dirs.is_empty() {
        bail!("No project directories exist; nothing to watch");
    }

    let store = app.store.clone();
    let initial_dirs = dirs.clone();
    tokio::task::spawn_blocking(move || store.ensure_built(&initial_dirs))
        .await
        .context("Initial build task failed")??;

    let descriptor_name = app.config.descriptor_name.clone();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in event.paths {
                    if is_descriptor_event(&path, &descriptor_name) {
                        let _ = event_tx.send(path);
                    }
                }
            }
            Err(err) => warn!("watch_error: {err}"),
        })
        .context("Failed to create filesystem watcher")?;
    for dir in &dirs {
        watcher
            .watch(dir, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
    }
    info!(dirs = dirs.len(), pid = std::process::id(), "watching project directories");

    let mut terminate = unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt = unix_signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = terminate.recv() => {}
            _ = interrupt.recv() => {}
        }
    };

    let store = &app.store;
    let watched = &dirs;
    debounce_loop(event_rx, app.config.debounce, shutdown, move || async move {
        if let Err(err) = rebuild_in_background(store, watched).await {
            error!("rebuild_failed: {err:#}");
        }
    })
    .await;

    drop(watcher);
    release_pid_file(&app.config.pid_path());
    info!("watcher stopped");
    Ok(())
}

/// Matches events on the descriptor file itself; `foo.project.nix` does not
/// match `.project.nix`.
fn is_descriptor_event(path: &Path, descriptor_name: &str) -> bool {
    path.file_name().is_some_and(|name| name == descriptor_name)
}

/// Runs `rebuild` once per burst of events, `debounce` after the last one,
/// until `shutdown` resolves.
async fn debounce_loop<S, F, Fut>(
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
    shutdown: S,
    mut rebuild: F,
) where
    S: Future<Output = ()>,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut pending = false;
    loop {
        tokio::select! {
            Some(path) = events.recv() => {
                debug!(path = %path.display(), "descriptor changed");
                pending = true;
            }
            _ = tokio::time::sleep(debounce), if pending => {
                pending = false;
                rebuild().await;
            }
            _ = &mut shutdown => break,
        }
    }
}

async fn rebuild_in_background(store: &CacheStore, dirs: &[PathBuf]) -> Result<()> {
    let store = store.clone();
    let dirs = dirs.to_vec();
    let report = tokio::task::spawn_blocking(move || -> Result<RebuildReport> {
        let report = store.rebuild(&dirs)?;
        store.repair_schema()?;
        Ok(report)
    })
    .await
    .context("Rebuild task failed")??;
    info!(projects = report.projects, "cache refreshed after change");
    Ok(())
}

/// Removes the PID file only if it still names this process.
fn release_pid_file(pid_path: &Path) {
    if read_pid(pid_path) == Some(std::process::id() as i32) {
        let _ = fs::remove_file(pid_path);
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
}

fn process_alive(pid: i32) -> bool {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psw_core::{Config, NixEvaluator};
    use psw_storage::RecencyTracker;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    // Above the Linux pid_max ceiling, so never a live process.
    const DEAD_PID: i32 = 4_194_304 + 17;

    #[test]
    fn missing_pid_file_means_stopped() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(watch_status(&dir.path().join("watch.pid")), WatchState::Stopped);
    }

    #[test]
    fn stale_pid_file_is_removed() {
        let dir = TempDir::new().expect("tempdir");
        let pid_path = dir.path().join("watch.pid");
        fs::write(&pid_path, format!("{DEAD_PID}\n")).expect("pid file");

        assert_eq!(watch_status(&pid_path), WatchState::Stale(DEAD_PID));
        assert!(!pid_path.exists());
        assert_eq!(stop_watch(&pid_path).expect("stop"), WatchState::Stopped);
    }

    #[test]
    fn live_pid_is_reported_running() {
        let dir = TempDir::new().expect("tempdir");
        let pid_path = dir.path().join("watch.pid");
        let me = std::process::id() as i32;
        fs::write(&pid_path, format!("{me}\n")).expect("pid file");

        assert_eq!(watch_status(&pid_path), WatchState::Running(me));
        assert!(pid_path.exists());
    }

    #[test]
    fn garbage_pid_file_reads_as_stopped() {
        let dir = TempDir::new().expect("tempdir");
        let pid_path = dir.path().join("watch.pid");
        fs::write(&pid_path, "not-a-pid").expect("pid file");
        assert_eq!(watch_status(&pid_path), WatchState::Stopped);
    }

    #[test]
    fn pid_file_is_only_released_by_its_owner() {
        let dir = TempDir::new().expect("tempdir");
        let pid_path = dir.path().join("watch.pid");
        fs::write(&pid_path, format!("{DEAD_PID}\n")).expect("pid file");
        release_pid_file(&pid_path);
        assert!(pid_path.exists());

        fs::write(&pid_path, format!("{}\n", std::process::id())).expect("pid file");
        release_pid_file(&pid_path);
        assert!(!pid_path.exists());
    }

    #[test]
    fn only_existing_dirs_are_watched() {
        let dir = TempDir::new().expect("tempdir");
        let present = dir.path().to_path_buf();
        let absent = dir.path().join("absent");
        assert_eq!(watched_dirs(&[absent, present.clone()]), vec![present]);
    }

    fn app_in(dir: &TempDir) -> App {
        let config = Config::with_dirs(dir.path().join("state"), vec![dir.path().to_path_buf()]);
        let store = CacheStore::new(&config, Arc::new(NixEvaluator::new(Vec::new())));
        let recent = RecencyTracker::new(&config);
        App {
            config,
            store,
            recent,
            debug: false,
        }
    }

    #[test]
    fn start_watch_leaves_live_watcher_alone() {
        let dir = TempDir::new().expect("tempdir");
        let app = app_in(&dir);
        let pid_path = app.config.pid_path();
        fs::create_dir_all(pid_path.parent().expect("state dir")).expect("state dir");
        let me = std::process::id() as i32;
        fs::write(&pid_path, format!("{me}\n")).expect("pid file");

        assert_eq!(start_watch(&app).expect("start"), WatchStart::AlreadyRunning(me));
        assert_eq!(fs::read_to_string(&pid_path).expect("pid file"), format!("{me}\n"));
    }

    #[test]
    fn only_descriptor_paths_trigger_rebuilds() {
        let name = ".project.nix";
        assert!(is_descriptor_event(Path::new("/p/shop/.project.nix"), name));
        assert!(!is_descriptor_event(Path::new("/p/shop/src/main.rs"), name));
        assert!(!is_descriptor_event(Path::new("/p/shop/old.project.nix"), name));
        assert!(!is_descriptor_event(Path::new("/p/shop/.project.nix.swp"), name));
        assert!(!is_descriptor_event(Path::new("/p/.project.nix/inner"), name));
    }

    #[tokio::test]
    async fn burst_of_changes_rebuilds_once_after_debounce() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let rebuilds = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&rebuilds);
        let shutdown = async move {
            let _ = stop_rx.await;
        };
        let task = tokio::spawn(debounce_loop(
            event_rx,
            Duration::from_millis(50),
            shutdown,
            move || {
                let counter = Arc::clone(&counter);
                let done_tx = done_tx.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = done_tx.send(());
                }
            },
        ));

        for _ in 0..3 {
            event_tx
                .send(PathBuf::from("/p/shop/.project.nix"))
                .expect("send event");
        }
        tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("rebuild within timeout")
            .expect("rebuild signal");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rebuilds.load(Ordering::SeqCst), 1);

        stop_tx.send(()).expect("stop loop");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop stops")
            .expect("loop task");
        assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
    }
}
