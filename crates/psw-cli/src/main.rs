mod index;
mod instance;
mod launch;
mod selector;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use index::{WatchStart, WatchState};
use launch::EnvironmentLauncher;
use psw_core::{descriptor, Config, DescriptorEvaluator, NixEvaluator, ProjectRecord};
use psw_storage::{rank_by_recency, CacheStore, RecencyTracker, StoreError};
use selector::SelectorKind;
use std::env;
use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "psw")]
#[command(about = "Project switcher: index project descriptors and recreate their workspaces", long_about = None)]
struct Cli {
    /// Verbose logging to stderr
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Rescan project directories and rewrite the cache
    Build,
    /// Start the background watcher
    Monitor,
    /// Stop the background watcher
    StopMonitor,
    /// Report whether the background watcher is running
    MonitorStatus,
    /// Pick a project with rofi and open it
    Rofi,
    /// Pick a project with fzf and open it
    Fzf,
    /// List cached projects
    List(ListArgs),
    /// List recently opened projects
    ListRecent(ListRecentArgs),
    /// Open a project by name
    Open { name: String },
    /// Show the cached record and parsed environment of a project
    Debug { name: String },
    /// Upgrade a cache written in the legacy field order
    FixCache,
    #[command(hide = true)]
    WatchDaemon,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ListRecentArgs {
    #[arg(long)]
    json: bool,
}

/// Components shared by every command, built once from the loaded config.
pub struct App {
    pub config: Config,
    pub store: CacheStore,
    pub recent: RecencyTracker,
    pub debug: bool,
}

impl App {
    fn new(config: Config, debug: bool) -> Self {
        let evaluator: Arc<dyn DescriptorEvaluator> =
            Arc::new(NixEvaluator::new(config.evaluator.clone()));
        let store = CacheStore::new(&config, evaluator);
        let recent = RecencyTracker::new(&config);
        Self {
            config,
            store,
            recent,
            debug,
        }
    }

    fn ensure_built(&self) -> Result<()> {
        self.store
            .ensure_built(&self.config.project_dirs)
            .context("Failed to build project cache")?;
        Ok(())
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let default_level = match cli.command {
        Commands::WatchDaemon => "info",
        _ => "warn",
    };
    init_logging(cli.debug, default_level);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("psw: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(debug: bool, default_level: &str) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        let level = env::var("PSW_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string());
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load().context("Failed to load configuration")?;
    let app = App::new(config, cli.debug);

    match cli.command {
        Commands::Build => build(&app),
        Commands::Monitor => {
            match index::start_watch(&app)? {
                WatchStart::Started(pid) => println!("Watcher started (pid {pid})"),
                WatchStart::AlreadyRunning(pid) => println!("Watcher already running (pid {pid})"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::StopMonitor => {
            match index::stop_watch(&app.config.pid_path())? {
                WatchState::Running(pid) => println!("Watcher stopped (pid {pid})"),
                WatchState::Stale(pid) => println!("Watcher was not running (removed stale pid {pid})"),
                WatchState::Stopped => println!("Watcher is not running"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::MonitorStatus => {
            match index::watch_status(&app.config.pid_path()) {
                WatchState::Running(pid) => println!("Watcher running (pid {pid})"),
                WatchState::Stale(pid) => println!("Watcher not running (removed stale pid {pid})"),
                WatchState::Stopped => println!("Watcher not running"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rofi => pick_and_open(&app, SelectorKind::Rofi),
        Commands::Fzf => pick_and_open(&app, SelectorKind::Fzf),
        Commands::List(args) => list_projects(&app, &args),
        Commands::ListRecent(args) => list_recent(&app, &args),
        Commands::Open { name } => {
            app.ensure_built()?;
            open_project(&app, &name, io::stdout().is_terminal())
        }
        Commands::Debug { name } => debug_project(&app, &name),
        Commands::FixCache => {
            let report = app
                .store
                .repair_schema()
                .context("Failed to repair project cache")?;
            if report.rewritten {
                println!(
                    "Cache repaired: {} line(s) migrated, {} dropped",
                    report.migrated, report.dropped
                );
            } else {
                println!("Cache already in canonical format");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::WatchDaemon => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(index::run_watch(&app))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build(app: &App) -> Result<ExitCode> {
    let (report, _) = index::build(app)?;
    for name in &report.duplicate_names {
        eprintln!("Warning: duplicate project name '{name}'; the first entry wins on open");
    }
    println!("Found {} project(s)", report.projects);
    Ok(ExitCode::SUCCESS)
}

fn open_project(app: &App, name: &str, interactive: bool) -> Result<ExitCode> {
    let plane = launch::control_plane_for(&app.config);
    let launcher = EnvironmentLauncher::new(&app.config, &app.store, &app.recent, plane.as_ref());
    match launcher.open(name, interactive) {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(StoreError::NotFound { name }) => {
            eprintln!("Project not found: {name}");
            Ok(ExitCode::from(1))
        }
        Err(err) => Err(err).context("Failed to open project"),
    }
}

fn pick_and_open(app: &App, kind: SelectorKind) -> Result<ExitCode> {
    let _instance = instance::acquire_or_exit(&app.config)?;
    app.ensure_built()?;

    let records = app.store.records().context("Failed to read project cache")?;
    if records.is_empty() {
        println!("No projects found");
        return Ok(ExitCode::SUCCESS);
    }
    let recent = app.recent.recent_names().unwrap_or_else(|err| {
        warn!(error = %err, "failed to read recent projects");
        Vec::new()
    });
    let lines: Vec<String> = rank_by_recency(&records, &recent, |record| record.name.as_str())
        .into_iter()
        .map(selector::display_line)
        .collect();

    let Some(picked) = selector::pick(kind, &lines).context("Failed to run project selector")?
    else {
        return Ok(ExitCode::SUCCESS);
    };
    let Some(name) = selector::name_from_line(&picked) else {
        return Ok(ExitCode::SUCCESS);
    };
    let interactive = kind == SelectorKind::Fzf && io::stdout().is_terminal();
    open_project(app, name, interactive)
}

fn list_projects(app: &App, args: &ListArgs) -> Result<ExitCode> {
    app.ensure_built()?;
    let records: Vec<ProjectRecord> = app
        .store
        .records()
        .context("Failed to read project cache")?
        .into_iter()
        .filter(|record| args.tag.as_deref().map_or(true, |tag| record.has_tag(tag)))
        .collect();

    print!("{}", render_project_list(&records, args.json)?);
    Ok(ExitCode::SUCCESS)
}

fn render_project_list(records: &[ProjectRecord], json: bool) -> Result<String> {
    if json {
        let body = serde_json::to_string_pretty(records).context("Failed to serialize projects")?;
        return Ok(format!("{body}\n"));
    }
    if records.is_empty() {
        return Ok("No projects found\n".to_string());
    }
    let mut out = String::new();
    for record in records {
        out.push_str(&selector::display_line(record));
        out.push('\n');
    }
    Ok(out)
}

fn list_recent(app: &App, args: &ListRecentArgs) -> Result<ExitCode> {
    let entries = app
        .recent
        .entries()
        .context("Failed to read recent projects")?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("Failed to serialize recent projects")?
        );
        return Ok(ExitCode::SUCCESS);
    }
    if entries.is_empty() {
        println!("No recent projects");
        return Ok(ExitCode::SUCCESS);
    }
    let now = Utc::now();
    for entry in &entries {
        println!("{} ({})", entry.name, relative_age(entry.timestamp, now));
    }
    Ok(ExitCode::SUCCESS)
}

fn debug_project(app: &App, name: &str) -> Result<ExitCode> {
    app.ensure_built()?;
    let record = match app.store.lookup(name) {
        Ok(record) => record,
        Err(StoreError::NotFound { name }) => {
            eprintln!("Project not found: {name}");
            return Ok(ExitCode::from(1));
        }
        Err(err) => return Err(err).context("Failed to read project cache"),
    };

    println!("name:       {}", record.name);
    println!("workspace:  {}", record.workspace);
    println!("tags:       {}", record.tags_field());
    println!("directory:  {}", record.directory.display());
    println!("descriptor: {}", record.config_path.display());
    match app.store.evaluator().eval_record(&record.config_path) {
        Ok(_) => println!("evaluator:  ok"),
        Err(err) => println!("evaluator:  {err} (fields scraped from text)"),
    }
    match descriptor::parse_environment(app.store.evaluator(), &record.config_path) {
        Ok(items) if items.is_empty() => println!("environment: none (bare terminal)"),
        Ok(items) => {
            println!("environment:");
            for (index, item) in items.iter().enumerate() {
                println!(
                    "  {}. {} command={:?} position={} url={:?} files={}",
                    index + 1,
                    item.kind,
                    item.command,
                    item.position,
                    item.url,
                    item.files.join(",")
                );
            }
        }
        Err(err) => println!("environment: unavailable ({err}); bare terminal"),
    }
    Ok(ExitCode::SUCCESS)
}

fn relative_age(timestamp: i64, now: DateTime<Utc>) -> String {
    let Some(then) = DateTime::<Utc>::from_timestamp(timestamp, 0) else {
        return "unknown".to_string();
    };
    let seconds = now.signed_duration_since(then).num_seconds();
    match seconds {
        s if s < 60 => "just now".to_string(),
        s if s < 3_600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3_600),
        s => format!("{}d ago", s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn list_reports_no_projects_for_empty_tree() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("projects");
        std::fs::create_dir_all(&root).expect("projects root");
        let app = App::new(Config::with_dirs(dir.path().join("state"), vec![root]), false);

        app.ensure_built().expect("build");
        let records = app.store.records().expect("records");
        assert_eq!(
            render_project_list(&records, false).expect("render"),
            "No projects found\n"
        );
        assert_eq!(render_project_list(&records, true).expect("render"), "[]\n");
    }

    #[test]
    fn list_renders_one_display_line_per_project() {
        let record = ProjectRecord {
            name: "shop".to_string(),
            workspace: "3".to_string(),
            tags: vec!["web".to_string()],
            directory: std::path::PathBuf::from("/p/shop"),
            config_path: std::path::PathBuf::from("/p/shop/.project.nix"),
        };
        assert_eq!(
            render_project_list(&[record], false).expect("render"),
            "shop | ws 3 | web\n"
        );
    }

    #[test]
    fn relative_age_buckets() {
        let now = Utc
            .with_ymd_and_hms(2026, 2, 23, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        let ts = now.timestamp();
        assert_eq!(relative_age(ts - 5, now), "just now");
        assert_eq!(relative_age(ts - 180, now), "3m ago");
        assert_eq!(relative_age(ts - 7_200, now), "2h ago");
        assert_eq!(relative_age(ts - 3 * 86_400, now), "3d ago");
        assert_eq!(relative_age(i64::MAX, now), "unknown");
    }

    #[test]
    fn cli_parses_documented_commands() {
        let cli = Cli::try_parse_from(["psw", "open", "shop"]).expect("open");
        assert!(matches!(cli.command, Commands::Open { ref name } if name == "shop"));

        let cli = Cli::try_parse_from(["psw", "--debug", "list", "--tag", "rust", "--json"])
            .expect("list");
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::List(ListArgs { ref tag, json: true }) if tag.as_deref() == Some("rust")));

        for command in ["build", "monitor", "stop-monitor", "monitor-status", "fix-cache", "list-recent"] {
            assert!(Cli::try_parse_from(["psw", command]).is_ok(), "{command}");
        }
        assert!(Cli::try_parse_from(["psw", "open"]).is_err());
    }
}
