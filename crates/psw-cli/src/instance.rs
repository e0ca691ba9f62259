use anyhow::{Context, Result};
use psw_core::Config;
use psw_storage::InstanceLock;
use tracing::info;

/// Takes the interactive-instance lock, or exits with status 0 when another
/// interactive invocation already holds it. The lock lives until the process
/// exits.
pub fn acquire_or_exit(config: &Config) -> Result<InstanceLock> {
    match InstanceLock::try_acquire(config).context("Failed to open instance lock")? {
        Some(lock) => Ok(lock),
        None => {
            info!(lock = %config.instance_lock_path().display(), "another instance is running");
            std::process::exit(0);
        }
    }
}
