use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use daemonize::Daemonize;

use ilias_fuse_daemon::fuse::mount;
use ilias_fuse_daemon::{logging, Cli, Config};

/// Grace period for in-flight fetches once unmounted
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    // Detach before any threads exist; config paths are already absolute
    if config.background {
        Daemonize::new().start().context("failed to detach")?;
    }

    let log_dir = config.background.then_some(config.log_dir.as_path());
    let _guard = logging::init(&config.log_level, log_dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ilias-fuse-worker")
        .build()
        .context("failed to start the async runtime")?;

    let result = mount::run(&runtime, &config);
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    if let Err(err) = &result {
        tracing::error!(error = %format!("{:#}", err), "mount failed");
    }
    result
}
