use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "ilias-fuse.log";

/// Build the filter: `RUST_LOG` directives on top of `level`
pub fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let default: LevelFilter = level
        .parse()
        .with_context(|| format!("invalid log level {level:?}"))?;
    Ok(EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy())
}

/// Install the global subscriber
///
/// With `log_dir` set, output goes to a daily rolling file through a
/// non-blocking writer; keep the returned guard alive until shutdown or
/// buffered lines are lost.
pub fn init(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = env_filter(level)?;

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert!(env_filter("debug").is_ok());
        assert!(env_filter("WARN").is_ok());
        assert!(env_filter("chatty").is_err());
    }
}
