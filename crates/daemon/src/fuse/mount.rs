//! Mount lifecycle
//!
//! Prefetch the root, expose the filesystem, keep evicting idle nodes while
//! mounted, and tear everything down once the mount goes away.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common::fs::RemoteFs;
use fuser::MountOption;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::Notify;

use super::ilias_fs::IliasFs;
use super::inode_table::InodeTable;
use crate::config::Config;
use crate::provider::HttpTreeProvider;

pub const FS_NAME: &str = "ilias";

/// How often idle nodes are looked for, given the idle window
pub fn eviction_interval(idle_evict: Duration) -> Duration {
    (idle_evict / 4).max(Duration::from_secs(1))
}

pub fn mount_options(config: &Config) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::NoExec,
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype("ilias-fuse".to_string()),
    ];
    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    options
}

/// Periodically drop nodes nobody touched within the idle window, along
/// with inodes the kernel no longer references
pub async fn evict_idle_loop(fs: Arc<RemoteFs>, inodes: Arc<Mutex<InodeTable>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let dropped = fs.cache().evict_idle();
        let (released, remaining) = {
            let mut inodes = inodes.lock();
            (inodes.prune_unreferenced(), inodes.inode_count())
        };
        if dropped > 0 || released > 0 {
            tracing::info!(dropped, released, remaining, "idle nodes evicted");
        }
    }
}

/// Mount according to `config` and block until unmounted
///
/// Returns once the kernel session has ended, either because the mount was
/// removed externally or because the process was interrupted.
pub fn run(runtime: &Runtime, config: &Config) -> anyhow::Result<()> {
    let provider = HttpTreeProvider::new(
        config.base_url.clone(),
        config.cookie_file.clone(),
        config.fs.cache.request_timeout,
    )
    .context("failed to build the gateway client")?;
    let fs = Arc::new(RemoteFs::new(
        Arc::new(provider),
        config.root.clone(),
        config.fs.clone(),
    ));

    tracing::info!(root = %config.root, base_url = %config.base_url, "listing mount root");
    runtime
        .block_on(fs.prefetch_root())
        .with_context(|| format!("cannot list {} (is the session in {} still valid?)", config.root, config.cookie_file.display()))?;

    let inodes = Arc::new(Mutex::new(InodeTable::new()));
    let evictor = runtime.spawn(evict_idle_loop(
        fs.clone(),
        inodes.clone(),
        eviction_interval(config.fs.cache.idle_evict),
    ));

    let unmounted = Arc::new(Notify::new());
    let filesystem = IliasFs::new(fs.clone(), inodes, runtime.handle().clone(), unmounted.clone());
    let session = fuser::spawn_mount2(filesystem, &config.mount_dir, &mount_options(config))
        .with_context(|| format!("failed to mount at {}", config.mount_dir.display()))?;
    tracing::info!(mount_dir = %config.mount_dir.display(), "mounted");

    runtime.block_on(async {
        tokio::select! {
            _ = unmounted.notified() => tracing::info!("unmounted externally"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("interrupted, unmounting"),
                Err(err) => tracing::warn!(error = %err, "cannot listen for interrupts, unmounting"),
            },
        }
    });

    session.join();
    evictor.abort();

    let stats = fs.teardown();
    match serde_json::to_string(&stats) {
        Ok(json) => tracing::info!(stats = %json, "cache statistics"),
        Err(err) => tracing::debug!(error = %err, "cannot serialize cache statistics"),
    }
    Ok(())
}
