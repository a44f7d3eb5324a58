//! Shared fixtures for the filesystem scenario tests

#![allow(dead_code)]

use std::sync::Arc;

use ::common::fs::{FsConfig, RemoteFs};
use ::common::provider::{MemoryProvider, NodeId, RemoteEntry};

pub const COURSE_ID: u64 = 12345;

/// Deterministic file content of the given length
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Course 12345 with a lecture folder and a syllabus
pub fn course_provider() -> Arc<MemoryProvider> {
    let provider = Arc::new(MemoryProvider::new());
    provider.set_children(
        NodeId::course(COURSE_ID),
        vec![
            RemoteEntry::directory("fold_10", "Lecture Notes"),
            RemoteEntry::file("file_20", "syllabus.pdf", Some(2048)),
        ],
    );
    provider.set_children(
        "fold_10",
        vec![
            RemoteEntry::file("file_30", "week1.pdf", Some(512)),
            RemoteEntry::file("file_31", "week2.pdf", Some(512)),
        ],
    );
    provider.set_content("file_20", content(2048));
    provider.set_content("file_30", content(512));
    provider.set_content("file_31", content(512));
    provider
}

pub fn mount(provider: &Arc<MemoryProvider>, config: FsConfig) -> RemoteFs {
    RemoteFs::new(provider.clone(), NodeId::course(COURSE_ID), config)
}

/// Install a log subscriber once; honors RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
