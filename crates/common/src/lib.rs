//! Read-only filesystem core over a lazily populated remote tree
//!
//! Layers, bottom up:
//!
//! - `provider`: the contract with whatever lists and serves the remote tree
//! - `node` / `cache`: the mirrored tree, populated on demand and reconciled by id
//! - `resolver`: mount-relative paths to nodes
//! - `handle`: streaming read handles with a bounded rewind window
//! - `fs`: the path-based surface an OS binding drives

pub mod cache;
pub mod fs;
pub mod handle;
pub mod names;
pub mod node;
pub mod provider;
pub mod resolver;
