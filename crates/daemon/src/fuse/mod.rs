//! FUSE filesystem integration
//!
//! # Architecture
//!
//! - `IliasFs`: `fuser` filesystem translating inode requests into path
//!   operations on [`common::fs::RemoteFs`]
//! - `InodeTable`: bidirectional inode ↔ path mapping
//! - `errno_for`: error kinds to OS error codes
//! - `mount`: mount lifecycle, idle eviction and teardown

mod errno;
mod ilias_fs;
mod inode_table;
pub mod mount;

pub use errno::errno_for;
pub use ilias_fs::IliasFs;
pub use inode_table::InodeTable;
