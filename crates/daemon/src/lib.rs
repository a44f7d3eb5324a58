pub mod cli;
pub mod config;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;
pub mod provider;

pub use cli::Cli;
pub use config::{Config, ConfigError, FileConfig};
pub use provider::HttpTreeProvider;
