//! Remote tree providers backed by the network

mod http;
pub mod wire;

pub use http::HttpTreeProvider;
