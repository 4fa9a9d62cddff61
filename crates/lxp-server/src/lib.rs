//! HTTP server for the LXP object store.
//!
//! Exposes repositories, buckets, and records of a single store as JSON
//! resources under `/v1`. Store calls run on the blocking pool.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::AppState;
pub use server::LxpServer;
