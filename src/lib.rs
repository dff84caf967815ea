pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod latency;
pub mod models;
pub mod telemetry;

pub use error::{ModeldError, Result};
