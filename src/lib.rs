pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod prediction;

pub use client::{Client, RunOptions};
pub use config::ApiConfig;
pub use error::ApiError;
pub use prediction::{Input, Prediction, RunOutput, Status};

/// Crate version, taken from git tags at build time.
pub const VERSION: &str = env!("WAVESPEED_VERSION");
