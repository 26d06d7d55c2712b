//! HTTP binding with connection-level retry.

mod client;
mod retry;

pub use client::{HttpClient, PredictionApi};
pub use retry::{ConnectionRetry, backoff, pause, with_connection_retry};

#[cfg(test)]
pub use client::MockPredictionApi;
