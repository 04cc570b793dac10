//! Retry policies shared by the storage backends and the client worker.

pub mod retry;

pub use retry::{retry, RetryConfig};
