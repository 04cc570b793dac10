//! Durable backends for the server-side sync event log.

pub mod traits;
pub mod memory;
pub mod sql;
