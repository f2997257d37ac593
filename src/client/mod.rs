//! Subspace client.
//!
//! Key exchange plus a task-driven [`Client`] around one
//! [`Connection`](crate::transport::Connection).

mod bootstrap;
#[allow(clippy::module_inception)]
mod client;

pub use bootstrap::*;
pub use client::*;
