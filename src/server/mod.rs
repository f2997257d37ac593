//! Subspace server.
//!
//! Demultiplexes one UDP socket into per-peer sessions.

#[allow(clippy::module_inception)]
mod server;
mod session;

pub use server::*;
pub use session::*;
