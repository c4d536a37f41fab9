//! Resilient configuration-watch client for hierarchical coordination stores
//!
//! - [`SessionManager`] keeps one session alive: connect, detect expiry, reconnect with
//!   jittered backoff, broadcast lifecycle events
//! - [`NodeRegistry`] creates configuration nodes with defaults, idempotently
//! - [`WatchEngine`] turns one-shot store watches into infinite change streams that
//!   re-arm themselves and reconcile after reconnects
//! - [`ConfigWriter`] applies read-modify-write updates conditioned on the node version
//!
//! [`ConfigClient`] wires them together over any [`CoordinationStore`].

mod client;
mod config;
mod errors;
mod registry;
mod session;
mod store;
mod watch;
mod writer;
pub mod utils;

pub use client::*;
pub use config::*;
pub use errors::*;
pub use registry::*;
pub use session::*;
pub use store::*;
pub use watch::*;
pub use writer::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
