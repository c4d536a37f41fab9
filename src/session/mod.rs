//! Session lifecycle
//!
//! [`SessionManager`] owns the one connection to the coordination store. Every other
//! component borrows the current [`Session`] through
//! [`ensure_connected`](SessionManager::ensure_connected) right before each round trip and
//! never keeps it across a reconnect.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Disconnected (network loss, resumable)
//!       ▲              │  ▲            │
//!       └──── retry ───┘  │            └──────► Expired (fresh session required)
//!                         └──────────────────────────┘
//! ```

mod manager;
mod session;

pub use manager::*;
pub use session::*;
