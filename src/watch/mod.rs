//! Watch engine
//!
//! Turns the store's one-shot watches into infinite, restartable event streams.
//!
//! ```text
//!  AwaitingSession -> Arming -> Armed -> Fired -> Arming ...
//!                       |                  ^
//!                       +--> Degraded -----+  (re-arm keeps retrying)
//!  any phase -> Cancelled
//! ```
//!
//! Each watched path gets one dispatch task. The task arms the store watch *before*
//! reading the node, so a change landing between the read and the next fire is never
//! missed. After a reconnect the read doubles as reconciliation: a synthetic event is
//! delivered only if the value differs from the one last delivered.

mod engine;
mod event;
mod stream;
pub use engine::*;
pub use event::*;
pub use stream::*;
