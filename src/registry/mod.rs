//! Node registry: guarantees configuration nodes exist before anyone reads, watches or
//! writes them.

mod config_node;
mod node_registry;
pub use config_node::*;
pub use node_registry::*;
