//! Config writer: optimistic read-modify-write against versioned nodes.

mod config_writer;
pub use config_writer::*;

#[cfg(test)]
mod config_writer_test;
