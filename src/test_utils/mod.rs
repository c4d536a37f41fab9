//! the test_utils folder here will share utils or test components between unit
//! tests and the session, watch and writer suites
mod common;

pub use common::*;
