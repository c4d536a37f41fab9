mod common;
mod lifecycle;
mod resilience;
