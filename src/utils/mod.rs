pub mod backoff;
pub mod path;
pub mod time;

#[cfg(test)]
mod backoff_test;
