//! Fixtures for unit tests
//!
//! Every chain lives in its own temporary directory and mines at
//! [`TEST_DIFFICULTY`], so tests stay fast and isolated.

pub mod test_utils;

pub use test_utils::*;
