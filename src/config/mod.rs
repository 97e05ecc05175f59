//! Configuration management
//!
//! Node settings come from environment variables and are resolved once in
//! `main`, then passed to whatever needs them.

pub mod settings;

pub use settings::{Config, SEED_NODE};
