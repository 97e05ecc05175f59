//! Command-line interface
//!
//! Argument parsing only; `main` maps each command onto the library.

pub mod commands;

pub use commands::{Command, Opt};
