//! Command line interface

pub mod args;
pub mod commands;
pub mod progress;

pub use args::{Cli, Commands};
