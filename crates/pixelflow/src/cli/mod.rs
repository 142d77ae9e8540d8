//! Subcommand implementations.

pub mod config;
pub mod janitor;
pub mod records;
pub mod run;
