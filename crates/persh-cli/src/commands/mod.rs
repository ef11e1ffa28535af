//! CLI subcommand implementations.

pub mod attach;
