//! Subcommands of the `tally` CLI.

pub mod access;
pub mod config;
pub mod dead_letters;
pub mod events;
pub mod project;
pub mod user;
