//! CLI command implementations

pub mod config;
pub mod list;
pub mod pending;
pub mod run;
pub mod verify;
