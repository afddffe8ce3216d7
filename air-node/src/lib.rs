//! Air node library.
//!
//! This library provides the process-level pieces of an Air node:
//! configuration, the singleton lock and the startup orchestrator. It is
//! used by the `air` binary and can also be used for testing and embedding.

pub mod cli;
pub mod commands;
pub mod config;
pub mod env;
pub mod lock;
pub mod node;
pub mod paths;
pub mod shutdown;
