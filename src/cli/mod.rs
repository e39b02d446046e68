//! Command-line interface for redis-mq.
//!
//! Operator commands for inspecting queues, moving messages between
//! structures and running the background maintenance loops.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
