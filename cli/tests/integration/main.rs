//! Integration tests for keel CLI
//!
//! These tests spawn the actual binary and test end-to-end behavior.
//! They never reach a cloud provider: every command exercised here stops
//! at the local state database or earlier.

mod cli_tests;
mod config_command;
mod state_commands;
