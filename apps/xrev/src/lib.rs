//! # xrev
//!
//! Command-line front end for the xrev engine.
//!
//! - `cli`: argument parsing and command implementations
//! - `config`: `xrev.toml` loading and environment overrides
//!
//! The binary in `main.rs` only installs logging and dispatches to
//! [`cli::execute`]; everything else lives here so it can be tested.

pub mod cli;
pub mod config;
