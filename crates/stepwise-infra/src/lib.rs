//! Infrastructure layer for stepwise.
//!
//! Contains the `config.toml` loader and the built-in collaborator handlers
//! registered by the CLI: key-value write, named-tool dispatch, and echo.

pub mod config;
pub mod handlers;
