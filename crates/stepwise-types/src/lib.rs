//! Shared domain types for stepwise.
//!
//! This crate contains the data shapes used across the engine: workflow
//! definitions and step templates, retry policies, execution statuses, run
//! results, engine configuration, and the store error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
