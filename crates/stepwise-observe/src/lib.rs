//! Observability for stepwise: subscriber setup and optional span export.

pub mod tracing_setup;
