//! Built-in step handlers for external collaborators.
//!
//! - `kv` -- key-value write-or-delete with restoring compensation
//! - `tool` -- dispatch to named tools (`tool.invoke`)
//! - `echo` -- returns its input unchanged

pub mod echo;
pub mod kv;
pub mod tool;

use std::sync::Arc;

use stepwise_core::handler::HandlerRegistry;

pub use echo::EchoHandler;
pub use kv::{InMemoryKvStore, KvStore, KvWriteHandler};
pub use tool::{ToolDispatcher, ToolFn};

/// Register every built-in handler into `registry`.
pub fn register_builtins<S: KvStore + 'static>(
    registry: &mut HandlerRegistry,
    kv: Arc<S>,
    tools: ToolDispatcher,
) {
    registry.register(EchoHandler);
    registry.register(KvWriteHandler::new(kv));
    registry.register(tools);
}
