//! Flow execution runtime
//!
//! This crate compiles manifests into flows, resolves codecs and callers
//! through the registry, and schedules node calls concurrently.

mod compiler;
mod endpoint;
mod flow;
mod manager;
mod registry;
mod runtime;
mod service;

pub use compiler::{CompiledManifest, Compiler};
pub use endpoint::{bind_listeners, Endpoint, Listener};
pub use flow::{Flow, FlowBuilder, NodeDefinition};
pub use manager::{ExecutionResult, Instance, Manager};
pub use registry::{CallerConstructor, CodecConstructor, ComponentMetadata, Registry};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use service::ServiceCall;
