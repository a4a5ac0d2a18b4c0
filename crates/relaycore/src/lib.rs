//! Core abstractions for the relay flow engine
//!
//! This crate provides the reference store, the per-execution tracker and the
//! traits that every other component depends on. It carries no scheduling
//! logic of its own.

pub mod codec;
pub mod condition;
mod error;
pub mod events;
pub mod manifest;
mod node;
mod reference;
pub mod stream;
pub mod template;
mod tracker;
pub mod transport;
mod value;

pub use codec::Codec;
pub use condition::{Condition, Expression, Predicate};
pub use error::{CallError, CodecError, FlowError, ManifestError, StreamError};
pub use events::*;
pub use manifest::{duration_option, CallSpec, EndpointSpec, FlowSpec, Manifest, NodeSpec, ServiceSpec};
pub use node::{call_fn, Call, CallContext, FnCall, Node, NodeId};
pub use reference::{
    join_path, Payload, PropertyRef, Reference, ReferenceStore, INPUT_RESOURCE, PARAMS_RESOURCE,
};
pub use stream::{pipe, BodyReader, BodyWriter};
pub use template::Template;
pub use tracker::{NodeGuard, NodeState, Outcome, Readiness, Tracker};
pub use transport::{Caller, Request};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
