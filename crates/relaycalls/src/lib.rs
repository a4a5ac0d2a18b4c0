//! Standard codecs and callers
//!
//! Collection of built-in components for common protocols

mod echo;
mod http;
mod json;
mod xml;

pub use echo::{EchoCaller, EchoCallerConstructor};
pub use http::{CallerOptions, HttpCaller, HttpCallerConstructor};
pub use json::{JsonCodec, JsonCodecConstructor};
pub use xml::{XmlCodec, XmlCodecConstructor};
use relayruntime::Registry;

use std::sync::Arc;

/// Register all standard components with a registry
pub fn register_all(registry: &mut Registry) {
    registry.register_codec(Arc::new(JsonCodecConstructor));
    registry.register_codec(Arc::new(XmlCodecConstructor::default()));
    registry.register_caller(Arc::new(HttpCallerConstructor));
    registry.register_caller(Arc::new(EchoCallerConstructor));
}
