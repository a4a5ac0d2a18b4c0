//! HTTP front-end for relay flows

mod listener;
mod options;

pub use listener::HttpListener;
pub use options::{EndpointOptions, ListenerOptions, DEFAULT_TIMEOUT};
