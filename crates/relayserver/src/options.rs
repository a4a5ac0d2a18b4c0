use actix_web::http::Method;
use relaycore::{duration_option, ManifestError};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server-wide HTTP options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Time a client has to send the request head
    pub read_timeout: Duration,
    /// Time a client has to acknowledge a closed connection
    pub write_timeout: Duration,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ListenerOptions {
    pub fn parse(options: &HashMap<String, String>) -> Result<Self, ManifestError> {
        Ok(Self {
            read_timeout: duration_option(options, "read_timeout")?.unwrap_or(DEFAULT_TIMEOUT),
            write_timeout: duration_option(options, "write_timeout")?.unwrap_or(DEFAULT_TIMEOUT),
        })
    }
}

/// Options of a single HTTP endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointOptions {
    pub method: Method,
    pub endpoint: String,
    /// Deadline for decoding the request and running the flow
    pub read_timeout: Duration,
    /// Deadline for each chunk of the encoded response
    pub write_timeout: Duration,
}

impl EndpointOptions {
    pub fn parse(flow: &str, options: &HashMap<String, String>) -> Result<Self, ManifestError> {
        let endpoint = options
            .get("endpoint")
            .filter(|path| path.starts_with('/'))
            .ok_or_else(|| {
                ManifestError::Invalid(format!(
                    "HTTP endpoint of flow {} needs an endpoint option starting with '/'",
                    flow
                ))
            })?
            .to_string();

        let method = options.get("method").map(String::as_str).unwrap_or("POST").to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ManifestError::Invalid(format!("Invalid method {}: {}", method, e)))?;

        Ok(Self {
            method,
            endpoint,
            read_timeout: duration_option(options, "read_timeout")?.unwrap_or(DEFAULT_TIMEOUT),
            write_timeout: duration_option(options, "write_timeout")?.unwrap_or(DEFAULT_TIMEOUT),
        })
    }
}
