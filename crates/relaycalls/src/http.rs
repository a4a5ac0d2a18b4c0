use async_trait::async_trait;
use relaycore::{
    duration_option, BodyWriter, CallError, Caller, ManifestError, ReferenceStore, Request, ServiceSpec,
};
use relayruntime::{CallerConstructor, ComponentMetadata};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEADER_OPTION_PREFIX: &str = "header.";

/// Service options understood by the HTTP caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerOptions {
    /// Response chunks are coalesced and written at most this often
    pub flush_interval: Option<Duration>,
    /// Deadline for the whole request, body included
    pub timeout: Option<Duration>,
}

impl CallerOptions {
    pub fn parse(options: &HashMap<String, String>) -> Result<Self, ManifestError> {
        Ok(Self {
            flush_interval: duration_option(options, "flush_interval")?,
            timeout: duration_option(options, "timeout")?,
        })
    }
}

/// HTTP caller for one service
pub struct HttpCaller {
    client: reqwest::Client,
    host: String,
    headers: HeaderMap,
    flush_interval: Option<Duration>,
}

impl HttpCaller {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
            headers: HeaderMap::new(),
            flush_interval: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_options(mut self, options: CallerOptions) -> Result<Self, ManifestError> {
        if let Some(timeout) = options.timeout {
            self.client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ManifestError::Invalid(format!("Failed to build HTTP client: {}", e)))?;
        }
        self.flush_interval = options.flush_interval;
        Ok(self)
    }

    fn url(&self, endpoint: &str) -> String {
        let host = self.host.trim_end_matches('/');
        if endpoint.is_empty() {
            host.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", host, endpoint)
        } else {
            format!("{}/{}", host, endpoint)
        }
    }
}

#[async_trait]
impl Caller for HttpCaller {
    fn name(&self) -> &str {
        "http"
    }

    async fn call(
        &self,
        request: Request,
        response: BodyWriter,
        _store: Arc<ReferenceStore>,
    ) -> Result<(), CallError> {
        let body = request.body.read_to_end().await?;

        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| CallError::Transport(format!("Unsupported method {}: {}", request.method, e)))?;
        let url = self.url(&request.endpoint);
        tracing::debug!("{} {}", method, url);

        let mut builder = self.client.request(method, &url).headers(self.headers.clone());
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let sent = tokio::select! {
            _ = request.cancellation.cancelled() => {
                response.fail(CallError::Cancelled).await;
                return Err(CallError::Cancelled);
            }
            sent = builder.send() => sent,
        };

        let mut remote = match sent {
            Ok(remote) => remote,
            Err(e) => {
                let error = CallError::Transport(format!("HTTP request failed: {}", e));
                response.fail(&error).await;
                return Err(error);
            }
        };

        let status = remote.status();
        if !status.is_success() {
            let message = remote.text().await.unwrap_or_default();
            let error = CallError::Remote {
                status: status.as_u16(),
                message,
            };
            response.fail(&error).await;
            return Err(error);
        }

        let mut pending: Vec<u8> = Vec::new();
        let mut flushed = Instant::now();
        loop {
            let chunk = tokio::select! {
                _ = request.cancellation.cancelled() => {
                    response.fail(CallError::Cancelled).await;
                    return Err(CallError::Cancelled);
                }
                chunk = remote.chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => match self.flush_interval {
                    None => response.write(bytes.to_vec()).await?,
                    Some(interval) => {
                        pending.extend_from_slice(&bytes);
                        if flushed.elapsed() >= interval {
                            response.write(std::mem::take(&mut pending)).await?;
                            flushed = Instant::now();
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    let error = CallError::Transport(format!("Failed to read response: {}", e));
                    response.fail(&error).await;
                    return Err(error);
                }
            }
        }

        if !pending.is_empty() {
            response.write(pending).await?;
        }
        response.finish().await?;
        Ok(())
    }
}

pub struct HttpCallerConstructor;

impl CallerConstructor for HttpCallerConstructor {
    fn name(&self) -> &str {
        "http"
    }

    fn dial(&self, service: &ServiceSpec) -> Result<Arc<dyn Caller>, ManifestError> {
        Url::parse(&service.host).map_err(|e| {
            ManifestError::Invalid(format!("Service {} has an invalid host {}: {}", service.name, service.host, e))
        })?;

        let mut headers = HeaderMap::new();
        for (key, value) in &service.options {
            let Some(name) = key.strip_prefix(HEADER_OPTION_PREFIX) else {
                continue;
            };

            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ManifestError::Invalid(format!("Invalid header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ManifestError::Invalid(format!("Invalid header value {}: {}", value, e)))?;
            headers.insert(name, value);
        }

        let options = CallerOptions::parse(&service.options)?;
        Ok(Arc::new(
            HttpCaller::new(&service.host).with_headers(headers).with_options(options)?,
        ))
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Make HTTP requests".to_string(),
            options: vec![
                (
                    "header.<name>".to_string(),
                    "Header sent with every request to the service".to_string(),
                ),
                (
                    "flush_interval".to_string(),
                    "Coalesce response chunks and flush them at this interval".to_string(),
                ),
                ("timeout".to_string(), "Deadline for each request".to_string()),
            ],
        }
    }
}
