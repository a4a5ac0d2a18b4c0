//! Transport caller interface

use crate::{BodyReader, BodyWriter, CallError, ReferenceStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outgoing request handed to a caller
pub struct Request {
    pub method: String,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub body: BodyReader,
    pub cancellation: CancellationToken,
}

/// Performs calls against one service
#[async_trait]
pub trait Caller: Send + Sync {
    fn name(&self) -> &str;

    /// Sends the request and streams the response body into `response`.
    /// The caller must finish or fail the writer before returning.
    async fn call(
        &self,
        request: Request,
        response: BodyWriter,
        store: Arc<ReferenceStore>,
    ) -> Result<(), CallError>;
}
