//! Message codec interface
//!
//! Codecs translate between the reference store and a byte stream. They are
//! built per message when a flow is compiled and must be safe to use from
//! concurrent executions, each with its own store.

use crate::{BodyReader, CodecError, ReferenceStore};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    fn content_type(&self) -> &str {
        "application/octet-stream"
    }

    /// Encodes the message from the store. Encoding runs in its own task
    /// and streams into the returned reader.
    async fn marshal(&self, store: Arc<ReferenceStore>) -> Result<BodyReader, CodecError>;

    /// Decodes the body into the store
    async fn unmarshal(&self, body: BodyReader, store: &ReferenceStore) -> Result<(), CodecError>;
}
