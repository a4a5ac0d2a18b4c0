use async_trait::async_trait;
use relaycore::{pipe, BodyReader, Codec, CodecError, ManifestError, Reference, ReferenceStore, Template};
use relayruntime::{CodecConstructor, ComponentMetadata};
use std::sync::Arc;

const CHUNK_SIZE: usize = 8 * 1024;
const PIPE_CAPACITY: usize = 4;

/// JSON codec bound to one message of a flow
pub struct JsonCodec {
    resource: String,
    message: Option<Template>,
}

impl JsonCodec {
    pub fn new(resource: impl Into<String>, message: Option<Template>) -> Self {
        Self {
            resource: resource.into(),
            message,
        }
    }
}

#[async_trait]
impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn content_type(&self) -> &str {
        "application/json"
    }

    async fn marshal(&self, store: Arc<ReferenceStore>) -> Result<BodyReader, CodecError> {
        let Some(message) = self.message.clone() else {
            return Ok(BodyReader::empty());
        };

        let (writer, reader) = pipe(PIPE_CAPACITY);
        tokio::spawn(async move {
            let json = message.resolve(&store).unwrap_or(serde_json::Value::Null);
            let bytes = match serde_json::to_vec(&json) {
                Ok(bytes) => bytes,
                Err(e) => {
                    writer.fail(CodecError::Encode(e.to_string())).await;
                    return;
                }
            };

            for chunk in bytes.chunks(CHUNK_SIZE) {
                if writer.write(chunk).await.is_err() {
                    tracing::debug!("JSON body reader dropped before the end of the message");
                    return;
                }
            }

            let _ = writer.finish().await;
        });

        Ok(reader)
    }

    async fn unmarshal(&self, body: BodyReader, store: &ReferenceStore) -> Result<(), CodecError> {
        let bytes = body.read_to_end().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        let json: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| CodecError::Decode(e.to_string()))?;

        match &json {
            serde_json::Value::Object(map) => store.store_values(&self.resource, "", map),
            other => store.store_reference(&self.resource, Reference::from_json("", other)),
        }

        Ok(())
    }
}

pub struct JsonCodecConstructor;

impl CodecConstructor for JsonCodecConstructor {
    fn name(&self) -> &str {
        "json"
    }

    fn build(&self, resource: &str, message: Option<Template>) -> Result<Arc<dyn Codec>, ManifestError> {
        Ok(Arc::new(JsonCodec::new(resource, message)))
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Encode and decode JSON messages".to_string(),
            options: vec![],
        }
    }
}
