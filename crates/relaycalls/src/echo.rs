use async_trait::async_trait;
use relaycore::{BodyWriter, CallError, Caller, ManifestError, ReferenceStore, Request, ServiceSpec};
use relayruntime::{CallerConstructor, ComponentMetadata};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Loopback caller answering every request with its own body
pub struct EchoCaller {
    delay: Duration,
}

impl EchoCaller {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Caller for EchoCaller {
    fn name(&self) -> &str {
        "echo"
    }

    async fn call(
        &self,
        request: Request,
        response: BodyWriter,
        _store: Arc<ReferenceStore>,
    ) -> Result<(), CallError> {
        let mut body = request.body;

        if !self.delay.is_zero() {
            tracing::debug!("Delaying echo of {} for {:?}", request.endpoint, self.delay);
            tokio::select! {
                _ = request.cancellation.cancelled() => {
                    response.fail(CallError::Cancelled).await;
                    return Err(CallError::Cancelled);
                }
                _ = sleep(self.delay) => {}
            }
        }

        // Forward chunk by chunk so producer errors reach the reader
        loop {
            match body.chunk().await {
                Ok(Some(chunk)) => response.write(chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    response.fail(&e).await;
                    return Err(e.into());
                }
            }
        }

        response.finish().await?;
        Ok(())
    }
}

pub struct EchoCallerConstructor;

impl CallerConstructor for EchoCallerConstructor {
    fn name(&self) -> &str {
        "echo"
    }

    fn dial(&self, service: &ServiceSpec) -> Result<Arc<dyn Caller>, ManifestError> {
        let delay_ms = match service.options.get("delay_ms") {
            Some(delay) => delay.parse::<u64>().map_err(|e| {
                ManifestError::Invalid(format!("Service {} has an invalid delay_ms {}: {}", service.name, delay, e))
            })?,
            None => 0,
        };

        Ok(Arc::new(EchoCaller::new(Duration::from_millis(delay_ms))))
    }

    fn metadata(&self) -> ComponentMetadata {
        ComponentMetadata {
            description: "Answer every request with its own body".to_string(),
            options: vec![("delay_ms".to_string(), "Delay before answering, in milliseconds".to_string())],
        }
    }
}
