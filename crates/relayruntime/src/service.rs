use async_trait::async_trait;
use relaycore::{
    pipe, Call, CallContext, CallError, Caller, Codec, NodeEvent, ReferenceStore, Request,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::task::AbortOnDropHandle;

/// Call against a remote service: encodes the request from the store, hands
/// it to the service's caller and decodes the response back into the store.
pub struct ServiceCall {
    service: String,
    method: String,
    endpoint: String,
    caller: Arc<dyn Caller>,
    request: Arc<dyn Codec>,
    response: Arc<dyn Codec>,
    buffer: usize,
}

impl ServiceCall {
    pub fn new(
        service: impl Into<String>,
        caller: Arc<dyn Caller>,
        request: Arc<dyn Codec>,
        response: Arc<dyn Codec>,
    ) -> Self {
        Self {
            service: service.into(),
            method: "POST".to_string(),
            endpoint: String::new(),
            caller,
            request,
            response,
            buffer: 16,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

#[async_trait]
impl Call for ServiceCall {
    async fn call(&self, ctx: CallContext, store: Arc<ReferenceStore>) -> Result<(), CallError> {
        tracing::debug!(
            "Calling {} {} on service {} for node {}",
            self.method,
            self.endpoint,
            self.service,
            ctx.node
        );

        let body = self.request.marshal(store.clone()).await?;

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), self.request.content_type().to_string());

        let request = Request {
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
            headers,
            body,
            cancellation: ctx.cancellation.clone(),
        };

        let (writer, reader) = pipe(self.buffer);
        let caller = self.caller.clone();
        let transport_store = store.clone();
        let transport = AbortOnDropHandle::new(tokio::spawn(async move {
            caller.call(request, writer, transport_store).await
        }));

        ctx.events.emit(NodeEvent::Dispatched {
            service: self.service.clone(),
            method: self.method.clone(),
            endpoint: self.endpoint.clone(),
        });

        let decoded = self.response.unmarshal(reader, &store).await;

        let transported = transport
            .await
            .map_err(|e| CallError::Transport(format!("Task join error: {}", e)))?;

        if let Err(error) = transported {
            ctx.events.emit(NodeEvent::Warning {
                message: format!("Service {} failed: {}", self.service, error),
            });
            return Err(error);
        }

        decoded?;
        ctx.events.emit(NodeEvent::Responded {
            service: self.service.clone(),
        });
        Ok(())
    }
}
