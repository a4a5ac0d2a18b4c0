use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node '{node}' failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: CallError,
    },

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Flow '{0}' was cancelled")]
    Cancelled(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote service responded with status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Missing reference: {0}")]
    MissingReference(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Stream closed by the reading side")]
    Closed,

    #[error("Stream ended without an end-of-stream marker")]
    Truncated,

    #[error("Stream producer failed: {0}")]
    Producer(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManifestError {
    #[error("Flow not found: {0}")]
    NotFound(String),

    #[error("Invalid manifest: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected at node '{0}'")]
    CyclicDependency(String),

    #[error("Duplicate node '{node}' in flow '{flow}'")]
    DuplicateNode { flow: String, node: String },

    #[error("Duplicate flow: {0}")]
    DuplicateFlow(String),

    #[error("Duplicate service: {0}")]
    DuplicateService(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    NodeNotFound { node: String, dependency: String },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Unknown caller: {0}")]
    UnknownCaller(String),

    #[error("Unknown listener: {0}")]
    UnknownListener(String),

    #[error("Node '{node}' references unknown resource '{resource}'")]
    UnknownResource { node: String, resource: String },

    #[error("Invalid reference: {0}")]
    InvalidReference(String),
}
