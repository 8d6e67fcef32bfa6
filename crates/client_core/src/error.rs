use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatClientError {
    #[error("no live push connection")]
    NotConnected,
    #[error("hub rejected {method}: {source}")]
    InvocationRejected {
        method: &'static str,
        #[source]
        source: ApiError,
    },
    #[error("push connection lost before {method} completed")]
    ConnectionLost { method: &'static str },
    #[error("invalid hub url '{url}': {reason}")]
    InvalidHubUrl { url: String, reason: String },
    #[error("unexpected response from {endpoint}: {reason}")]
    UnexpectedResponse { endpoint: String, reason: String },
}
