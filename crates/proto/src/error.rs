//! Codec error types

/// Errors from decoding an inbound record
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed '{kind}' record: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
