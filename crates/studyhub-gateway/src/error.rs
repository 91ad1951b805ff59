use thiserror::Error;

/// Why a publish reached nobody. Never surfaced to API callers.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no live subscribers on {0}")]
    NoSubscribers(String),

    #[error("failed to encode {kind} event: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
