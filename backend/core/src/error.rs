use thiserror::Error;

/// Top-level error type for the chime engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("trigger '{0}' not found in catalog")]
    MissingTrigger(String),

    #[error("webhook resolution failed: {0}")]
    WebhookResolution(String),

    #[error("header resolution failed: {0}")]
    HeaderResolution(String),

    #[error("invalid event status '{0}'")]
    InvalidStatus(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
