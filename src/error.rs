use crate::job::ValidationError;
use crate::store::StoreError;

/// Error surface of the public entry points.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid job: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid cron expression: {0}")]
    Cron(String),

    #[error("no current context; call create_context first")]
    NoContext,

    #[error("configuration error: {0}")]
    Config(String),
}
