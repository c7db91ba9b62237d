use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Subscription closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Text generation unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Text generation returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Text generation returned no text")]
    Empty,

    #[error("Text generation timed out after {0}s")]
    Timeout(u64),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
