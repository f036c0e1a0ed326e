use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("source API error (code {code}): {msg}")]
    Api { code: i64, msg: String },

    #[error("malformed tick at {timestamp}: {reason}")]
    MalformedTick { timestamp: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
