use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Spawn failure, closed stream or failed handshake with a backend process.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Skill error: {0}")]
    Skill(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
