//! Error types for the warm-pool orchestrator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Management agent error: {0}")]
    Agent(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Couldn't find prepared container with ID {0}")]
    PreparedContainerNotFound(String),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Lookup failures that are returned to the caller and never retried
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PreparedContainerNotFound(_) | Error::ServerNotFound(_)
        )
    }
}
