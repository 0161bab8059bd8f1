use thiserror::Error;

#[derive(Error, Debug)]
pub enum OnboardError {
    /// Channel or HTTP endpoint unreachable, closed, or answering with a failure status.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Malformed line, unexpected response kind, or correlation mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no download permit available after {attempts} attempts")]
    ResourceExhausted { attempts: u32 },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("container build failed: {0}")]
    ContainerBuild(String),

    /// The backend answered the call with an `Err` envelope.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("request {request_id} timed out")]
    Timeout { request_id: u32 },

    #[error("unknown game: {0}")]
    UnknownGame(String),

    #[error("game already running: {0}")]
    AlreadyRunning(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl OnboardError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, OnboardError::Connectivity(_))
    }
}

pub type Result<T> = std::result::Result<T, OnboardError>;
