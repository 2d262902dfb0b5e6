#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("baseline io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("baseline json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;
