/// Errors surfaced by runner implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to start runner: {0}")]
    Spawn(String),

    #[error("runner not started")]
    NotStarted,

    #[error("runner already started")]
    AlreadyStarted,

    #[error("runner exited with status {0}")]
    ExitStatus(i32),

    #[error("runner terminated by signal")]
    Terminated,

    #[error("runner io error: {0}")]
    Io(String),

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(RunnerError::ExitStatus(2).to_string(), "runner exited with status 2");
        assert_eq!(RunnerError::NotStarted.to_string(), "runner not started");
        let io: RunnerError = std::io::Error::new(std::io::ErrorKind::NotFound, "claude").into();
        assert!(io.to_string().contains("claude"));
    }
}
