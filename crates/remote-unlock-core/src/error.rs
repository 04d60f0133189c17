use thiserror::Error;

/// Result alias for core operations.
pub type UnlockResult<T> = Result<T, UnlockError>;

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("[RU1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[RU1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[RU1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[RU1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[RU2000] provider error: {0}")]
    Provider(String),

    #[error("[RU3000] transport error: {0}")]
    Transport(String),

    #[error("[RU4000] shutdown requested before all volumes were unlocked")]
    Cancelled,

    #[error("[RU4001] session server stopped before all volumes were unlocked")]
    ServerStopped,

    #[error("[RU4002] background task failed: {0}")]
    Task(String),
}

impl UnlockError {
    pub fn code(&self) -> &'static str {
        match self {
            UnlockError::Io(_) => "RU1000",
            UnlockError::Toml(_) => "RU1001",
            UnlockError::Yaml(_) => "RU1002",
            UnlockError::InvalidConfig(_) => "RU1100",
            UnlockError::Provider(_) => "RU2000",
            UnlockError::Transport(_) => "RU3000",
            UnlockError::Cancelled => "RU4000",
            UnlockError::ServerStopped => "RU4001",
            UnlockError::Task(_) => "RU4002",
        }
    }

    /// True when the error only reflects a cooperative shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UnlockError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for UnlockError {
    fn from(err: tokio::task::JoinError) -> Self {
        UnlockError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_display_prefix() {
        let errors = [
            UnlockError::InvalidConfig("bad".into()),
            UnlockError::Provider("zfs exploded".into()),
            UnlockError::Transport("bind failed".into()),
            UnlockError::Cancelled,
            UnlockError::ServerStopped,
            UnlockError::Task("panicked".into()),
        ];
        for err in errors {
            let rendered = err.to_string();
            assert!(
                rendered.starts_with(&format!("[{}]", err.code())),
                "{rendered}"
            );
        }
    }

    #[test]
    fn only_cancelled_reports_cancellation() {
        assert!(UnlockError::Cancelled.is_cancelled());
        assert!(!UnlockError::ServerStopped.is_cancelled());
    }
}
