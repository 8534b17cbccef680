use thiserror::Error;

#[derive(Debug, Error)]
pub enum MoleError {
    #[error("configuration error: {0}")]
    ConfigParse(String),

    #[error("key parse error: {0}")]
    KeyParse(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("dial failed: {0}")]
    DialFailure(String),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("listener failed: {0}")]
    ListenerFailure(String),

    #[error("tunnel has no forwarding strategy")]
    StrategyAbsent,

    #[error("authentication denied for {user} from {remote}")]
    AuthDenied { user: String, remote: String },

    #[error("approval channel error: {0}")]
    UdsFailure(String),

    #[error("client is not connected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MoleError>;

impl MoleError {
    /// True when the caller should keep retrying (dial/accept/bind class
    /// failures); false for errors that are fatal for the entity.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DialFailure(_)
                | Self::SessionLost(_)
                | Self::ListenerFailure(_)
                | Self::Disconnected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MoleError::DialFailure("refused".into()).is_retryable());
        assert!(MoleError::SessionLost("eof".into()).is_retryable());
        assert!(!MoleError::StrategyAbsent.is_retryable());
        assert!(!MoleError::ConfigParse("bad yaml".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = MoleError::AuthDenied {
            user: "bob".into(),
            remote: "10.0.0.9:51123".into(),
        };
        assert_eq!(
            err.to_string(),
            "authentication denied for bob from 10.0.0.9:51123"
        );
    }
}
