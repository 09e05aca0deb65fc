use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session not connected")]
    NotConnected,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Result sink error: {0}")]
    Sink(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl HarvestError {
    /// Transient errors are expected to clear up on a later cycle without
    /// intervention (timeouts, a session that dropped mid-call).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarvestError::Timeout(_)
                | HarvestError::NotConnected
                | HarvestError::Session(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_trouble_is_transient() {
        assert!(HarvestError::Timeout("subscribe".into()).is_transient());
        assert!(HarvestError::NotConnected.is_transient());
        assert!(HarvestError::Session("server unreachable".into()).is_transient());

        assert!(!HarvestError::Sink("disk full".into()).is_transient());
        assert!(!HarvestError::Config("bad".into()).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "tags.txt");
        assert!(!HarvestError::from(io).is_transient());
    }
}
