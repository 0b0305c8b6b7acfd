use thiserror::Error;

/// Coarse classification surfaced to users, matching the backend's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unknown,
    Network,
    Server,
    Client,
    AuthenticationRequired,
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot connect to server: {0}")]
    Network(String),
    #[error("telescope {0} not found")]
    NotFound(String),
    #[error("telescope {telescope_id} rejected the request: {reason}")]
    Conflict { telescope_id: String, reason: String },
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid backend url: {0}")]
    Url(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Network(_) => ErrorKind::Network,
            RegistryError::NotFound(_) | RegistryError::Conflict { .. } => ErrorKind::Client,
            RegistryError::UnexpectedStatus { status, .. } => match *status {
                401 => ErrorKind::AuthenticationRequired,
                403 => ErrorKind::Unauthorized,
                400..=499 => ErrorKind::Client,
                500..=599 => ErrorKind::Server,
                _ => ErrorKind::Unknown,
            },
            RegistryError::Decode(_) | RegistryError::Url(_) => ErrorKind::Unknown,
        }
    }

    /// True when the request may never have reached the backend, or the backend
    /// failed on its side; the telescope state is then unknown rather than refused.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RegistryError::Decode(err.to_string())
        } else {
            RegistryError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn classifies_statuses() {
        let status = |code| RegistryError::UnexpectedStatus {
            status: code,
            body: String::new(),
        };
        assert_eq!(status(401).kind(), ErrorKind::AuthenticationRequired);
        assert_eq!(status(403).kind(), ErrorKind::Unauthorized);
        assert_eq!(status(422).kind(), ErrorKind::Client);
        assert_eq!(status(503).kind(), ErrorKind::Server);
        assert_eq!(status(302).kind(), ErrorKind::Unknown);
        assert!(status(500).is_transient());
        assert!(!status(409).is_transient());
        assert!(RegistryError::Network("refused".into()).is_transient());
        assert!(!RegistryError::NotFound("t".into()).is_transient());
    }
}
