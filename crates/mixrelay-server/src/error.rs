//! Server error types.

use std::fmt;

use crate::pool::PoolError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error
    Config(String),

    /// Transport/network error
    Transport(String),

    /// TLS setup or handshake error
    Tls(String),

    /// Internal error
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Tls(msg) => write!(f, "TLS error: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<PoolError> for ServerError {
    fn from(err: PoolError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<getrandom::Error> for ServerError {
    fn from(err: getrandom::Error) -> Self {
        Self::Internal(format!("OS RNG unavailable: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_category() {
        let err = ServerError::from(PoolError::InvalidCapacity(1));
        assert_eq!(err.to_string(), "configuration error: pool capacity must be at least 2, got 1");

        let err = ServerError::from(std::io::Error::other("reset"));
        assert_eq!(err.to_string(), "transport error: reset");
    }
}
