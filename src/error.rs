//! Shared error taxonomy.

use crate::wire::CloseCode;
use thiserror::Error;

/// Error kinds a connection or hub operation can raise.
///
/// Each variant knows how it should be surfaced (a close code, a dropped
/// event, or a logged-and-continued protocol error) via
/// [`GatewayError::close_code`] and [`GatewayError::is_fatal`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("send queue full")]
    Backpressure,

    #[error("upstream pub/sub failure: {0}")]
    Upstream(String),

    #[error("session unknown or expired")]
    SessionUnknown { expired: bool },

    #[error("over capacity")]
    Overcapacity,
}

impl GatewayError {
    /// Close code to send on the transport, if this error is fatal to the
    /// connection. Protocol violations and backpressure are *not* fatal —
    /// they are logged/counted and the connection stays open.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Auth(_) => Some(CloseCode::AuthenticationFailed),
            Self::SessionUnknown { expired: true } => Some(CloseCode::SessionTimedOut),
            Self::SessionUnknown { expired: false } => Some(CloseCode::InvalidSession),
            Self::Transport(_) => None,
            Self::Protocol(_) => None,
            Self::Backpressure => None,
            Self::Upstream(_) => None,
            Self::Overcapacity => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.close_code().is_some() || matches!(self, Self::Transport(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_closes_with_4001() {
        let err = GatewayError::Auth("bad token".into());
        assert_eq!(err.close_code().unwrap().code(), 4001);
        assert!(err.is_fatal());
    }

    #[test]
    fn protocol_violation_is_not_fatal() {
        let err = GatewayError::Protocol("unknown opcode".into());
        assert!(err.close_code().is_none());
        assert!(!err.is_fatal());
    }

    #[test]
    fn session_unknown_variants_pick_distinct_codes() {
        assert_eq!(
            GatewayError::SessionUnknown { expired: false }
                .close_code()
                .unwrap()
                .code(),
            4006
        );
        assert_eq!(
            GatewayError::SessionUnknown { expired: true }
                .close_code()
                .unwrap()
                .code(),
            4009
        );
    }
}
