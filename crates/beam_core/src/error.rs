//! Error types shared by the registry and the agent.

use std::time::Duration;

use crate::wire::WireError;

/// Result alias used across the beam crates.
pub type Result<T> = std::result::Result<T, BeamError>;

/// Errors that can occur while running a registry or a node agent.
#[derive(Debug, thiserror::Error)]
pub enum BeamError {
    /// An I/O error on a socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame or field could not be encoded or decoded.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// A `host:port` string could not be resolved to a socket address.
    #[error("Cannot resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    /// None of the candidate listening ports could be bound.
    #[error("No candidate port could be bound:\n{}", attempts.join("\n"))]
    NoCandidatePort { attempts: Vec<String> },

    /// The registry could not be reached.
    #[error("Registry at {addr} unreachable: {reason}")]
    RegistryUnreachable { addr: String, reason: String },

    /// The registry answered a registration with a non-OK status.
    #[error("Registration of {name} rejected with status {status:#04x}")]
    RegistrationRejected { name: String, status: u8 },

    /// A frame carried an opcode this side does not understand.
    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// A reply carried the wrong opcode echo or status byte.
    #[error("Unexpected reply: expected {expected:#04x}, got {got:#04x}")]
    UnexpectedReply { expected: u8, got: u8 },

    /// A node identifier was not of the form `name@host`.
    #[error("Invalid node name: {0:?}")]
    InvalidNodeName(String),

    /// A mailbox was handed out a second routine id.
    #[error("Routine id already assigned: {id}")]
    RoutineIdAssigned { id: u64 },

    /// `serve` was called before a successful `listen`.
    #[error("Service is not listening")]
    NotListening,

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The connection was closed before the exchange finished.
    #[error("Connection to {0} closed")]
    ConnectionClosed(String),
}

impl BeamError {
    /// Whether the error comes from a malformed or truncated frame rather
    /// than from the environment.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Wire(_) | Self::UnknownOpcode(_) | Self::UnexpectedReply { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_candidate_port_lists_every_attempt() {
        let err = BeamError::NoCandidatePort {
            attempts: vec!["26130: in use".into(), "26131: in use".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("26130: in use"));
        assert!(msg.contains("26131: in use"));
    }

    #[test]
    fn test_protocol_classification() {
        assert!(BeamError::UnknownOpcode(0xff).is_protocol());
        assert!(
            BeamError::Wire(WireError::InsufficientData { needed: 2, have: 1 }).is_protocol()
        );
        assert!(!BeamError::NotListening.is_protocol());
        assert!(!BeamError::Timeout(Duration::from_secs(1)).is_protocol());
    }
}
