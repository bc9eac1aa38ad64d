use thiserror::Error;

use crate::errors::UNKNOWN_OBJECT;

/// Prefix some bus libraries prepend to remote error text.
const REMOTE_ERROR_FRAMING: &str = "GDBus.Error:";

/// Errors surfaced by the bus transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Error reply sent by the remote peer.
    #[error("{message}")]
    Remote { name: String, message: String },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("timeout was reached")]
    Timeout,

    #[error("connection closed")]
    Disconnected,

    #[error("{0}")]
    Failed(String),
}

impl BusError {
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        BusError::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Parses raw transport error text, removing the `GDBus.Error:<name>: `
    /// framing when present.
    pub fn from_raw(text: &str) -> Self {
        if let Some(rest) = text.strip_prefix(REMOTE_ERROR_FRAMING) {
            if let Some((name, message)) = rest.split_once(": ") {
                return BusError::remote(name, message);
            }
            return BusError::remote(rest, "");
        }
        BusError::Failed(text.to_string())
    }

    /// Remote error name, if this is an error reply.
    pub fn name(&self) -> Option<&str> {
        match self {
            BusError::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// True when the peer reported that the addressed object does not exist.
    pub fn is_unknown_object(&self) -> bool {
        match self {
            BusError::Remote { name, message } => {
                name == UNKNOWN_OBJECT || message.contains(UNKNOWN_OBJECT)
            }
            BusError::Failed(text) => text.contains(UNKNOWN_OBJECT),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_strips_framing() {
        let err = BusError::from_raw(
            "GDBus.Error:net.connman.Error.InProgress: Operation already in progress",
        );
        assert_eq!(err.name(), Some("net.connman.Error.InProgress"));
        assert_eq!(err.to_string(), "Operation already in progress");
    }

    #[test]
    fn from_raw_keeps_unframed_text() {
        let err = BusError::from_raw("Connection refused");
        assert_eq!(err, BusError::Failed("Connection refused".into()));
        assert_eq!(err.name(), None);
    }

    #[test]
    fn unknown_object_detection() {
        assert!(BusError::remote(UNKNOWN_OBJECT, "Method \"Scan\" doesn't exist").is_unknown_object());
        assert!(BusError::Failed(format!("{}: no such object", UNKNOWN_OBJECT)).is_unknown_object());
        assert!(!BusError::remote("net.connman.Error.Failed", "boom").is_unknown_object());
        assert!(!BusError::Timeout.is_unknown_object());
    }
}
