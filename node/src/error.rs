//! Error taxonomy of a node
//!
//! Only [`NodeError::Bind`] is fatal; everything else is logged by the receive
//! path and the offending datagram or request is dropped.

use shared::{CodecError, ConfigError};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {socket} socket: {source}")]
    Bind {
        socket: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("malformed datagram from {addr}: {source}")]
    ProtocolDecode {
        addr: SocketAddr,
        #[source]
        source: CodecError,
    },

    #[error("malformed STATE from {addr}: {reason}")]
    MalformedState { addr: SocketAddr, reason: &'static str },

    #[error("message from or about unknown player {0}")]
    UnknownPeer(i32),

    #[error("no free 5x5 block to spawn a snake")]
    NoSpawnSpace,

    #[error("network I/O error: {0}")]
    NetworkIo(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no announced session named `{0}`")]
    UnknownSession(String),

    #[error("session `{0}` is not accepting players")]
    NotJoinable(String),

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("no answer to join request within {0:?}")]
    JoinTimeout(Duration),

    #[error("node already takes part in a session")]
    AlreadyInSession,

    #[error("node does not take part in a session")]
    NotInSession,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node is shutting down")]
    ShuttingDown,
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_formatting() {
        assert_eq!(
            NodeError::UnknownPeer(12).to_string(),
            "message from or about unknown player 12"
        );
        assert_eq!(
            NodeError::JoinRejected("Cannot find suitable position".into()).to_string(),
            "join rejected: Cannot find suitable position"
        );
    }

    #[test]
    fn test_bind_error_keeps_source() {
        let err = NodeError::Bind {
            socket: "unicast",
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().starts_with("failed to bind unicast socket"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_converts() {
        let err: NodeError = shared::GameConfig::new(1, 1, 1, 1).unwrap_err().into();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
