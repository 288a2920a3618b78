//! Error taxonomy shared by the gateway link and the client store.
//!
//! Every variant is delivered to the waiting caller as an `Err`; none of them
//! tears down the runtime. Only [`Error::Config`] stops automatic reconnects.

use crate::protocol::ErrorCode;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// A credential needed to open the connection is missing.
    #[error("{0} not configured")]
    Config(String),

    /// `connect()` was called while a socket is already being opened or is open.
    #[error("connection already in progress")]
    AlreadyConnecting,

    /// The gateway answered the handshake with `ok: false`.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// No live (and, for the gateway link, authenticated) connection.
    #[error("not connected")]
    NotConnected,

    /// No response within the request timeout. The request may still have run upstream.
    #[error("request timed out: {0}")]
    RpcTimeout(String),

    /// The socket dropped while the request was outstanding.
    #[error("disconnected")]
    Disconnected,

    /// The peer answered with an error response.
    #[error("{message}")]
    Rpc {
        message: String,
        code: Option<ErrorCode>,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
