// Client-side error type.
//
// A handshake the server refuses is not represented here — `connect`
// reports it through the `ConnectionFailed` event so the game handles it
// like any other connection outcome. `ClientError` covers transport-level
// failures only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not connected")]
    NotConnected,
}
