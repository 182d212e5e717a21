// TCP connection and handshake for the sync client.
//
// Provides a non-blocking interface for the game thread to communicate with
// the sync server. Architecture:
// - `establish()` performs TCP connect + Hello handshake on the calling
//   thread, then spawns a background reader thread.
// - The reader thread calls `read_message()` in a loop, deserializes
//   `ServerMessage`, and pushes into an `mpsc` channel.
// - The caller holds a `BufWriter<TcpStream>` for sending.
//
// This separation ensures the game thread never blocks on network I/O. The
// reader thread handles the blocking reads, and the writer flushes
// synchronously (acceptable for the small messages we send).

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use driftsync_protocol::framing::{read_message, write_message};
use driftsync_protocol::message::{ClientMessage, ServerMessage};
use driftsync_protocol::response::ConnectError;
use driftsync_protocol::types::ClientId;

use crate::error::ClientError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the client is in its connection lifecycle. The intermediate steps
/// are momentary with a direct TCP transport but kept distinct so embedders
/// can surface progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection and none in progress.
    Disabled,
    /// Resolving the server address.
    FindingServer,
    /// Probing server reachability.
    Pinging,
    /// TCP connect in progress.
    Connecting,
    /// Transport up, handshake in flight.
    Connected,
    /// Handshake accepted; the connection is fully usable.
    Secured,
}

/// An established connection: the write half, the reader thread's inbox,
/// and the server-assigned ID.
pub(crate) struct Connection {
    pub writer: BufWriter<TcpStream>,
    pub inbox: Receiver<ServerMessage>,
    pub _reader_thread: Option<JoinHandle<()>>,
    pub client_id: ClientId,
}

/// Outcome of a handshake attempt that reached a server. A refusal is not
/// an error: the server answered, it just said no.
pub(crate) enum Handshake {
    Accepted(Connection),
    Refused(ConnectError),
}

/// Connect to a sync server, perform the Hello handshake, and spawn a
/// reader thread on acceptance. `status` is stepped through the lifecycle
/// as the attempt progresses so a failure leaves it at the stage that
/// failed.
pub(crate) fn establish(
    addr: &str,
    api_key: &str,
    username: &str,
    status: &mut ConnectionStatus,
) -> Result<Handshake, ClientError> {
    // The address is given directly and the transport is plain TCP, so the
    // resolve and reachability-probe stages complete immediately.
    *status = ConnectionStatus::FindingServer;
    *status = ConnectionStatus::Pinging;
    *status = ConnectionStatus::Connecting;
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
    *status = ConnectionStatus::Connected;

    let reader_stream = stream.try_clone()?;
    let mut writer = BufWriter::new(stream);

    send(
        &mut writer,
        &ClientMessage::Hello {
            protocol_version: 1,
            api_key: api_key.into(),
            username: username.into(),
        },
    )?;

    // Read Welcome or Rejected.
    let mut reader = BufReader::new(reader_stream);
    let response_bytes = read_message(&mut reader)?;
    let response: ServerMessage = serde_json::from_slice(&response_bytes)
        .map_err(|e| ClientError::Protocol(format!("bad handshake response: {e}")))?;

    let client_id = match response {
        ServerMessage::Welcome { client_id } => client_id,
        ServerMessage::Rejected { error } => return Ok(Handshake::Refused(error)),
        other => {
            return Err(ClientError::Protocol(format!(
                "expected Welcome, got {other:?}"
            )));
        }
    };
    *status = ConnectionStatus::Secured;

    // Clear read timeout for the long-lived reader loop.
    if let Ok(inner) = reader.get_ref().try_clone() {
        inner.set_read_timeout(None).ok();
    }

    let (tx, rx) = mpsc::channel();
    let reader_thread = thread::spawn(move || {
        reader_loop(reader, tx);
    });

    Ok(Handshake::Accepted(Connection {
        writer,
        inbox: rx,
        _reader_thread: Some(reader_thread),
        client_id,
    }))
}

/// Serialize a `ClientMessage` to JSON and write with length-delimited
/// framing.
pub(crate) fn send(
    writer: &mut BufWriter<TcpStream>,
    msg: &ClientMessage,
) -> Result<(), ClientError> {
    let json =
        serde_json::to_vec(msg).map_err(|e| ClientError::Protocol(format!("serialize: {e}")))?;
    write_message(writer, &json)?;
    Ok(())
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ServerMessage>) {
    while let Ok(bytes) = read_message(&mut reader) {
        match serde_json::from_slice::<ServerMessage>(&bytes) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break; // Client dropped the receiver
                }
            }
            Err(_) => break, // Malformed message
        }
    }
}
