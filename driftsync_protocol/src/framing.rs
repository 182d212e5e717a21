// Length-delimited message framing over TCP.
//
// Provides the wire format for `message.rs` types: a 4-byte big-endian
// length prefix followed by a JSON-serialized message payload. Both
// `write_message` and `read_message` operate on raw `&[u8]` / `Vec<u8>` —
// the caller handles JSON serialization separately, keeping this module
// format-agnostic.
//
// A `MAX_MESSAGE_SIZE` constant (256 KB) protects against unbounded
// allocation from malformed or malicious length prefixes. Player documents
// are the largest expected payloads; the server enforces its own tighter
// per-request cap on top of this hard limit.

use std::io::{self, Read, Write};

/// Maximum allowed message size (256 KB). Protects against unbounded
/// allocation from malformed length prefixes.
pub const MAX_MESSAGE_SIZE: u32 = 256 * 1024;

/// Write a length-delimited message: 4-byte big-endian length, then payload.
pub fn write_message<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = u32::try_from(msg.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                    msg.len()
                ),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(msg)?;
    writer.flush()
}

/// Read a length-delimited message: 4-byte big-endian length, then payload.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// message. Returns `InvalidData` if the length exceeds `MAX_MESSAGE_SIZE`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use crate::message::{ApiRequest, ClientMessage, ServerMessage};
    use crate::types::{ClientId, PacketChannel, RequestId};

    use super::*;

    #[test]
    fn frames_a_replication_message() {
        let msg = ClientMessage::SetVar {
            target: None,
            node_path: "world/player1".into(),
            variable: "health".into(),
            value: json!(73),
            channel: PacketChannel::Unreliable,
        };
        let payload = serde_json::to_vec(&msg).unwrap();
        let mut buf = Vec::new();
        write_message(&mut buf, &payload).unwrap();

        // 4-byte big-endian length prefix, then the JSON payload untouched.
        assert_eq!(&buf[..4], &(payload.len() as u32).to_be_bytes()[..]);
        assert_eq!(&buf[4..], &payload[..]);

        let recovered = read_message(&mut Cursor::new(&buf)).unwrap();
        let decoded: ClientMessage = serde_json::from_slice(&recovered).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn server_events_stream_back_to_back() {
        let events = vec![
            ServerMessage::Welcome {
                client_id: ClientId(1),
            },
            ServerMessage::VarSet {
                from: ClientId(2),
                node_path: "world/door".into(),
                variable: "open".into(),
                value: json!(true),
            },
            ServerMessage::NodeOwnerChanged {
                node_path: "world/door".into(),
                owner: None,
            },
        ];
        let mut buf = Vec::new();
        for event in &events {
            write_message(&mut buf, &serde_json::to_vec(event).unwrap()).unwrap();
        }

        // One read per frame, in send order, with no leftover bytes.
        let mut cursor = Cursor::new(&buf);
        for expected in &events {
            let bytes = read_message(&mut cursor).unwrap();
            let decoded: ServerMessage = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(decoded, *expected);
        }
        assert_eq!(cursor.position(), buf.len() as u64);
    }

    #[test]
    fn oversized_document_is_refused_on_write() {
        // A single player document larger than the frame cap.
        let request = ClientMessage::Request {
            id: RequestId(1),
            request: ApiRequest::SetDocument {
                path: "saves/slot1".into(),
                document: json!("x".repeat(MAX_MESSAGE_SIZE as usize)),
                externally_visible: false,
            },
        };
        let payload = serde_json::to_vec(&request).unwrap();
        let mut buf = Vec::new();
        let err = write_message(&mut buf, &payload).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty(), "nothing may reach the wire");
    }

    #[test]
    fn hostile_length_prefix_is_refused_on_read() {
        let prefix = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let err = read_message(&mut Cursor::new(prefix.to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_reads_as_eof() {
        let payload = serde_json::to_vec(&ClientMessage::Goodbye).unwrap();
        let mut buf = Vec::new();
        write_message(&mut buf, &payload).unwrap();

        // Drop the tail of the payload, as a mid-message hangup would.
        buf.truncate(buf.len() - 2);
        let err = read_message(&mut Cursor::new(&buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Losing part of the length prefix itself reads the same way.
        let err = read_message(&mut Cursor::new(vec![0u8, 1])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
