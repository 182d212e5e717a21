// Core ID types and channel tags for the sync protocol.
//
// Lightweight newtypes shared by `message.rs` and the server's client/lobby
// registries. IDs are server-assigned compact integers for efficient wire
// representation; `ClientId(0)` is reserved as "no client" so the first
// connected client receives ID 1.

use serde::{Deserialize, Serialize};

/// Server-assigned client ID. 0 is reserved as "no client".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    /// The reserved "no client" value.
    pub const NONE: ClientId = ClientId(0);
}

/// Per-client monotonic request ID, correlating an async api request with
/// its completion response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u32);

/// Logical delivery channel for a packet.
///
/// Over the TCP transport every channel is delivered reliably and in order;
/// the tag is preserved on the wire so a datagram transport can honor
/// `Unreliable` without a protocol change. Discriminants are wire-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PacketChannel {
    Setup = 0,
    Server = 1,
    Reliable = 2,
    Unreliable = 3,
    Internal = 4,
}

impl PacketChannel {
    /// Channel for a replication op given the caller's `reliable` flag.
    pub fn replication(reliable: bool) -> Self {
        if reliable {
            PacketChannel::Reliable
        } else {
            PacketChannel::Unreliable
        }
    }
}

impl From<PacketChannel> for u8 {
    fn from(channel: PacketChannel) -> u8 {
        channel as u8
    }
}

impl TryFrom<u8> for PacketChannel {
    type Error = crate::response::UnknownCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketChannel::Setup),
            1 => Ok(PacketChannel::Server),
            2 => Ok(PacketChannel::Reliable),
            3 => Ok(PacketChannel::Unreliable),
            4 => Ok(PacketChannel::Internal),
            other => Err(crate::response::UnknownCode {
                family: "PacketChannel",
                value: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_discriminants_are_stable() {
        assert_eq!(u8::from(PacketChannel::Setup), 0);
        assert_eq!(u8::from(PacketChannel::Server), 1);
        assert_eq!(u8::from(PacketChannel::Reliable), 2);
        assert_eq!(u8::from(PacketChannel::Unreliable), 3);
        assert_eq!(u8::from(PacketChannel::Internal), 4);
    }

    #[test]
    fn channel_serializes_as_number() {
        let json = serde_json::to_string(&PacketChannel::Unreliable).unwrap();
        assert_eq!(json, "3");
        let back: PacketChannel = serde_json::from_str("3").unwrap();
        assert_eq!(back, PacketChannel::Unreliable);
    }

    #[test]
    fn channel_rejects_unknown_value() {
        assert!(serde_json::from_str::<PacketChannel>("9").is_err());
    }

    #[test]
    fn replication_channel_from_reliable_flag() {
        assert_eq!(PacketChannel::replication(true), PacketChannel::Reliable);
        assert_eq!(PacketChannel::replication(false), PacketChannel::Unreliable);
    }
}
