// driftsync_protocol — wire protocol for the driftsync multiplayer service.
//
// This crate defines the message types, response codes, framing, and
// serialization used by the sync server (`driftsync_server`) and the typed
// client (`driftsync_client`) to communicate over TCP. It is shared between
// both sides and has no dependency on either.
//
// Module overview:
// - `types.rs`:    Core ID types — `ClientId`, `RequestId` — and the
//                  `PacketChannel` delivery tag.
// - `message.rs`:  Client-to-server and server-to-client message enums, the
//                  `ApiRequest`/`ApiResponse` operation envelopes, plus
//                  supporting structs (`PlayerInfo`, `LobbyInfo`,
//                  `NodeSpawn`, `LeaderboardEntry`).
// - `response.rs`: Closed response-code enums, one family per async
//                  operation, all sharing the Success/NoResponseFromServer/
//                  DataCapReached/RateLimitExceeded/NoDatabase prefix.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON serialization.** Human-debuggable and covers the arbitrary
//   `Value` payloads lobby metadata and documents carry. Binary framing can
//   be swapped in later if bandwidth matters.
// - **Numeric enum codes.** Response codes and channel tags serialize as
//   their numeric discriminants; those numbers are the wire contract.
// - **No async runtime.** Uses `std::io::Read`/`Write` for framing,
//   compatible with both blocking TCP streams and buffered wrappers.

pub mod framing;
pub mod message;
pub mod response;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{
    ApiRequest, ApiResponse, ClientMessage, LeaderboardEntry, LobbyInfo, NodeSpawn, PlayerInfo,
    ServerMessage,
};
pub use response::{SharedCode, UnknownCode};
pub use types::{ClientId, PacketChannel, RequestId};

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use serde_json::json;

    use super::*;
    use crate::response::{LobbyJoinError, LoginCode};

    /// Serialize a ClientMessage to JSON, frame it, read it back, deserialize.
    fn client_roundtrip(msg: &ClientMessage) {
        let json = serde_json::to_vec(msg).unwrap();
        let mut wire = Vec::new();
        write_message(&mut wire, &json).unwrap();

        let mut cursor = Cursor::new(&wire);
        let recovered_json = read_message(&mut cursor).unwrap();
        let recovered: ClientMessage = serde_json::from_slice(&recovered_json).unwrap();
        assert_eq!(&recovered, msg);
    }

    /// Serialize a ServerMessage to JSON, frame it, read it back, deserialize.
    fn server_roundtrip(msg: &ServerMessage) {
        let json = serde_json::to_vec(msg).unwrap();
        let mut wire = Vec::new();
        write_message(&mut wire, &json).unwrap();

        let mut cursor = Cursor::new(&wire);
        let recovered_json = read_message(&mut cursor).unwrap();
        let recovered: ServerMessage = serde_json::from_slice(&recovered_json).unwrap();
        assert_eq!(&recovered, msg);
    }

    #[test]
    fn roundtrip_hello() {
        client_roundtrip(&ClientMessage::Hello {
            protocol_version: 1,
            api_key: "test-key".into(),
            username: "Player1".into(),
        });
    }

    #[test]
    fn roundtrip_set_var_targeted() {
        client_roundtrip(&ClientMessage::SetVar {
            target: Some(ClientId(7)),
            node_path: "/root/World/Player".into(),
            variable: "health".into(),
            value: json!(42.5),
            channel: PacketChannel::Unreliable,
        });
    }

    #[test]
    fn roundtrip_call_function_broadcast() {
        client_roundtrip(&ClientMessage::CallFunction {
            target: None,
            node_path: "/root/World".into(),
            function: "spawn_pickup".into(),
            args: vec![json!("medkit"), json!([10, 4, -3])],
            channel: PacketChannel::Reliable,
        });
    }

    #[test]
    fn roundtrip_create_lobby_empty_maps() {
        // Optional maps omitted by the caller travel as empty maps, never as
        // an absent field.
        let msg = ClientMessage::CreateLobby {
            name: "duel-arena".into(),
            password: String::new(),
            public: true,
            player_limit: 0,
            tags: BTreeMap::new(),
            data: BTreeMap::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"tags\":{}"));
        assert!(json.contains("\"data\":{}"));
        client_roundtrip(&msg);
    }

    #[test]
    fn roundtrip_instantiate_node() {
        client_roundtrip(&ClientMessage::InstantiateNode {
            spawn: NodeSpawn {
                instantiator: ClientId(2),
                scene: "res://actors/crate.tscn".into(),
                parent_path: "/root/World".into(),
                node_path: "/root/World/crate@2:1".into(),
                sync_starting_changes: true,
                excluded_properties: vec!["velocity".into()],
                changed_properties: BTreeMap::from([("position".into(), json!([1, 2, 3]))]),
            },
            replicate_on_join: true,
        });
    }

    #[test]
    fn roundtrip_request_envelope() {
        client_roundtrip(&ClientMessage::Request {
            id: RequestId(9),
            request: ApiRequest::Login {
                email: "pilot@drift.example".into(),
                password: "hunter22".into(),
                valid_time: 86400.0,
            },
        });
    }

    #[test]
    fn roundtrip_welcome() {
        server_roundtrip(&ServerMessage::Welcome {
            client_id: ClientId(1),
        });
    }

    #[test]
    fn roundtrip_lobby_joined() {
        server_roundtrip(&ServerMessage::LobbyJoined {
            name: "duel-arena".into(),
            host: ClientId(1),
            player_limit: 4,
            players: vec![PlayerInfo {
                id: ClientId(1),
                username: "Host".into(),
                data: BTreeMap::from([("ready".into(), json!(true))]),
            }],
            tags: BTreeMap::from([("mode".into(), json!("ffa"))]),
            data: BTreeMap::new(),
        });
    }

    #[test]
    fn roundtrip_lobby_join_failed() {
        server_roundtrip(&ServerMessage::LobbyJoinFailed {
            name: "duel-arena".into(),
            error: LobbyJoinError::IncorrectPassword,
        });
    }

    #[test]
    fn roundtrip_synced_event() {
        server_roundtrip(&ServerMessage::SyncedEvent {
            name: "round_start".into(),
            delay: 1.0,
            args: vec![json!(3)],
        });
    }

    #[test]
    fn roundtrip_owner_cleared() {
        server_roundtrip(&ServerMessage::NodeOwnerChanged {
            node_path: "/root/World/Flag".into(),
            owner: None,
        });
    }

    #[test]
    fn roundtrip_response_with_payload() {
        server_roundtrip(&ServerMessage::Response {
            id: RequestId(9),
            response: ApiResponse::Login {
                code: LoginCode::Success,
                session_token: Some("b6a1f09e44d2c713".into()),
                username: Some("TestPilot".into()),
            },
        });
    }

    #[test]
    fn roundtrip_leaderboard_page() {
        server_roundtrip(&ServerMessage::Response {
            id: RequestId(12),
            response: ApiResponse::BrowseLeaderboard {
                code: response::BrowseLeaderboardCode::Success,
                entries: vec![
                    LeaderboardEntry {
                        username: "alice".into(),
                        score: 9000,
                    },
                    LeaderboardEntry {
                        username: "bob".into(),
                        score: 4500,
                    },
                ],
            },
        });
    }
}
