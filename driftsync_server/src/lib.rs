// driftsync_server — the multiplayer synchronization and session server.
//
// A standalone TCP service that game clients connect to through
// `driftsync_client`. It relays replication traffic (variable writes,
// function calls, node spawns, synced events) between lobby members, runs
// the lobby directory, and answers async api requests against the account,
// document, and leaderboard stores.
//
// Module overview:
// - `server.rs`:       TCP listener, reader threads, and the main event
//                      loop driving the hub. `start_server` is the entry
//                      point for embedding (tests) and the `syncd` binary.
// - `hub.rs`:          Central state owner — clients, lobbies, replication
//                      fan-out, and api request dispatch.
// - `lobby.rs`:        Lobby state and create/join validation.
// - `accounts.rs`:     Account registry — credentials, verification,
//                      sessions, reports, and player documents.
// - `leaderboards.rs`: Score boards with paging.
// - `storage.rs`:      JSON snapshot persistence for accounts and scores.

pub mod accounts;
pub mod hub;
pub mod leaderboards;
pub mod lobby;
pub mod server;
pub mod storage;

pub use hub::Caps;
pub use server::{PROTOCOL_VERSION, ServerConfig, ServerHandle, start_server};
