// Game-side client for the driftsync server.
//
// `SyncClient` is the whole surface: connect, fire replication and lobby
// calls from the game loop, `poll()` for `SyncEvent`s each frame, and use
// the blocking account/document/leaderboard methods for backend state.
//
// Module map:
// - api: `SyncClient` and the replicated-state mirrors.
// - connection: TCP transport, handshake, background reader thread.
// - events: `SyncEvent` and the synced-event delay queue.
// - security: exposure registry filtering inbound replication.
// - error: `ClientError`.

pub mod api;
pub mod connection;
pub mod error;
pub mod events;
pub mod security;

pub use api::{CreateLobbyOptions, InstantiateOptions, SyncClient};
pub use connection::ConnectionStatus;
pub use error::ClientError;
pub use events::SyncEvent;
pub use security::SecurityRegistry;

pub use driftsync_protocol as protocol;
