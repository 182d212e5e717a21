// Protocol messages for client-server communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by game clients to the sync server. Fire-and-forget
//   ops (replication, lobby, player data) plus `Request`, the envelope for
//   every async account/document/leaderboard operation.
// - `ServerMessage`: sent by the sync server to game clients. Event
//   broadcasts plus `Response`, the completion matching a `Request` by ID.
//
// `ApiRequest`/`ApiResponse` enumerate the async operations with one variant
// per operation — a statically-typed stub surface rather than call-by-name
// dispatch. Arbitrary values travel as `serde_json::Value`; key/value maps
// are `BTreeMap` so serialized forms are deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::response::{
    BrowseCollectionCode, BrowseLeaderboardCode, ChangePasswordCode, ChangeUsernameCode,
    ConnectError, CreateAccountCode, CriticalError, DeleteAccountCode, DeleteDocumentCode,
    DeleteScoreCode, GetDocumentCode, GetLeaderboardScoreCode, GetLeaderboardsCode,
    HasDocumentCode, HasLeaderboardCode, IsVerifiedCode, LobbyCreateError, LobbyJoinError,
    LoginCode, LogoutCode, ReportUserCode, RequestPasswordResetCode, ResendVerificationCode,
    ResetPasswordCode, SetDocumentCode, SetExternalVisibleCode, SubmitScoreCode,
    VerifyAccountCode,
};
use crate::types::{ClientId, PacketChannel, RequestId};

/// Public identity of a connected client, including its replicated data map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: ClientId,
    pub username: String,
    pub data: BTreeMap<String, Value>,
}

/// Directory entry for a public lobby.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LobbyInfo {
    pub name: String,
    pub player_count: u32,
    /// 0 = unlimited.
    pub player_limit: u32,
    pub open: bool,
    pub has_password: bool,
    pub tags: BTreeMap<String, Value>,
}

/// One scored record on a leaderboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub score: i64,
}

/// A networked node spawn, broadcast on instantiate and optionally replayed
/// to late joiners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpawn {
    pub instantiator: ClientId,
    pub scene: String,
    pub parent_path: String,
    /// Unique path assigned by the instantiating client.
    pub node_path: String,
    pub sync_starting_changes: bool,
    pub excluded_properties: Vec<String>,
    /// Property values diverging from the scene defaults at spawn time.
    pub changed_properties: BTreeMap<String, Value>,
}

/// Messages sent by a client to the sync server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Connection handshake. Must be the first message on a connection.
    Hello {
        protocol_version: u32,
        api_key: String,
        username: String,
    },
    /// Client is leaving gracefully.
    Goodbye,

    /// Replicate a variable write to lobby members (or one target member).
    SetVar {
        target: Option<ClientId>,
        node_path: String,
        variable: String,
        value: Value,
        channel: PacketChannel,
    },
    /// Replicate a function call to lobby members (or one target member).
    CallFunction {
        target: Option<ClientId>,
        node_path: String,
        function: String,
        args: Vec<Value>,
        channel: PacketChannel,
    },
    /// Schedule an event on every lobby member (including the sender) after
    /// a shared delay, so all peers fire at approximately the same time.
    CreateSyncedEvent {
        name: String,
        delay: f32,
        args: Vec<Value>,
    },
    /// Announce a networked node spawn. When `replicate_on_join` is set the
    /// server records the spawn and replays it to late joiners.
    InstantiateNode {
        spawn: NodeSpawn,
        replicate_on_join: bool,
    },
    /// Assign or clear (owner = None) the owner of a networked node.
    SetNodeOwner {
        node_path: String,
        owner: Option<ClientId>,
    },

    /// Request the public lobby directory.
    GetPublicLobbies,
    CreateLobby {
        name: String,
        /// Empty string = no password.
        password: String,
        public: bool,
        /// 0 = unlimited.
        player_limit: u32,
        tags: BTreeMap<String, Value>,
        data: BTreeMap<String, Value>,
    },
    JoinLobby {
        name: String,
        password: String,
    },
    LeaveLobby,
    /// Host only: allow joins again.
    OpenLobby,
    /// Host only: refuse further joins.
    CloseLobby,
    /// Host only: show or hide the lobby in the public directory.
    SetLobbyVisibility { public: bool },
    /// Host only.
    SetLobbyPlayerLimit { limit: u32 },
    /// Host only. Empty string clears the password.
    SetLobbyPassword { password: String },
    SetLobbyTag { key: String, value: Value },
    EraseLobbyTag { key: String },
    SetLobbyData { key: String, value: Value },
    EraseLobbyData { key: String },

    SetPlayerData { key: String, value: Value },
    ErasePlayerData { key: String },
    SetUsername { username: String },

    /// Envelope for an async api operation.
    Request { id: RequestId, request: ApiRequest },
}

/// Messages sent by the sync server to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted; the assigned client ID.
    Welcome { client_id: ClientId },
    /// Handshake rejected.
    Rejected { error: ConnectError },

    /// The lobby host changed (previous host left).
    HostChanged { host: ClientId },
    LobbyCreated { name: String },
    LobbyCreationFailed {
        name: String,
        error: LobbyCreateError,
    },
    /// Sent to the joiner with the full replicated lobby state.
    LobbyJoined {
        name: String,
        host: ClientId,
        player_limit: u32,
        players: Vec<PlayerInfo>,
        tags: BTreeMap<String, Value>,
        data: BTreeMap<String, Value>,
    },
    LobbyJoinFailed {
        name: String,
        error: LobbyJoinError,
    },
    LobbiesReceived { lobbies: Vec<LobbyInfo> },
    /// value = None means the key was erased.
    LobbyDataChanged {
        key: String,
        value: Option<Value>,
    },
    LobbyTagChanged {
        key: String,
        value: Option<Value>,
    },
    ClientJoined { player: PlayerInfo },
    ClientLeft { client: ClientId },
    PlayerDataChanged {
        client: ClientId,
        key: String,
        value: Option<Value>,
    },

    VarSet {
        from: ClientId,
        node_path: String,
        variable: String,
        value: Value,
    },
    FunctionCalled {
        from: ClientId,
        node_path: String,
        function: String,
        args: Vec<Value>,
    },
    SyncedEvent {
        name: String,
        delay: f32,
        args: Vec<Value>,
    },
    NodeInstantiated { spawn: NodeSpawn },
    NodeOwnerChanged {
        node_path: String,
        owner: Option<ClientId>,
    },

    /// Out-of-band capacity violation.
    CriticalError { error: CriticalError },

    /// Completion of the `Request` with the same ID.
    Response {
        id: RequestId,
        response: ApiResponse,
    },
}

/// One variant per async account/document/leaderboard operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ApiRequest {
    CreateAccount {
        email: String,
        username: String,
        password: String,
    },
    DeleteAccount {
        email: String,
        password: String,
    },
    VerifyAccount {
        email: String,
        code: String,
        /// Seconds the verification code stays valid.
        valid_time: f64,
    },
    ResendVerification {
        email: String,
        password: String,
    },
    /// Empty username = the logged-in account.
    IsVerified { username: String },
    Login {
        email: String,
        password: String,
        /// Seconds the issued session token stays valid.
        valid_time: f64,
    },
    LoginFromSession {
        session_token: String,
        valid_time: f64,
    },
    Logout,
    ChangeUsername { new_username: String },
    ChangePassword {
        email: String,
        password: String,
        new_password: String,
    },
    RequestPasswordReset { email: String },
    ResetPassword {
        email: String,
        reset_code: String,
        new_password: String,
    },
    ReportAccount {
        username: String,
        report: String,
    },

    SetDocument {
        path: String,
        document: Value,
        externally_visible: bool,
    },
    SetExternallyVisible {
        path: String,
        externally_visible: bool,
    },
    GetDocument { path: String },
    HasDocument { path: String },
    BrowseCollection { path: String },
    DeleteDocument { path: String },
    GetExternalDocument {
        username: String,
        path: String,
    },
    HasExternalDocument {
        username: String,
        path: String,
    },
    BrowseExternalCollection {
        username: String,
        path: String,
    },

    HasLeaderboard { leaderboard: String },
    GetLeaderboards,
    BrowseLeaderboard {
        leaderboard: String,
        page_size: u32,
        page: u32,
    },
    GetLeaderboardScore {
        leaderboard: String,
        username: String,
    },
    SubmitScore {
        leaderboard: String,
        score: i64,
    },
    DeleteScore { leaderboard: String },
}

/// Typed completion for each `ApiRequest` variant: the family's response
/// code plus any payload. External document reads reuse the document
/// response variants — the code families are identical.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ApiResponse {
    CreateAccount(CreateAccountCode),
    DeleteAccount(DeleteAccountCode),
    VerifyAccount(VerifyAccountCode),
    ResendVerification(ResendVerificationCode),
    IsVerified {
        code: IsVerifiedCode,
        verified: bool,
    },
    Login {
        code: LoginCode,
        session_token: Option<String>,
        username: Option<String>,
    },
    Logout(LogoutCode),
    ChangeUsername(ChangeUsernameCode),
    ChangePassword(ChangePasswordCode),
    RequestPasswordReset(RequestPasswordResetCode),
    ResetPassword(ResetPasswordCode),
    ReportAccount(ReportUserCode),

    SetDocument(SetDocumentCode),
    SetExternallyVisible(SetExternalVisibleCode),
    GetDocument {
        code: GetDocumentCode,
        document: Option<Value>,
    },
    HasDocument {
        code: HasDocumentCode,
        exists: bool,
    },
    BrowseCollection {
        code: BrowseCollectionCode,
        entries: Vec<String>,
    },
    DeleteDocument(DeleteDocumentCode),

    HasLeaderboard {
        code: HasLeaderboardCode,
        exists: bool,
    },
    GetLeaderboards {
        code: GetLeaderboardsCode,
        leaderboards: Vec<String>,
    },
    BrowseLeaderboard {
        code: BrowseLeaderboardCode,
        entries: Vec<LeaderboardEntry>,
    },
    GetLeaderboardScore {
        code: GetLeaderboardScoreCode,
        score: Option<i64>,
    },
    SubmitScore(SubmitScoreCode),
    DeleteScore(DeleteScoreCode),
}
