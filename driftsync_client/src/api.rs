// The typed game-facing client.
//
// `SyncClient` owns the connection and mirrors the replicated state the
// server pushes: lobby metadata, the player roster, node ownership, and the
// current host. Games drive it from their frame loop:
//
// - Fire-and-forget calls (`sync_var`, `create_lobby`, `set_player_data`,
//   ...) serialize straight onto the TCP stream and return immediately.
// - `poll()` drains everything the server pushed since the last call,
//   updates the mirrors, and returns `SyncEvent`s for the game to match on.
// - Account/document/leaderboard calls (`login`, `get_player_document`,
//   `submit_score`, ...) block until the matching response arrives, process
//   unrelated messages encountered while waiting, and answer
//   `NoResponseFromServer` if the connection dies instead.
//
// Inbound `VarSet`/`FunctionCalled` traffic passes through the
// `SecurityRegistry` before the game sees it; filtered messages are dropped
// with a log line.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::TryRecvError;
use std::time::{Duration, Instant};

use serde_json::Value;

use driftsync_protocol::message::{
    ApiRequest, ApiResponse, ClientMessage, LeaderboardEntry, NodeSpawn, ServerMessage,
};
use driftsync_protocol::response::{
    BrowseCollectionCode, BrowseLeaderboardCode, ChangePasswordCode, ChangeUsernameCode,
    CreateAccountCode, DeleteAccountCode, DeleteDocumentCode, DeleteScoreCode, GetDocumentCode,
    GetLeaderboardScoreCode, GetLeaderboardsCode, HasDocumentCode, HasLeaderboardCode,
    IsVerifiedCode, LoginCode, LogoutCode, ReportUserCode, RequestPasswordResetCode,
    ResendVerificationCode, ResetPasswordCode, SetDocumentCode, SetExternalVisibleCode,
    SubmitScoreCode, VerifyAccountCode,
};
use driftsync_protocol::types::{ClientId, PacketChannel, RequestId};

use crate::connection::{self, Connection, ConnectionStatus, Handshake};
use crate::error::ClientError;
use crate::events::{DelayQueue, SyncEvent};
use crate::security::SecurityRegistry;

/// How long a blocking api call waits before giving up with
/// `NoResponseFromServer`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Optional settings for `create_lobby`. The defaults make a public,
/// unlimited, unprotected lobby.
#[derive(Clone, Debug, Default)]
pub struct CreateLobbyOptions {
    /// Empty = no password.
    pub password: String,
    pub hidden: bool,
    /// 0 = unlimited.
    pub player_limit: u32,
    pub tags: BTreeMap<String, Value>,
    pub data: BTreeMap<String, Value>,
}

/// Optional settings for `multiplayer_instantiate`.
#[derive(Clone, Debug)]
pub struct InstantiateOptions {
    pub sync_starting_changes: bool,
    pub excluded_properties: Vec<String>,
    /// Replay this spawn to clients that join later.
    pub replicate_on_join: bool,
    /// Property values diverging from the scene defaults at spawn time.
    pub changed_properties: BTreeMap<String, Value>,
}

impl Default for InstantiateOptions {
    fn default() -> Self {
        Self {
            sync_starting_changes: true,
            excluded_properties: Vec::new(),
            replicate_on_join: true,
            changed_properties: BTreeMap::new(),
        }
    }
}

/// Locally mirrored lobby metadata.
struct LobbyMirror {
    name: String,
    player_limit: u32,
    tags: BTreeMap<String, Value>,
    data: BTreeMap<String, Value>,
}

struct PlayerMirror {
    username: String,
    data: BTreeMap<String, Value>,
}

/// A connection to the sync server plus the local mirrors of replicated
/// state.
pub struct SyncClient {
    /// None when the handshake was refused or the connection is gone.
    conn: Option<Connection>,
    status: ConnectionStatus,
    active: bool,
    username: String,

    client_id: ClientId,
    sender_id: ClientId,
    next_request_id: u32,
    next_spawn_id: u64,

    session_token: Option<String>,
    account_username: Option<String>,

    security: SecurityRegistry,
    lobby: Option<LobbyMirror>,
    players: BTreeMap<ClientId, PlayerMirror>,
    owners: BTreeMap<String, ClientId>,
    host: ClientId,

    pending: VecDeque<SyncEvent>,
    delayed: DelayQueue,
}

impl SyncClient {
    /// Connect to a sync server and perform the handshake. On success the
    /// first `poll()` yields `Connected` and `ClientIdChanged`; when the
    /// server refuses the handshake it yields `ConnectionFailed` with the
    /// server's reason instead. `Err` is reserved for transport failures.
    pub fn connect(addr: &str, api_key: &str, username: &str) -> Result<Self, ClientError> {
        let mut status = ConnectionStatus::Disabled;
        let conn = match connection::establish(addr, api_key, username, &mut status)? {
            Handshake::Accepted(conn) => conn,
            Handshake::Refused(error) => {
                let mut client = Self::new(None, ConnectionStatus::Disabled, username);
                client
                    .pending
                    .push_back(SyncEvent::ConnectionFailed(error));
                return Ok(client);
            }
        };
        let client_id = conn.client_id;
        let mut client = Self::new(Some(conn), status, username);
        client.client_id = client_id;
        client.players.insert(
            client_id,
            PlayerMirror {
                username: username.to_string(),
                data: BTreeMap::new(),
            },
        );
        client.pending.push_back(SyncEvent::Connected);
        client.pending.push_back(SyncEvent::ClientIdChanged(client_id));
        Ok(client)
    }

    fn new(conn: Option<Connection>, status: ConnectionStatus, username: &str) -> Self {
        Self {
            active: conn.is_some(),
            conn,
            status,
            username: username.to_string(),
            client_id: ClientId::NONE,
            sender_id: ClientId::NONE,
            next_request_id: 1,
            next_spawn_id: 1,
            session_token: None,
            account_username: None,
            security: SecurityRegistry::new(),
            lobby: None,
            players: BTreeMap::new(),
            owners: BTreeMap::new(),
            host: ClientId::NONE,
            pending: VecDeque::new(),
            delayed: DelayQueue::new(),
        }
    }

    /// Send Goodbye and stop. The final `poll()` yields `Disconnected`.
    pub fn disconnect(&mut self) {
        if !self.active {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            let _ = connection::send(&mut conn.writer, &ClientMessage::Goodbye);
        }
        self.active = false;
        self.status = ConnectionStatus::Disabled;
        self.clear_lobby_mirrors();
        self.pending.push_back(SyncEvent::Disconnected);
    }

    // ---- state queries ----

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The peer whose var/function message was delivered most recently.
    /// `ClientId::NONE` before any replicated traffic arrives and again
    /// after leaving a lobby or disconnecting.
    pub fn sender_id(&self) -> ClientId {
        self.sender_id
    }

    pub fn is_host(&self) -> bool {
        self.lobby.is_some() && self.host == self.client_id
    }

    /// Host of the current lobby, or `ClientId::NONE` when not in one.
    pub fn host(&self) -> ClientId {
        if self.lobby.is_some() {
            self.host
        } else {
            ClientId::NONE
        }
    }

    pub fn all_clients(&self) -> Vec<ClientId> {
        self.players.keys().copied().collect()
    }

    pub fn username_of(&self, client: ClientId) -> Option<&str> {
        self.players.get(&client).map(|p| p.username.as_str())
    }

    /// The in-game display name, as last set (distinct from the account
    /// username).
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn lobby_name(&self) -> Option<&str> {
        self.lobby.as_ref().map(|l| l.name.as_str())
    }

    pub fn lobby_player_count(&self) -> u32 {
        if self.lobby.is_some() {
            self.players.len() as u32
        } else {
            0
        }
    }

    pub fn lobby_player_limit(&self) -> u32 {
        self.lobby.as_ref().map_or(0, |l| l.player_limit)
    }

    pub fn get_lobby_tag(&self, key: &str) -> Option<&Value> {
        self.lobby.as_ref().and_then(|l| l.tags.get(key))
    }

    pub fn all_lobby_tags(&self) -> BTreeMap<String, Value> {
        self.lobby.as_ref().map(|l| l.tags.clone()).unwrap_or_default()
    }

    pub fn get_lobby_data(&self, key: &str) -> Option<&Value> {
        self.lobby.as_ref().and_then(|l| l.data.get(key))
    }

    pub fn all_lobby_data(&self) -> BTreeMap<String, Value> {
        self.lobby.as_ref().map(|l| l.data.clone()).unwrap_or_default()
    }

    pub fn get_player_data(&self, client: ClientId, key: &str) -> Option<&Value> {
        self.players.get(&client).and_then(|p| p.data.get(key))
    }

    pub fn get_all_player_data(&self, client: ClientId) -> BTreeMap<String, Value> {
        self.players
            .get(&client)
            .map(|p| p.data.clone())
            .unwrap_or_default()
    }

    pub fn node_owner(&self, node_path: &str) -> Option<ClientId> {
        self.owners.get(node_path).copied()
    }

    /// True when this client owns the node (gatekeeper pattern: only the
    /// owner runs authoritative logic for it).
    pub fn is_node_owner(&self, node_path: &str) -> bool {
        self.node_owner(node_path) == Some(self.client_id)
    }

    /// Session token from the last successful login, for resuming with
    /// `login_from_session` in a later run.
    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn set_session_token(&mut self, token: String) {
        self.session_token = Some(token);
    }

    /// Username of the logged-in account, if any.
    pub fn account_username(&self) -> Option<&str> {
        self.account_username.as_deref()
    }

    // ---- security registry ----

    pub fn set_protection_mode(&mut self, enabled: bool) {
        self.security.set_protection_mode(enabled);
    }

    pub fn expose_node(&mut self, node_path: &str) {
        self.security.expose_node(node_path);
    }

    pub fn hide_node(&mut self, node_path: &str) {
        self.security.hide_node(node_path);
    }

    pub fn expose_var(&mut self, node_path: &str, variable: &str) {
        self.security.expose_var(node_path, variable);
    }

    pub fn hide_var(&mut self, node_path: &str, variable: &str) {
        self.security.hide_var(node_path, variable);
    }

    pub fn expose_function(&mut self, node_path: &str, function: &str) {
        self.security.expose_function(node_path, function);
    }

    pub fn hide_function(&mut self, node_path: &str, function: &str) {
        self.security.hide_function(node_path, function);
    }

    // ---- replication ----

    /// Replicate a variable write to every other lobby member.
    pub fn sync_var(
        &mut self,
        node_path: &str,
        variable: &str,
        value: Value,
        reliable: bool,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetVar {
            target: None,
            node_path: node_path.into(),
            variable: variable.into(),
            value,
            channel: PacketChannel::replication(reliable),
        })
    }

    /// Replicate a variable write to one lobby member.
    pub fn sync_var_on(
        &mut self,
        client: ClientId,
        node_path: &str,
        variable: &str,
        value: Value,
        reliable: bool,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetVar {
            target: Some(client),
            node_path: node_path.into(),
            variable: variable.into(),
            value,
            channel: PacketChannel::replication(reliable),
        })
    }

    /// Replicate a function call to every other lobby member.
    pub fn call_func(
        &mut self,
        node_path: &str,
        function: &str,
        args: Vec<Value>,
        reliable: bool,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::CallFunction {
            target: None,
            node_path: node_path.into(),
            function: function.into(),
            args,
            channel: PacketChannel::replication(reliable),
        })
    }

    /// Replicate a function call to one lobby member.
    pub fn call_func_on(
        &mut self,
        client: ClientId,
        node_path: &str,
        function: &str,
        args: Vec<Value>,
        reliable: bool,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::CallFunction {
            target: Some(client),
            node_path: node_path.into(),
            function: function.into(),
            args,
            channel: PacketChannel::replication(reliable),
        })
    }

    /// Schedule an event on every lobby member (including this client)
    /// `delay` seconds after delivery, so all peers fire together.
    pub fn create_synced_event(
        &mut self,
        name: &str,
        delay: f32,
        args: Vec<Value>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::CreateSyncedEvent {
            name: name.into(),
            delay,
            args,
        })
    }

    /// Announce a networked node spawn to the lobby. Returns the generated
    /// node path, unique across clients (`parent/scene@client:counter`).
    pub fn multiplayer_instantiate(
        &mut self,
        scene: &str,
        parent_path: &str,
        options: InstantiateOptions,
    ) -> Result<String, ClientError> {
        let stem = scene
            .rsplit('/')
            .next()
            .unwrap_or(scene)
            .split('.')
            .next()
            .unwrap_or(scene);
        let node_path = format!(
            "{parent_path}/{stem}@{}:{}",
            self.client_id.0, self.next_spawn_id
        );
        self.next_spawn_id += 1;
        let spawn = NodeSpawn {
            instantiator: self.client_id,
            scene: scene.into(),
            parent_path: parent_path.into(),
            node_path: node_path.clone(),
            sync_starting_changes: options.sync_starting_changes,
            excluded_properties: options.excluded_properties,
            changed_properties: options.changed_properties,
        };
        self.send(&ClientMessage::InstantiateNode {
            spawn,
            replicate_on_join: options.replicate_on_join,
        })?;
        Ok(node_path)
    }

    /// Claim ownership of a node for a client. The change is echoed back by
    /// the server, so the local registry updates on the next `poll()`.
    pub fn set_node_owner(&mut self, node_path: &str, owner: ClientId) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetNodeOwner {
            node_path: node_path.into(),
            owner: Some(owner),
        })
    }

    pub fn clear_node_owner(&mut self, node_path: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetNodeOwner {
            node_path: node_path.into(),
            owner: None,
        })
    }

    // ---- lobbies ----

    pub fn get_public_lobbies(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::GetPublicLobbies)
    }

    pub fn create_lobby(
        &mut self,
        name: &str,
        options: CreateLobbyOptions,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::CreateLobby {
            name: name.into(),
            password: options.password,
            public: !options.hidden,
            player_limit: options.player_limit,
            tags: options.tags,
            data: options.data,
        })
    }

    pub fn join_lobby(&mut self, name: &str, password: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::JoinLobby {
            name: name.into(),
            password: password.into(),
        })
    }

    pub fn leave_lobby(&mut self) -> Result<(), ClientError> {
        self.clear_lobby_mirrors();
        self.send(&ClientMessage::LeaveLobby)
    }

    pub fn open_lobby(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::OpenLobby)
    }

    pub fn close_lobby(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::CloseLobby)
    }

    pub fn set_lobby_visibility(&mut self, public: bool) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetLobbyVisibility { public })
    }

    pub fn set_lobby_player_limit(&mut self, limit: u32) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetLobbyPlayerLimit { limit })
    }

    /// Empty string clears the password.
    pub fn set_lobby_password(&mut self, password: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetLobbyPassword {
            password: password.into(),
        })
    }

    pub fn set_lobby_tag(&mut self, key: &str, value: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetLobbyTag {
            key: key.into(),
            value,
        })
    }

    pub fn erase_lobby_tag(&mut self, key: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::EraseLobbyTag { key: key.into() })
    }

    pub fn set_lobby_data(&mut self, key: &str, value: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetLobbyData {
            key: key.into(),
            value,
        })
    }

    pub fn erase_lobby_data(&mut self, key: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::EraseLobbyData { key: key.into() })
    }

    // ---- player data ----

    pub fn set_player_data(&mut self, key: &str, value: Value) -> Result<(), ClientError> {
        self.send(&ClientMessage::SetPlayerData {
            key: key.into(),
            value,
        })
    }

    pub fn erase_player_data(&mut self, key: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::ErasePlayerData { key: key.into() })
    }

    pub fn set_username(&mut self, username: &str) -> Result<(), ClientError> {
        self.username = username.to_string();
        if let Some(me) = self.players.get_mut(&self.client_id) {
            me.username = username.to_string();
        }
        self.send(&ClientMessage::SetUsername {
            username: username.into(),
        })
    }

    // ---- accounts ----

    pub fn create_account(
        &mut self,
        email: &str,
        username: &str,
        password: &str,
    ) -> CreateAccountCode {
        match self.request(ApiRequest::CreateAccount {
            email: email.into(),
            username: username.into(),
            password: password.into(),
        }) {
            Some(ApiResponse::CreateAccount(code)) => code,
            _ => CreateAccountCode::NoResponseFromServer,
        }
    }

    pub fn delete_account(&mut self, email: &str, password: &str) -> DeleteAccountCode {
        match self.request(ApiRequest::DeleteAccount {
            email: email.into(),
            password: password.into(),
        }) {
            Some(ApiResponse::DeleteAccount(code)) => {
                if code == DeleteAccountCode::Success {
                    self.session_token = None;
                    self.account_username = None;
                }
                code
            }
            _ => DeleteAccountCode::NoResponseFromServer,
        }
    }

    pub fn verify_account(&mut self, email: &str, code: &str, valid_time: f64) -> VerifyAccountCode {
        match self.request(ApiRequest::VerifyAccount {
            email: email.into(),
            code: code.into(),
            valid_time,
        }) {
            Some(ApiResponse::VerifyAccount(code)) => code,
            _ => VerifyAccountCode::NoResponseFromServer,
        }
    }

    pub fn resend_verification(&mut self, email: &str, password: &str) -> ResendVerificationCode {
        match self.request(ApiRequest::ResendVerification {
            email: email.into(),
            password: password.into(),
        }) {
            Some(ApiResponse::ResendVerification(code)) => code,
            _ => ResendVerificationCode::NoResponseFromServer,
        }
    }

    /// Empty `username` asks about the logged-in account itself.
    pub fn is_verified(&mut self, username: &str) -> (IsVerifiedCode, bool) {
        match self.request(ApiRequest::IsVerified {
            username: username.into(),
        }) {
            Some(ApiResponse::IsVerified { code, verified }) => (code, verified),
            _ => (IsVerifiedCode::NoResponseFromServer, false),
        }
    }

    /// On success the session token is kept for `login_from_session`.
    pub fn login(&mut self, email: &str, password: &str, valid_time: f64) -> LoginCode {
        let response = self.request(ApiRequest::Login {
            email: email.into(),
            password: password.into(),
            valid_time,
        });
        self.finish_login(response)
    }

    /// Resume the stored session without credentials.
    pub fn login_from_session(&mut self, valid_time: f64) -> LoginCode {
        let Some(token) = self.session_token.clone() else {
            return LoginCode::ExpiredSession;
        };
        let response = self.request(ApiRequest::LoginFromSession {
            session_token: token,
            valid_time,
        });
        self.finish_login(response)
    }

    fn finish_login(&mut self, response: Option<ApiResponse>) -> LoginCode {
        match response {
            Some(ApiResponse::Login {
                code,
                session_token,
                username,
            }) => {
                if code == LoginCode::Success {
                    self.session_token = session_token;
                    self.account_username = username;
                }
                code
            }
            _ => LoginCode::NoResponseFromServer,
        }
    }

    pub fn logout(&mut self) -> LogoutCode {
        match self.request(ApiRequest::Logout) {
            Some(ApiResponse::Logout(code)) => {
                if code == LogoutCode::Success {
                    self.session_token = None;
                    self.account_username = None;
                }
                code
            }
            _ => LogoutCode::NoResponseFromServer,
        }
    }

    pub fn change_account_username(&mut self, new_username: &str) -> ChangeUsernameCode {
        match self.request(ApiRequest::ChangeUsername {
            new_username: new_username.into(),
        }) {
            Some(ApiResponse::ChangeUsername(code)) => {
                if code == ChangeUsernameCode::Success {
                    self.account_username = Some(new_username.to_string());
                }
                code
            }
            _ => ChangeUsernameCode::NoResponseFromServer,
        }
    }

    pub fn change_account_password(
        &mut self,
        email: &str,
        password: &str,
        new_password: &str,
    ) -> ChangePasswordCode {
        match self.request(ApiRequest::ChangePassword {
            email: email.into(),
            password: password.into(),
            new_password: new_password.into(),
        }) {
            Some(ApiResponse::ChangePassword(code)) => code,
            _ => ChangePasswordCode::NoResponseFromServer,
        }
    }

    pub fn request_password_reset(&mut self, email: &str) -> RequestPasswordResetCode {
        match self.request(ApiRequest::RequestPasswordReset {
            email: email.into(),
        }) {
            Some(ApiResponse::RequestPasswordReset(code)) => code,
            _ => RequestPasswordResetCode::NoResponseFromServer,
        }
    }

    pub fn reset_password(
        &mut self,
        email: &str,
        reset_code: &str,
        new_password: &str,
    ) -> ResetPasswordCode {
        match self.request(ApiRequest::ResetPassword {
            email: email.into(),
            reset_code: reset_code.into(),
            new_password: new_password.into(),
        }) {
            Some(ApiResponse::ResetPassword(code)) => code,
            _ => ResetPasswordCode::NoResponseFromServer,
        }
    }

    pub fn report_account(&mut self, username: &str, report: &str) -> ReportUserCode {
        match self.request(ApiRequest::ReportAccount {
            username: username.into(),
            report: report.into(),
        }) {
            Some(ApiResponse::ReportAccount(code)) => code,
            _ => ReportUserCode::NoResponseFromServer,
        }
    }

    // ---- player documents ----

    pub fn set_player_document(
        &mut self,
        path: &str,
        document: Value,
        externally_visible: bool,
    ) -> SetDocumentCode {
        match self.request(ApiRequest::SetDocument {
            path: path.into(),
            document,
            externally_visible,
        }) {
            Some(ApiResponse::SetDocument(code)) => code,
            _ => SetDocumentCode::NoResponseFromServer,
        }
    }

    pub fn set_externally_visible(
        &mut self,
        path: &str,
        externally_visible: bool,
    ) -> SetExternalVisibleCode {
        match self.request(ApiRequest::SetExternallyVisible {
            path: path.into(),
            externally_visible,
        }) {
            Some(ApiResponse::SetExternallyVisible(code)) => code,
            _ => SetExternalVisibleCode::NoResponseFromServer,
        }
    }

    pub fn get_player_document(&mut self, path: &str) -> (GetDocumentCode, Option<Value>) {
        match self.request(ApiRequest::GetDocument { path: path.into() }) {
            Some(ApiResponse::GetDocument { code, document }) => (code, document),
            _ => (GetDocumentCode::NoResponseFromServer, None),
        }
    }

    pub fn has_player_document(&mut self, path: &str) -> (HasDocumentCode, bool) {
        match self.request(ApiRequest::HasDocument { path: path.into() }) {
            Some(ApiResponse::HasDocument { code, exists }) => (code, exists),
            _ => (HasDocumentCode::NoResponseFromServer, false),
        }
    }

    /// Immediate children of a collection: document names and
    /// sub-collection names suffixed with `/`.
    pub fn browse_player_collection(&mut self, path: &str) -> (BrowseCollectionCode, Vec<String>) {
        match self.request(ApiRequest::BrowseCollection { path: path.into() }) {
            Some(ApiResponse::BrowseCollection { code, entries }) => (code, entries),
            _ => (BrowseCollectionCode::NoResponseFromServer, Vec::new()),
        }
    }

    pub fn delete_player_document(&mut self, path: &str) -> DeleteDocumentCode {
        match self.request(ApiRequest::DeleteDocument { path: path.into() }) {
            Some(ApiResponse::DeleteDocument(code)) => code,
            _ => DeleteDocumentCode::NoResponseFromServer,
        }
    }

    /// Read another player's externally visible document.
    pub fn get_external_player_document(
        &mut self,
        username: &str,
        path: &str,
    ) -> (GetDocumentCode, Option<Value>) {
        match self.request(ApiRequest::GetExternalDocument {
            username: username.into(),
            path: path.into(),
        }) {
            Some(ApiResponse::GetDocument { code, document }) => (code, document),
            _ => (GetDocumentCode::NoResponseFromServer, None),
        }
    }

    pub fn has_external_player_document(
        &mut self,
        username: &str,
        path: &str,
    ) -> (HasDocumentCode, bool) {
        match self.request(ApiRequest::HasExternalDocument {
            username: username.into(),
            path: path.into(),
        }) {
            Some(ApiResponse::HasDocument { code, exists }) => (code, exists),
            _ => (HasDocumentCode::NoResponseFromServer, false),
        }
    }

    pub fn browse_external_player_collection(
        &mut self,
        username: &str,
        path: &str,
    ) -> (BrowseCollectionCode, Vec<String>) {
        match self.request(ApiRequest::BrowseExternalCollection {
            username: username.into(),
            path: path.into(),
        }) {
            Some(ApiResponse::BrowseCollection { code, entries }) => (code, entries),
            _ => (BrowseCollectionCode::NoResponseFromServer, Vec::new()),
        }
    }

    // ---- leaderboards ----

    pub fn has_leaderboard(&mut self, leaderboard: &str) -> (HasLeaderboardCode, bool) {
        match self.request(ApiRequest::HasLeaderboard {
            leaderboard: leaderboard.into(),
        }) {
            Some(ApiResponse::HasLeaderboard { code, exists }) => (code, exists),
            _ => (HasLeaderboardCode::NoResponseFromServer, false),
        }
    }

    pub fn get_leaderboards(&mut self) -> (GetLeaderboardsCode, Vec<String>) {
        match self.request(ApiRequest::GetLeaderboards) {
            Some(ApiResponse::GetLeaderboards { code, leaderboards }) => (code, leaderboards),
            _ => (GetLeaderboardsCode::NoResponseFromServer, Vec::new()),
        }
    }

    /// One page of a leaderboard, best scores first. A `page_size` of 0
    /// fetches the whole board.
    pub fn browse_leaderboard(
        &mut self,
        leaderboard: &str,
        page_size: u32,
        page: u32,
    ) -> (BrowseLeaderboardCode, Vec<LeaderboardEntry>) {
        match self.request(ApiRequest::BrowseLeaderboard {
            leaderboard: leaderboard.into(),
            page_size,
            page,
        }) {
            Some(ApiResponse::BrowseLeaderboard { code, entries }) => (code, entries),
            _ => (BrowseLeaderboardCode::NoResponseFromServer, Vec::new()),
        }
    }

    pub fn get_leaderboard_score(
        &mut self,
        leaderboard: &str,
        username: &str,
    ) -> (GetLeaderboardScoreCode, Option<i64>) {
        match self.request(ApiRequest::GetLeaderboardScore {
            leaderboard: leaderboard.into(),
            username: username.into(),
        }) {
            Some(ApiResponse::GetLeaderboardScore { code, score }) => (code, score),
            _ => (GetLeaderboardScoreCode::NoResponseFromServer, None),
        }
    }

    /// Overwrites the logged-in account's score on the board.
    pub fn submit_score(&mut self, leaderboard: &str, score: i64) -> SubmitScoreCode {
        match self.request(ApiRequest::SubmitScore {
            leaderboard: leaderboard.into(),
            score,
        }) {
            Some(ApiResponse::SubmitScore(code)) => code,
            _ => SubmitScoreCode::NoResponseFromServer,
        }
    }

    pub fn delete_score(&mut self, leaderboard: &str) -> DeleteScoreCode {
        match self.request(ApiRequest::DeleteScore {
            leaderboard: leaderboard.into(),
        }) {
            Some(ApiResponse::DeleteScore(code)) => code,
            _ => DeleteScoreCode::NoResponseFromServer,
        }
    }

    // ---- event pump ----

    /// Drain everything the server pushed since the last call, update the
    /// local mirrors, and return the resulting events in order. Call once
    /// per frame.
    pub fn poll(&mut self) -> Vec<SyncEvent> {
        self.pump();
        if !self.delayed.is_empty() {
            for (name, args) in self.delayed.drain_due(Instant::now()) {
                self.pending
                    .push_back(SyncEvent::SyncedEventTriggered { name, args });
            }
        }
        self.pending.drain(..).collect()
    }

    fn pump(&mut self) {
        loop {
            let received = match self.conn.as_ref() {
                Some(conn) => conn.inbox.try_recv(),
                None => break,
            };
            match received {
                Ok(msg) => self.process(msg),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.active {
                        log::warn!("connection to sync server lost");
                        self.active = false;
                        self.status = ConnectionStatus::Disabled;
                        self.clear_lobby_mirrors();
                        self.pending.push_back(SyncEvent::Disconnected);
                    }
                    break;
                }
            }
        }
    }

    /// Send the request and block until its response arrives, processing
    /// unrelated pushes in the meantime. None = connection died or timed
    /// out; callers map that to the family's `NoResponseFromServer`.
    fn request(&mut self, request: ApiRequest) -> Option<ApiResponse> {
        let id = RequestId(self.next_request_id);
        self.next_request_id = self.next_request_id.wrapping_add(1);
        if let Err(e) = self.send(&ClientMessage::Request { id, request }) {
            log::warn!("api request failed to send: {e}");
            return None;
        }
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("api request {} timed out", id.0);
                return None;
            }
            let received = match self.conn.as_ref() {
                Some(conn) => conn.inbox.recv_timeout(remaining),
                None => return None,
            };
            match received {
                Ok(ServerMessage::Response { id: rid, response }) if rid == id => {
                    return Some(response);
                }
                Ok(ServerMessage::Response { id: rid, .. }) => {
                    log::warn!("dropping stale response {}", rid.0);
                }
                Ok(other) => self.process(other),
                Err(_) => {
                    return None;
                }
            }
        }
    }

    fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        if !self.active {
            return Err(ClientError::NotConnected);
        }
        match self.conn.as_mut() {
            Some(conn) => connection::send(&mut conn.writer, msg),
            None => Err(ClientError::NotConnected),
        }
    }

    fn clear_lobby_mirrors(&mut self) {
        self.lobby = None;
        self.owners.clear();
        self.host = ClientId::NONE;
        self.sender_id = ClientId::NONE;
        let me = self.client_id;
        self.players.retain(|id, _| *id == me);
    }

    /// Apply one server push to the mirrors and queue its event.
    fn process(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::HostChanged { host } => {
                self.host = host;
                self.pending.push_back(SyncEvent::HostChanged {
                    is_host: host == self.client_id,
                    host,
                });
            }
            ServerMessage::LobbyCreated { name } => {
                self.pending.push_back(SyncEvent::LobbyCreated(name));
            }
            ServerMessage::LobbyCreationFailed { name, error } => {
                self.pending
                    .push_back(SyncEvent::LobbyCreationFailed { name, error });
            }
            ServerMessage::LobbyJoined {
                name,
                host,
                player_limit,
                players,
                tags,
                data,
            } => {
                self.host = host;
                self.players = players
                    .into_iter()
                    .map(|p| {
                        (
                            p.id,
                            PlayerMirror {
                                username: p.username,
                                data: p.data,
                            },
                        )
                    })
                    .collect();
                self.lobby = Some(LobbyMirror {
                    name: name.clone(),
                    player_limit,
                    tags,
                    data,
                });
                self.pending.push_back(SyncEvent::LobbyJoined(name));
            }
            ServerMessage::LobbyJoinFailed { name, error } => {
                self.pending
                    .push_back(SyncEvent::LobbyJoinFailed { name, error });
            }
            ServerMessage::LobbiesReceived { lobbies } => {
                self.pending.push_back(SyncEvent::LobbiesReceived(lobbies));
            }
            ServerMessage::LobbyDataChanged { key, value } => {
                if let Some(lobby) = &mut self.lobby {
                    match &value {
                        Some(v) => {
                            lobby.data.insert(key.clone(), v.clone());
                        }
                        None => {
                            lobby.data.remove(&key);
                        }
                    }
                }
                self.pending
                    .push_back(SyncEvent::LobbyDataChanged { key, value });
            }
            ServerMessage::LobbyTagChanged { key, value } => {
                if let Some(lobby) = &mut self.lobby {
                    match &value {
                        Some(v) => {
                            lobby.tags.insert(key.clone(), v.clone());
                        }
                        None => {
                            lobby.tags.remove(&key);
                        }
                    }
                }
                self.pending
                    .push_back(SyncEvent::LobbyTagChanged { key, value });
            }
            ServerMessage::ClientJoined { player } => {
                let id = player.id;
                self.players.insert(
                    id,
                    PlayerMirror {
                        username: player.username,
                        data: player.data,
                    },
                );
                self.pending.push_back(SyncEvent::ClientJoined(id));
            }
            ServerMessage::ClientLeft { client } => {
                self.players.remove(&client);
                self.pending.push_back(SyncEvent::ClientLeft(client));
            }
            ServerMessage::PlayerDataChanged { client, key, value } => {
                if let Some(player) = self.players.get_mut(&client) {
                    match &value {
                        Some(v) => {
                            player.data.insert(key.clone(), v.clone());
                        }
                        None => {
                            player.data.remove(&key);
                        }
                    }
                }
                self.pending
                    .push_back(SyncEvent::PlayerDataChanged { client, key, value });
            }
            ServerMessage::VarSet {
                from,
                node_path,
                variable,
                value,
            } => {
                if !self.security.allows_var(&node_path, &variable) {
                    log::warn!("blocked remote write to {node_path}:{variable}");
                    return;
                }
                self.sender_id = from;
                self.pending.push_back(SyncEvent::VarSet {
                    from,
                    node_path,
                    variable,
                    value,
                });
            }
            ServerMessage::FunctionCalled {
                from,
                node_path,
                function,
                args,
            } => {
                if !self.security.allows_function(&node_path, &function) {
                    log::warn!("blocked remote call to {node_path}:{function}");
                    return;
                }
                self.sender_id = from;
                self.pending.push_back(SyncEvent::FunctionCalled {
                    from,
                    node_path,
                    function,
                    args,
                });
            }
            ServerMessage::SyncedEvent { name, delay, args } => {
                self.delayed.push(name, args, delay);
            }
            ServerMessage::NodeInstantiated { spawn } => {
                self.pending.push_back(SyncEvent::NodeInstantiated(spawn));
            }
            ServerMessage::NodeOwnerChanged { node_path, owner } => {
                match owner {
                    Some(owner) => {
                        self.owners.insert(node_path.clone(), owner);
                    }
                    None => {
                        self.owners.remove(&node_path);
                    }
                }
                self.pending
                    .push_back(SyncEvent::OwnerChanged { node_path, owner });
            }
            ServerMessage::CriticalError { error } => {
                log::warn!("server reported critical error: {error:?}");
                self.pending.push_back(SyncEvent::CriticalError(error));
            }
            ServerMessage::Welcome { .. } | ServerMessage::Rejected { .. } => {
                // Handshake messages never arrive after setup.
                log::warn!("unexpected handshake message mid-session");
            }
            ServerMessage::Response { id, .. } => {
                // Responses are consumed inside `request()`.
                log::warn!("unsolicited response {}", id.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, BufWriter};
    use std::net::TcpListener;
    use std::thread;

    use driftsync_protocol::framing::{read_message, write_message};
    use driftsync_protocol::response::ConnectError;
    use serde_json::json;

    use super::*;

    #[test]
    fn refused_handshake_surfaces_a_connection_failed_event() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            read_message(&mut reader).unwrap();
            let rejected = ServerMessage::Rejected {
                error: ConnectError::InvalidKey,
            };
            let mut writer = BufWriter::new(stream);
            write_message(&mut writer, &serde_json::to_vec(&rejected).unwrap()).unwrap();
        });

        let mut client = SyncClient::connect(&addr.to_string(), "wrong-key", "Tester").unwrap();
        server.join().unwrap();

        assert!(!client.is_active());
        assert_eq!(client.client_id(), ClientId::NONE);

        let events = client.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SyncEvent::ConnectionFailed(ConnectError::InvalidKey)
        ));

        // Nothing may go out over a refused connection.
        assert!(matches!(
            client.sync_var("world/door", "open", json!(true), true),
            Err(ClientError::NotConnected)
        ));
    }
}
