// Central state owner for the sync server.
//
// `Hub` is the structure `server.rs` drives: connected clients, lobbies, the
// account service, and the leaderboard store. All mutation happens through
// methods called from the server's single-threaded main loop — no internal
// locking.
//
// Key responsibilities:
// - Client registry: assign IDs (starting at 1; 0 is reserved), track each
//   client's username, replicated data map, current lobby, and login session.
// - Lobby lifecycle: create/join/leave with validation, host migration to the
//   lowest remaining ID, destruction when the last member leaves.
// - Replication fan-out: variable writes, function calls, synced events,
//   node spawns, and ownership changes routed to the right lobby members.
// - Async api dispatch: `Request` envelopes answered with a `Response`
//   carrying the matching typed code, after the shared infrastructure gates
//   (database availability, rate limit, data cap).
//
// Writing to client streams: `Hub` holds cloned `TcpStream` write halves
// wrapped in `BufWriter`. Write errors on a single client are logged but do
// not crash the server — the reader thread for that client will detect the
// broken pipe and send a `Disconnected` event.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde_json::Value;

use driftsync_protocol::framing::write_message;
use driftsync_protocol::message::{
    ApiRequest, ApiResponse, ClientMessage, NodeSpawn, PlayerInfo, ServerMessage,
};
use driftsync_protocol::response::{
    BrowseCollectionCode, BrowseLeaderboardCode, ChangePasswordCode, ChangeUsernameCode,
    CreateAccountCode, CriticalError, DeleteAccountCode, DeleteDocumentCode, DeleteScoreCode,
    GetDocumentCode, GetLeaderboardScoreCode, GetLeaderboardsCode, HasDocumentCode,
    HasLeaderboardCode, IsVerifiedCode, LobbyCreateError, LobbyJoinError, LoginCode, LogoutCode,
    ReportUserCode, RequestPasswordResetCode, ResendVerificationCode, ResetPasswordCode,
    SetDocumentCode, SetExternalVisibleCode, SharedCode, SubmitScoreCode, VerifyAccountCode,
};
use driftsync_protocol::types::{ClientId, RequestId};

use crate::accounts::AccountService;
use crate::leaderboards::LeaderboardStore;
use crate::lobby::{self, Lobby, json_size};

/// Clients may only create a lobby this often.
const LOBBY_CREATE_COOLDOWN: Duration = Duration::from_secs(2);

/// Byte budgets for client-supplied state. All sizes are measured on the
/// serialized JSON form.
#[derive(Clone, Debug)]
pub struct Caps {
    pub lobby_tag_bytes: usize,
    pub lobby_data_bytes: usize,
    pub player_data_bytes: usize,
    /// Largest framed message a client may send.
    pub max_message_bytes: usize,
}

impl Default for Caps {
    fn default() -> Self {
        Self {
            lobby_tag_bytes: 2048,
            lobby_data_bytes: 4096,
            player_data_bytes: 2048,
            max_message_bytes: 64 * 1024,
        }
    }
}

struct ClientState {
    username: String,
    data: BTreeMap<String, Value>,
    lobby: Option<String>,
    writer: BufWriter<TcpStream>,
    /// (account email, session token) once logged in.
    session: Option<(String, String)>,
    last_request: Option<Instant>,
    last_lobby_create: Option<Instant>,
}

/// Central server state, driven by the main event loop.
pub struct Hub {
    clients: BTreeMap<ClientId, ClientState>,
    lobbies: BTreeMap<String, Lobby>,
    next_client_id: u32,
    pub accounts: AccountService,
    pub leaderboards: LeaderboardStore,
    caps: Caps,
    /// Minimum spacing between api requests per client. Zero disables
    /// rate limiting.
    min_request_interval: Duration,
    /// Cumulative inbound api request bytes allowed before requests are
    /// refused. None = unlimited.
    data_cap: Option<u64>,
    data_used: u64,
    /// False when the persisted snapshot failed to load; all api requests
    /// answer NoDatabase until an operator intervenes.
    db_ok: bool,
}

impl Hub {
    pub fn new(
        accounts: AccountService,
        leaderboards: LeaderboardStore,
        caps: Caps,
        min_request_interval: Duration,
        data_cap: Option<u64>,
        db_ok: bool,
    ) -> Self {
        Self {
            clients: BTreeMap::new(),
            lobbies: BTreeMap::new(),
            next_client_id: 1,
            accounts,
            leaderboards,
            caps,
            min_request_interval,
            data_cap,
            data_used: 0,
            db_ok,
        }
    }

    /// Register a connected client and send its Welcome. The returned
    /// `ClientId` tags the reader thread for this connection.
    pub fn add_client(&mut self, username: String, stream: TcpStream) -> ClientId {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        log::info!("client {} connected as {username:?}", id.0);
        self.clients.insert(
            id,
            ClientState {
                username,
                data: BTreeMap::new(),
                lobby: None,
                writer: BufWriter::new(stream),
                session: None,
                last_request: None,
                last_lobby_create: None,
            },
        );
        self.send_to(id, &ServerMessage::Welcome { client_id: id });
        id
    }

    /// Remove a client: leave its lobby (with the usual broadcasts) and
    /// drop its state.
    pub fn remove_client(&mut self, id: ClientId) {
        self.leave_lobby(id);
        if self.clients.remove(&id).is_some() {
            log::info!("client {} disconnected", id.0);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Dispatch a single message from a client. `wire_len` is the framed
    /// payload size, checked against the message byte cap.
    pub fn handle_message(&mut self, from: ClientId, message: ClientMessage, wire_len: usize) {
        if wire_len > self.caps.max_message_bytes {
            log::warn!("client {} sent oversized message ({wire_len} bytes)", from.0);
            self.send_to(
                from,
                &ServerMessage::CriticalError {
                    error: CriticalError::RequestTooLarge,
                },
            );
            return;
        }
        match message {
            ClientMessage::SetVar {
                target,
                node_path,
                variable,
                value,
                channel,
            } => {
                log::trace!("set_var {node_path}:{variable} on {channel:?}");
                let targets = self.relay_targets(from, target);
                self.send_many(
                    &targets,
                    &ServerMessage::VarSet {
                        from,
                        node_path,
                        variable,
                        value,
                    },
                );
            }
            ClientMessage::CallFunction {
                target,
                node_path,
                function,
                args,
                channel,
            } => {
                log::trace!("call_function {node_path}:{function} on {channel:?}");
                let targets = self.relay_targets(from, target);
                self.send_many(
                    &targets,
                    &ServerMessage::FunctionCalled {
                        from,
                        node_path,
                        function,
                        args,
                    },
                );
            }
            ClientMessage::CreateSyncedEvent { name, delay, args } => {
                // Synced events go to every member including the sender, so
                // all peers fire after the same delay.
                let members = self.own_lobby_members(from);
                self.send_many(&members, &ServerMessage::SyncedEvent { name, delay, args });
            }
            ClientMessage::InstantiateNode {
                spawn,
                replicate_on_join,
            } => self.instantiate_node(from, spawn, replicate_on_join),
            ClientMessage::SetNodeOwner { node_path, owner } => {
                self.set_node_owner(from, node_path, owner);
            }
            ClientMessage::GetPublicLobbies => {
                let lobbies = self
                    .lobbies
                    .values()
                    .filter(|l| l.public)
                    .map(Lobby::info)
                    .collect();
                self.send_to(from, &ServerMessage::LobbiesReceived { lobbies });
            }
            ClientMessage::CreateLobby {
                name,
                password,
                public,
                player_limit,
                tags,
                data,
            } => self.create_lobby(from, name, password, public, player_limit, tags, data),
            ClientMessage::JoinLobby { name, password } => self.join_lobby(from, name, password),
            ClientMessage::LeaveLobby => self.leave_lobby(from),
            ClientMessage::OpenLobby => {
                if let Some(lobby) = self.host_lobby_mut(from) {
                    lobby.open = true;
                }
            }
            ClientMessage::CloseLobby => {
                if let Some(lobby) = self.host_lobby_mut(from) {
                    lobby.open = false;
                }
            }
            ClientMessage::SetLobbyVisibility { public } => {
                if let Some(lobby) = self.host_lobby_mut(from) {
                    lobby.public = public;
                }
            }
            ClientMessage::SetLobbyPlayerLimit { limit } => {
                // Lowering the limit below the current member count only
                // affects future joins.
                if let Some(lobby) = self.host_lobby_mut(from) {
                    lobby.player_limit = limit;
                }
            }
            ClientMessage::SetLobbyPassword { password } => {
                if let Some(lobby) = self.host_lobby_mut(from) {
                    lobby.set_password(password);
                }
            }
            ClientMessage::SetLobbyTag { key, value } => {
                self.set_lobby_entry(from, key, Some(value), true);
            }
            ClientMessage::EraseLobbyTag { key } => {
                self.set_lobby_entry(from, key, None, true);
            }
            ClientMessage::SetLobbyData { key, value } => {
                self.set_lobby_entry(from, key, Some(value), false);
            }
            ClientMessage::EraseLobbyData { key } => {
                self.set_lobby_entry(from, key, None, false);
            }
            ClientMessage::SetPlayerData { key, value } => {
                self.set_player_data(from, key, Some(value));
            }
            ClientMessage::ErasePlayerData { key } => {
                self.set_player_data(from, key, None);
            }
            ClientMessage::SetUsername { username } => {
                if let Some(client) = self.clients.get_mut(&from) {
                    client.username = username;
                }
            }
            ClientMessage::Request { id, request } => {
                self.handle_request(from, id, request, wire_len);
            }
            ClientMessage::Hello { .. } | ClientMessage::Goodbye => {
                // Hello is handled during connection setup, Goodbye in the
                // reader loop.
            }
        }
    }

    // ---- lobby lifecycle ----

    #[expect(clippy::too_many_arguments)]
    fn create_lobby(
        &mut self,
        from: ClientId,
        name: String,
        password: String,
        public: bool,
        player_limit: u32,
        tags: BTreeMap<String, Value>,
        data: BTreeMap<String, Value>,
    ) {
        let on_cooldown = self
            .clients
            .get(&from)
            .and_then(|c| c.last_lobby_create)
            .is_some_and(|at| at.elapsed() < LOBBY_CREATE_COOLDOWN);
        let error = if self.lobbies.contains_key(&name) {
            Some(LobbyCreateError::AlreadyExists)
        } else if let Some(error) = lobby::create_error(
            &name,
            &password,
            &tags,
            &data,
            self.caps.lobby_tag_bytes,
            self.caps.lobby_data_bytes,
        ) {
            Some(error)
        } else if on_cooldown {
            Some(LobbyCreateError::OnCooldown)
        } else {
            None
        };
        if let Some(error) = error {
            self.send_to(from, &ServerMessage::LobbyCreationFailed { name, error });
            return;
        }

        self.leave_lobby(from);
        if let Some(client) = self.clients.get_mut(&from) {
            client.lobby = Some(name.clone());
            client.last_lobby_create = Some(Instant::now());
        }
        log::info!("client {} created lobby {name:?}", from.0);
        self.lobbies.insert(
            name.clone(),
            Lobby::new(name.clone(), password, public, player_limit, tags, data, from),
        );
        self.send_to(from, &ServerMessage::LobbyCreated { name: name.clone() });
        let joined = self.lobby_joined_message(&name);
        self.send_to(from, &joined);
    }

    fn join_lobby(&mut self, from: ClientId, name: String, password: String) {
        let username = self
            .clients
            .get(&from)
            .map(|c| c.username.clone())
            .unwrap_or_default();
        let error = match self.lobbies.get(&name) {
            None => Some(LobbyJoinError::DoesNotExist),
            Some(lobby) => {
                let member_names: Vec<String> = lobby
                    .members
                    .iter()
                    .filter_map(|id| self.clients.get(id))
                    .map(|c| c.username.clone())
                    .collect();
                lobby.join_error(&password, &username, &member_names)
            }
        };
        if let Some(error) = error {
            self.send_to(from, &ServerMessage::LobbyJoinFailed { name, error });
            return;
        }

        self.leave_lobby(from);
        let others;
        let spawns;
        match self.lobbies.get_mut(&name) {
            Some(lobby) => {
                others = lobby.members.clone();
                spawns = lobby.spawns.clone();
                lobby.members.push(from);
            }
            None => return,
        }
        if let Some(client) = self.clients.get_mut(&from) {
            client.lobby = Some(name.clone());
        }
        log::info!("client {} joined lobby {name:?}", from.0);
        if let Some(player) = self.player_info(from) {
            self.send_many(&others, &ServerMessage::ClientJoined { player });
        }
        let joined = self.lobby_joined_message(&name);
        self.send_to(from, &joined);
        // Replay replicate-on-join spawns so the late joiner converges.
        for spawn in spawns {
            self.send_to(from, &ServerMessage::NodeInstantiated { spawn });
        }
    }

    /// Remove a client from its lobby, clearing its node ownerships,
    /// migrating the host, and destroying the lobby if it empties.
    fn leave_lobby(&mut self, from: ClientId) {
        let Some(name) = self.clients.get_mut(&from).and_then(|c| c.lobby.take()) else {
            return;
        };
        let Some(lobby) = self.lobbies.get_mut(&name) else {
            return;
        };
        lobby.remove_member(from);
        let owned: Vec<String> = lobby
            .owners
            .iter()
            .filter(|(_, owner)| **owner == from)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            lobby.owners.remove(path);
        }
        if lobby.members.is_empty() {
            self.lobbies.remove(&name);
            log::info!("lobby {name:?} destroyed (last member left)");
            return;
        }
        let new_host = if lobby.host == from {
            lobby.members.iter().copied().min()
        } else {
            None
        };
        if let Some(host) = new_host {
            lobby.host = host;
        }
        let members = lobby.members.clone();
        for path in owned {
            self.send_many(
                &members,
                &ServerMessage::NodeOwnerChanged {
                    node_path: path,
                    owner: None,
                },
            );
        }
        self.send_many(&members, &ServerMessage::ClientLeft { client: from });
        if let Some(host) = new_host {
            log::info!("lobby {name:?} host migrated to client {}", host.0);
            self.send_many(&members, &ServerMessage::HostChanged { host });
        }
    }

    /// Full replicated lobby state for a (re)joining client.
    fn lobby_joined_message(&self, name: &str) -> ServerMessage {
        let Some(lobby) = self.lobbies.get(name) else {
            // Caller just inserted or validated the lobby.
            return ServerMessage::LobbyJoinFailed {
                name: name.to_string(),
                error: LobbyJoinError::DoesNotExist,
            };
        };
        let players = lobby
            .members
            .iter()
            .filter_map(|id| self.player_info(*id))
            .collect();
        ServerMessage::LobbyJoined {
            name: lobby.name.clone(),
            host: lobby.host,
            player_limit: lobby.player_limit,
            players,
            tags: lobby.tags.clone(),
            data: lobby.data.clone(),
        }
    }

    fn player_info(&self, id: ClientId) -> Option<PlayerInfo> {
        self.clients.get(&id).map(|c| PlayerInfo {
            id,
            username: c.username.clone(),
            data: c.data.clone(),
        })
    }

    /// The client's lobby, only if the client is its host.
    fn host_lobby_mut(&mut self, from: ClientId) -> Option<&mut Lobby> {
        let name = self.clients.get(&from)?.lobby.clone()?;
        let lobby = self.lobbies.get_mut(&name)?;
        if lobby.host != from {
            return None;
        }
        Some(lobby)
    }

    // ---- replication ----

    /// Who receives a relayed var/function op: the whole lobby except the
    /// sender, or a single member target. Targets outside the lobby (or the
    /// sender itself) receive nothing.
    fn relay_targets(&self, from: ClientId, target: Option<ClientId>) -> Vec<ClientId> {
        let Some(lobby) = self
            .clients
            .get(&from)
            .and_then(|c| c.lobby.as_ref())
            .and_then(|name| self.lobbies.get(name))
        else {
            return Vec::new();
        };
        match target {
            Some(target) => {
                if target != from && lobby.is_member(target) {
                    vec![target]
                } else {
                    Vec::new()
                }
            }
            None => lobby
                .members
                .iter()
                .copied()
                .filter(|m| *m != from)
                .collect(),
        }
    }

    /// All members of the sender's lobby, including the sender.
    fn own_lobby_members(&self, from: ClientId) -> Vec<ClientId> {
        self.clients
            .get(&from)
            .and_then(|c| c.lobby.as_ref())
            .and_then(|name| self.lobbies.get(name))
            .map(|lobby| lobby.members.clone())
            .unwrap_or_default()
    }

    fn instantiate_node(&mut self, from: ClientId, spawn: NodeSpawn, replicate_on_join: bool) {
        let Some(name) = self.clients.get(&from).and_then(|c| c.lobby.clone()) else {
            return;
        };
        if replicate_on_join {
            if let Some(lobby) = self.lobbies.get_mut(&name) {
                lobby.spawns.push(spawn.clone());
            }
        }
        let targets = self.relay_targets(from, None);
        self.send_many(&targets, &ServerMessage::NodeInstantiated { spawn });
    }

    /// Ownership changes are echoed to every member including the sender, so
    /// all registries converge on the same single owner.
    fn set_node_owner(&mut self, from: ClientId, node_path: String, owner: Option<ClientId>) {
        let Some(name) = self.clients.get(&from).and_then(|c| c.lobby.clone()) else {
            return;
        };
        let Some(lobby) = self.lobbies.get_mut(&name) else {
            return;
        };
        match owner {
            Some(owner) => {
                lobby.owners.insert(node_path.clone(), owner);
            }
            None => {
                lobby.owners.remove(&node_path);
            }
        }
        let members = lobby.members.clone();
        self.send_many(&members, &ServerMessage::NodeOwnerChanged { node_path, owner });
    }

    // ---- replicated key/value state ----

    /// Insert or erase (value = None) a lobby tag or data entry, enforcing
    /// the byte budget, and notify every member including the sender.
    fn set_lobby_entry(&mut self, from: ClientId, key: String, value: Option<Value>, tag: bool) {
        let Some(name) = self.clients.get(&from).and_then(|c| c.lobby.clone()) else {
            return;
        };
        let cap = if tag {
            self.caps.lobby_tag_bytes
        } else {
            self.caps.lobby_data_bytes
        };
        let Some(lobby) = self.lobbies.get_mut(&name) else {
            return;
        };
        let map = if tag { &mut lobby.tags } else { &mut lobby.data };
        let mut overflow = false;
        match &value {
            Some(new_value) => {
                let mut candidate = map.clone();
                candidate.insert(key.clone(), new_value.clone());
                if json_size(&candidate) > cap {
                    overflow = true;
                } else {
                    map.insert(key.clone(), new_value.clone());
                }
            }
            None => {
                map.remove(&key);
            }
        }
        let members = lobby.members.clone();
        if overflow {
            let error = if tag {
                CriticalError::LobbyTagsFull
            } else {
                CriticalError::LobbyDataFull
            };
            self.send_to(from, &ServerMessage::CriticalError { error });
            return;
        }
        let msg = if tag {
            ServerMessage::LobbyTagChanged { key, value }
        } else {
            ServerMessage::LobbyDataChanged { key, value }
        };
        self.send_many(&members, &msg);
    }

    /// Insert or erase a player data entry, enforcing the byte budget, and
    /// notify the lobby (or just the owner when not in one).
    fn set_player_data(&mut self, from: ClientId, key: String, value: Option<Value>) {
        let cap = self.caps.player_data_bytes;
        let Some(client) = self.clients.get_mut(&from) else {
            return;
        };
        let mut overflow = false;
        match &value {
            Some(new_value) => {
                let mut candidate = client.data.clone();
                candidate.insert(key.clone(), new_value.clone());
                if json_size(&candidate) > cap {
                    overflow = true;
                } else {
                    client.data.insert(key.clone(), new_value.clone());
                }
            }
            None => {
                client.data.remove(&key);
            }
        }
        if overflow {
            self.send_to(
                from,
                &ServerMessage::CriticalError {
                    error: CriticalError::PlayerDataFull,
                },
            );
            return;
        }
        let mut recipients = self.own_lobby_members(from);
        if recipients.is_empty() {
            recipients.push(from);
        }
        self.send_many(
            &recipients,
            &ServerMessage::PlayerDataChanged {
                client: from,
                key,
                value,
            },
        );
    }

    // ---- async api requests ----

    fn handle_request(&mut self, from: ClientId, id: RequestId, request: ApiRequest, wire_len: usize) {
        self.data_used = self.data_used.saturating_add(wire_len as u64);
        let gate = if !self.db_ok {
            Some(SharedCode::NoDatabase)
        } else if self.rate_limited(from) {
            Some(SharedCode::RateLimitExceeded)
        } else if self.data_cap.is_some_and(|cap| self.data_used > cap) {
            Some(SharedCode::DataCapReached)
        } else {
            None
        };
        let response = match gate {
            Some(code) => shared_response(&request, code),
            None => self.dispatch_request(from, request),
        };
        self.send_to(from, &ServerMessage::Response { id, response });
    }

    /// True (and records the attempt) when the client's previous api request
    /// was too recent.
    fn rate_limited(&mut self, from: ClientId) -> bool {
        if self.min_request_interval.is_zero() {
            return false;
        }
        let Some(client) = self.clients.get_mut(&from) else {
            return false;
        };
        let now = Instant::now();
        let limited = client
            .last_request
            .is_some_and(|last| now.duration_since(last) < self.min_request_interval);
        client.last_request = Some(now);
        limited
    }

    fn dispatch_request(&mut self, from: ClientId, request: ApiRequest) -> ApiResponse {
        let session = self
            .clients
            .get(&from)
            .and_then(|c| c.session.clone());
        let session_email = session.as_ref().map(|(email, _)| email.as_str());
        match request {
            ApiRequest::CreateAccount {
                email,
                username,
                password,
            } => ApiResponse::CreateAccount(self.accounts.create_account(&email, &username, &password)),
            ApiRequest::DeleteAccount { email, password } => {
                let (code, removed) = self.accounts.delete_account(&email, &password);
                if let Some(username) = removed {
                    self.leaderboards.remove_user(&username);
                    for client in self.clients.values_mut() {
                        if client.session.as_ref().is_some_and(|(e, _)| *e == email) {
                            client.session = None;
                        }
                    }
                }
                ApiResponse::DeleteAccount(code)
            }
            ApiRequest::VerifyAccount {
                email,
                code,
                valid_time,
            } => ApiResponse::VerifyAccount(self.accounts.verify_account(&email, &code, valid_time)),
            ApiRequest::ResendVerification { email, password } => {
                ApiResponse::ResendVerification(self.accounts.resend_verification(&email, &password))
            }
            ApiRequest::IsVerified { username } => {
                let (code, verified) = self.accounts.is_verified(session_email, &username);
                ApiResponse::IsVerified { code, verified }
            }
            ApiRequest::Login {
                email,
                password,
                valid_time,
            } => {
                let (code, granted) = self.accounts.login(&email, &password, valid_time);
                self.finish_login(from, code, granted)
            }
            ApiRequest::LoginFromSession {
                session_token,
                valid_time,
            } => {
                let (code, granted) = self.accounts.login_from_session(&session_token, valid_time);
                self.finish_login(from, code, granted)
            }
            ApiRequest::Logout => {
                let code = self
                    .accounts
                    .logout(session.as_ref().map(|(e, t)| (e.as_str(), t.as_str())));
                if code == LogoutCode::Success {
                    if let Some(client) = self.clients.get_mut(&from) {
                        client.session = None;
                    }
                }
                ApiResponse::Logout(code)
            }
            ApiRequest::ChangeUsername { new_username } => {
                let (code, migrated) = self.accounts.change_username(session_email, &new_username);
                if let Some((old, new)) = migrated {
                    self.leaderboards.rename_user(&old, &new);
                }
                ApiResponse::ChangeUsername(code)
            }
            ApiRequest::ChangePassword {
                email,
                password,
                new_password,
            } => ApiResponse::ChangePassword(
                self.accounts.change_password(&email, &password, &new_password),
            ),
            ApiRequest::RequestPasswordReset { email } => {
                ApiResponse::RequestPasswordReset(self.accounts.request_password_reset(&email))
            }
            ApiRequest::ResetPassword {
                email,
                reset_code,
                new_password,
            } => ApiResponse::ResetPassword(
                self.accounts.reset_password(&email, &reset_code, &new_password),
            ),
            ApiRequest::ReportAccount { username, report } => ApiResponse::ReportAccount(
                self.accounts.report_account(session_email, &username, &report),
            ),

            ApiRequest::SetDocument {
                path,
                document,
                externally_visible,
            } => ApiResponse::SetDocument(self.accounts.set_document(
                session_email,
                &path,
                document,
                externally_visible,
            )),
            ApiRequest::SetExternallyVisible {
                path,
                externally_visible,
            } => ApiResponse::SetExternallyVisible(self.accounts.set_externally_visible(
                session_email,
                &path,
                externally_visible,
            )),
            ApiRequest::GetDocument { path } => {
                let (code, document) = self.accounts.get_document(session_email, &path);
                ApiResponse::GetDocument { code, document }
            }
            ApiRequest::HasDocument { path } => {
                let (code, exists) = self.accounts.has_document(session_email, &path);
                ApiResponse::HasDocument { code, exists }
            }
            ApiRequest::BrowseCollection { path } => {
                let (code, entries) = self.accounts.browse_collection(session_email, &path);
                ApiResponse::BrowseCollection { code, entries }
            }
            ApiRequest::DeleteDocument { path } => {
                ApiResponse::DeleteDocument(self.accounts.delete_document(session_email, &path))
            }
            ApiRequest::GetExternalDocument { username, path } => {
                let (code, document) =
                    self.accounts.get_external_document(session_email, &username, &path);
                ApiResponse::GetDocument { code, document }
            }
            ApiRequest::HasExternalDocument { username, path } => {
                let (code, exists) =
                    self.accounts.has_external_document(session_email, &username, &path);
                ApiResponse::HasDocument { code, exists }
            }
            ApiRequest::BrowseExternalCollection { username, path } => {
                let (code, entries) =
                    self.accounts
                        .browse_external_collection(session_email, &username, &path);
                ApiResponse::BrowseCollection { code, entries }
            }

            ApiRequest::HasLeaderboard { leaderboard } => {
                if session_email.is_none() {
                    return ApiResponse::HasLeaderboard {
                        code: HasLeaderboardCode::NotLoggedIn,
                        exists: false,
                    };
                }
                ApiResponse::HasLeaderboard {
                    code: HasLeaderboardCode::Success,
                    exists: self.leaderboards.has(&leaderboard),
                }
            }
            ApiRequest::GetLeaderboards => {
                if session_email.is_none() {
                    return ApiResponse::GetLeaderboards {
                        code: GetLeaderboardsCode::NotLoggedIn,
                        leaderboards: Vec::new(),
                    };
                }
                ApiResponse::GetLeaderboards {
                    code: GetLeaderboardsCode::Success,
                    leaderboards: self.leaderboards.names(),
                }
            }
            ApiRequest::BrowseLeaderboard {
                leaderboard,
                page_size,
                page,
            } => {
                if session_email.is_none() {
                    return ApiResponse::BrowseLeaderboard {
                        code: BrowseLeaderboardCode::NotLoggedIn,
                        entries: Vec::new(),
                    };
                }
                match self.leaderboards.browse(&leaderboard, page_size, page) {
                    Some(entries) => ApiResponse::BrowseLeaderboard {
                        code: BrowseLeaderboardCode::Success,
                        entries,
                    },
                    None => ApiResponse::BrowseLeaderboard {
                        code: BrowseLeaderboardCode::LeaderboardDoesntExist,
                        entries: Vec::new(),
                    },
                }
            }
            ApiRequest::GetLeaderboardScore {
                leaderboard,
                username,
            } => {
                if session_email.is_none() {
                    return ApiResponse::GetLeaderboardScore {
                        code: GetLeaderboardScoreCode::NotLoggedIn,
                        score: None,
                    };
                }
                match self.leaderboards.score(&leaderboard, &username) {
                    None => ApiResponse::GetLeaderboardScore {
                        code: GetLeaderboardScoreCode::LeaderboardDoesntExist,
                        score: None,
                    },
                    Some(None) => ApiResponse::GetLeaderboardScore {
                        code: GetLeaderboardScoreCode::UserDoesntExist,
                        score: None,
                    },
                    Some(Some(score)) => ApiResponse::GetLeaderboardScore {
                        code: GetLeaderboardScoreCode::Success,
                        score: Some(score),
                    },
                }
            }
            ApiRequest::SubmitScore { leaderboard, score } => {
                let Some(username) = self.session_username(session_email) else {
                    return ApiResponse::SubmitScore(SubmitScoreCode::NotLoggedIn);
                };
                if self.leaderboards.submit(&leaderboard, &username, score) {
                    ApiResponse::SubmitScore(SubmitScoreCode::Success)
                } else {
                    ApiResponse::SubmitScore(SubmitScoreCode::LeaderboardDoesntExist)
                }
            }
            ApiRequest::DeleteScore { leaderboard } => {
                let Some(username) = self.session_username(session_email) else {
                    return ApiResponse::DeleteScore(DeleteScoreCode::NotLoggedIn);
                };
                if self.leaderboards.delete(&leaderboard, &username) {
                    ApiResponse::DeleteScore(DeleteScoreCode::Success)
                } else {
                    ApiResponse::DeleteScore(DeleteScoreCode::LeaderboardDoesntExist)
                }
            }
        }
    }

    /// Stores the granted session on the client and builds the Login
    /// response.
    fn finish_login(
        &mut self,
        from: ClientId,
        code: LoginCode,
        granted: Option<(String, String, String)>,
    ) -> ApiResponse {
        match granted {
            Some((email, token, username)) => {
                if let Some(client) = self.clients.get_mut(&from) {
                    client.session = Some((email, token.clone()));
                }
                ApiResponse::Login {
                    code,
                    session_token: Some(token),
                    username: Some(username),
                }
            }
            None => ApiResponse::Login {
                code,
                session_token: None,
                username: None,
            },
        }
    }

    /// The logged-in account's username, for username-keyed stores.
    fn session_username(&self, session_email: Option<&str>) -> Option<String> {
        self.accounts.username_for(session_email?)
    }

    // ---- writes ----

    /// Send a message to one client. Write errors are logged, not fatal —
    /// the reader thread will detect the broken pipe.
    fn send_to(&mut self, id: ClientId, msg: &ServerMessage) {
        if let Some(client) = self.clients.get_mut(&id) {
            if let Err(e) = send_message(&mut client.writer, msg) {
                log::warn!("write to client {} failed: {e}", id.0);
            }
        }
    }

    fn send_many(&mut self, ids: &[ClientId], msg: &ServerMessage) {
        for id in ids {
            self.send_to(*id, msg);
        }
    }
}

/// Serialize a `ServerMessage` to JSON and write it with length-delimited
/// framing.
fn send_message(
    writer: &mut BufWriter<TcpStream>,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_vec(msg)?;
    write_message(writer, &json)?;
    Ok(())
}

/// Answers any request with a shared infrastructure code, without touching
/// the services.
fn shared_response(request: &ApiRequest, code: SharedCode) -> ApiResponse {
    match request {
        ApiRequest::CreateAccount { .. } => {
            ApiResponse::CreateAccount(CreateAccountCode::shared(code))
        }
        ApiRequest::DeleteAccount { .. } => {
            ApiResponse::DeleteAccount(DeleteAccountCode::shared(code))
        }
        ApiRequest::VerifyAccount { .. } => {
            ApiResponse::VerifyAccount(VerifyAccountCode::shared(code))
        }
        ApiRequest::ResendVerification { .. } => {
            ApiResponse::ResendVerification(ResendVerificationCode::shared(code))
        }
        ApiRequest::IsVerified { .. } => ApiResponse::IsVerified {
            code: IsVerifiedCode::shared(code),
            verified: false,
        },
        ApiRequest::Login { .. } | ApiRequest::LoginFromSession { .. } => ApiResponse::Login {
            code: LoginCode::shared(code),
            session_token: None,
            username: None,
        },
        ApiRequest::Logout => ApiResponse::Logout(LogoutCode::shared(code)),
        ApiRequest::ChangeUsername { .. } => {
            ApiResponse::ChangeUsername(ChangeUsernameCode::shared(code))
        }
        ApiRequest::ChangePassword { .. } => {
            ApiResponse::ChangePassword(ChangePasswordCode::shared(code))
        }
        ApiRequest::RequestPasswordReset { .. } => {
            ApiResponse::RequestPasswordReset(RequestPasswordResetCode::shared(code))
        }
        ApiRequest::ResetPassword { .. } => {
            ApiResponse::ResetPassword(ResetPasswordCode::shared(code))
        }
        ApiRequest::ReportAccount { .. } => {
            ApiResponse::ReportAccount(ReportUserCode::shared(code))
        }
        ApiRequest::SetDocument { .. } => ApiResponse::SetDocument(SetDocumentCode::shared(code)),
        ApiRequest::SetExternallyVisible { .. } => {
            ApiResponse::SetExternallyVisible(SetExternalVisibleCode::shared(code))
        }
        ApiRequest::GetDocument { .. } | ApiRequest::GetExternalDocument { .. } => {
            ApiResponse::GetDocument {
                code: GetDocumentCode::shared(code),
                document: None,
            }
        }
        ApiRequest::HasDocument { .. } | ApiRequest::HasExternalDocument { .. } => {
            ApiResponse::HasDocument {
                code: HasDocumentCode::shared(code),
                exists: false,
            }
        }
        ApiRequest::BrowseCollection { .. } | ApiRequest::BrowseExternalCollection { .. } => {
            ApiResponse::BrowseCollection {
                code: BrowseCollectionCode::shared(code),
                entries: Vec::new(),
            }
        }
        ApiRequest::DeleteDocument { .. } => {
            ApiResponse::DeleteDocument(DeleteDocumentCode::shared(code))
        }
        ApiRequest::HasLeaderboard { .. } => ApiResponse::HasLeaderboard {
            code: HasLeaderboardCode::shared(code),
            exists: false,
        },
        ApiRequest::GetLeaderboards => ApiResponse::GetLeaderboards {
            code: GetLeaderboardsCode::shared(code),
            leaderboards: Vec::new(),
        },
        ApiRequest::BrowseLeaderboard { .. } => ApiResponse::BrowseLeaderboard {
            code: BrowseLeaderboardCode::shared(code),
            entries: Vec::new(),
        },
        ApiRequest::GetLeaderboardScore { .. } => ApiResponse::GetLeaderboardScore {
            code: GetLeaderboardScoreCode::shared(code),
            score: None,
        },
        ApiRequest::SubmitScore { .. } => ApiResponse::SubmitScore(SubmitScoreCode::shared(code)),
        ApiRequest::DeleteScore { .. } => ApiResponse::DeleteScore(DeleteScoreCode::shared(code)),
    }
}
