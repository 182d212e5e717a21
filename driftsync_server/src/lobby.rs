// Lobby state and validation.
//
// A `Lobby` is a named matchmaking room: members, host, password, visibility,
// player limit, and the two replicated key/value maps (tags and data). It also
// carries the per-lobby replication registries — node ownership and the
// replicate-on-join spawn records replayed to late joiners.
//
// Validation lives here as pure functions returning the protocol's error
// enums; the `Hub` decides who to notify. Byte budgets for tags/data are
// measured on the serialized JSON form, matching what actually crosses the
// wire.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use driftsync_protocol::message::{LobbyInfo, NodeSpawn};
use driftsync_protocol::response::{LobbyCreateError, LobbyJoinError};
use driftsync_protocol::types::ClientId;

/// Minimum lobby name length in characters.
pub const MIN_LOBBY_NAME: usize = 3;
/// Maximum lobby name length in characters.
pub const MAX_LOBBY_NAME: usize = 32;
/// Maximum lobby password length in characters.
pub const MAX_LOBBY_PASSWORD: usize = 32;

/// Serialized size of a value, used for all metadata byte budgets.
pub fn json_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// A matchmaking room and its replicated state.
pub struct Lobby {
    pub name: String,
    password: Option<String>,
    pub public: bool,
    pub open: bool,
    /// 0 = unlimited.
    pub player_limit: u32,
    pub host: ClientId,
    pub members: Vec<ClientId>,
    pub tags: BTreeMap<String, Value>,
    pub data: BTreeMap<String, Value>,
    /// Node path -> owning client. At most one owner per path.
    pub owners: BTreeMap<String, ClientId>,
    /// Spawns replayed to late joiners (replicate_on_join only).
    pub spawns: Vec<NodeSpawn>,
}

/// Checks the creation-time constraints that do not depend on registry
/// state: name length, password length, and metadata byte budgets.
/// `AlreadyExists` and `OnCooldown` are the Hub's to decide.
pub fn create_error(
    name: &str,
    password: &str,
    tags: &BTreeMap<String, Value>,
    data: &BTreeMap<String, Value>,
    tag_cap_bytes: usize,
    data_cap_bytes: usize,
) -> Option<LobbyCreateError> {
    if name.chars().count() < MIN_LOBBY_NAME {
        return Some(LobbyCreateError::NameTooShort);
    }
    if name.chars().count() > MAX_LOBBY_NAME {
        return Some(LobbyCreateError::NameTooLong);
    }
    if password.chars().count() > MAX_LOBBY_PASSWORD {
        return Some(LobbyCreateError::PasswordTooLong);
    }
    if json_size(tags) > tag_cap_bytes {
        return Some(LobbyCreateError::TagsTooLarge);
    }
    if json_size(data) > data_cap_bytes {
        return Some(LobbyCreateError::DataTooLarge);
    }
    None
}

impl Lobby {
    /// Creates a lobby with `host` as its sole member. An empty password
    /// means the lobby is unprotected.
    pub fn new(
        name: String,
        password: String,
        public: bool,
        player_limit: u32,
        tags: BTreeMap<String, Value>,
        data: BTreeMap<String, Value>,
        host: ClientId,
    ) -> Self {
        Self {
            name,
            password: if password.is_empty() {
                None
            } else {
                Some(password)
            },
            public,
            open: true,
            player_limit,
            host,
            members: vec![host],
            tags,
            data,
            owners: BTreeMap::new(),
            spawns: Vec::new(),
        }
    }

    pub fn is_member(&self, id: ClientId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_full(&self) -> bool {
        self.player_limit != 0 && self.members.len() as u32 >= self.player_limit
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Host-only: replace or clear the password.
    pub fn set_password(&mut self, password: String) {
        self.password = if password.is_empty() {
            None
        } else {
            Some(password)
        };
    }

    /// Why a prospective member cannot join, or None if the join is allowed.
    /// `member_names` are the usernames of the current members.
    pub fn join_error(
        &self,
        password: &str,
        username: &str,
        member_names: &[String],
    ) -> Option<LobbyJoinError> {
        if !self.open {
            return Some(LobbyJoinError::Closed);
        }
        if self.is_full() {
            return Some(LobbyJoinError::Full);
        }
        if let Some(expected) = &self.password {
            if expected != password {
                return Some(LobbyJoinError::IncorrectPassword);
            }
        }
        if member_names.iter().any(|n| n == username) {
            return Some(LobbyJoinError::DuplicateUsername);
        }
        None
    }

    /// Removes a member. Returns true if the member was present.
    pub fn remove_member(&mut self, id: ClientId) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != id);
        self.members.len() != before
    }

    /// Directory entry for the public lobby list.
    pub fn info(&self) -> LobbyInfo {
        LobbyInfo {
            name: self.name.clone(),
            player_count: self.members.len() as u32,
            player_limit: self.player_limit,
            open: self.open,
            has_password: self.password.is_some(),
            tags: self.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn lobby() -> Lobby {
        Lobby::new(
            "arena".into(),
            String::new(),
            true,
            2,
            BTreeMap::new(),
            BTreeMap::new(),
            ClientId(1),
        )
    }

    #[test]
    fn creator_is_host_and_sole_member() {
        let lobby = lobby();
        assert_eq!(lobby.host, ClientId(1));
        assert_eq!(lobby.members, vec![ClientId(1)]);
        assert!(lobby.open);
    }

    #[test]
    fn empty_password_means_unprotected() {
        let lobby = lobby();
        assert!(!lobby.has_password());
        assert_eq!(lobby.join_error("anything", "bob", &["alice".into()]), None);
    }

    #[test]
    fn join_checks_in_order() {
        let mut lobby = Lobby::new(
            "arena".into(),
            "secret".into(),
            true,
            2,
            BTreeMap::new(),
            BTreeMap::new(),
            ClientId(1),
        );
        let names = vec!["alice".to_string()];

        lobby.open = false;
        assert_eq!(
            lobby.join_error("wrong", "alice", &names),
            Some(LobbyJoinError::Closed)
        );
        lobby.open = true;

        lobby.members.push(ClientId(2));
        assert_eq!(
            lobby.join_error("wrong", "alice", &names),
            Some(LobbyJoinError::Full)
        );
        lobby.remove_member(ClientId(2));

        assert_eq!(
            lobby.join_error("wrong", "alice", &names),
            Some(LobbyJoinError::IncorrectPassword)
        );
        assert_eq!(
            lobby.join_error("secret", "alice", &names),
            Some(LobbyJoinError::DuplicateUsername)
        );
        assert_eq!(lobby.join_error("secret", "bob", &names), None);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let mut lobby = lobby();
        lobby.player_limit = 0;
        for i in 2..50 {
            lobby.members.push(ClientId(i));
        }
        assert!(!lobby.is_full());
    }

    #[test]
    fn create_error_name_bounds() {
        let tags = BTreeMap::new();
        let data = BTreeMap::new();
        assert_eq!(
            create_error("ab", "", &tags, &data, 1024, 1024),
            Some(LobbyCreateError::NameTooShort)
        );
        let long = "x".repeat(MAX_LOBBY_NAME + 1);
        assert_eq!(
            create_error(&long, "", &tags, &data, 1024, 1024),
            Some(LobbyCreateError::NameTooLong)
        );
        assert_eq!(create_error("arena", "", &tags, &data, 1024, 1024), None);
    }

    #[test]
    fn create_error_password_length() {
        let tags = BTreeMap::new();
        let data = BTreeMap::new();
        let long = "p".repeat(MAX_LOBBY_PASSWORD + 1);
        assert_eq!(
            create_error("arena", &long, &tags, &data, 1024, 1024),
            Some(LobbyCreateError::PasswordTooLong)
        );
    }

    #[test]
    fn create_error_metadata_budgets() {
        let mut tags = BTreeMap::new();
        tags.insert("huge".to_string(), json!("x".repeat(64)));
        let data = BTreeMap::new();
        assert_eq!(
            create_error("arena", "", &tags, &data, 16, 1024),
            Some(LobbyCreateError::TagsTooLarge)
        );
        assert_eq!(
            create_error("arena", "", &data, &tags, 1024, 16),
            Some(LobbyCreateError::DataTooLarge)
        );
    }

    #[test]
    fn info_reflects_state() {
        let mut lobby = Lobby::new(
            "arena".into(),
            "pw".into(),
            true,
            4,
            BTreeMap::from([("mode".to_string(), json!("ffa"))]),
            BTreeMap::new(),
            ClientId(1),
        );
        lobby.members.push(ClientId(2));
        let info = lobby.info();
        assert_eq!(info.name, "arena");
        assert_eq!(info.player_count, 2);
        assert_eq!(info.player_limit, 4);
        assert!(info.open);
        assert!(info.has_password);
        assert_eq!(info.tags.get("mode"), Some(&json!("ffa")));
    }
}
