// Durable state: accounts and leaderboard scores as one JSON file.
//
// The server flushes a `PersistedState` snapshot whenever the account or
// leaderboard services report changes. Writes go to a temporary file in the
// same directory followed by a rename, so a crash mid-write leaves the
// previous snapshot intact. Lobby and replication state is deliberately
// ephemeral and never persisted.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::accounts::Account;

const STATE_FILE: &str = "state.json";
const STATE_TMP: &str = "state.json.tmp";

#[derive(Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub accounts: BTreeMap<String, Account>,
    pub leaderboards: BTreeMap<String, BTreeMap<String, i64>>,
}

pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Loads the saved snapshot. `Ok(None)` means no snapshot exists yet;
    /// an `Err` means the snapshot exists but could not be read, which the
    /// server must treat as "database unavailable" rather than silently
    /// starting fresh.
    pub fn load(&self) -> io::Result<Option<PersistedState>> {
        let path = self.dir.join(STATE_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let state = serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistedState) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let bytes = serde_json::to_vec(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.dir.join(STATE_TMP);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("driftsync-{tag}-{nanos}"))
    }

    #[test]
    fn missing_snapshot_is_none() {
        let storage = Storage::new(scratch_dir("missing"));
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = scratch_dir("roundtrip");
        let storage = Storage::new(dir.clone());

        let mut state = PersistedState::default();
        state
            .leaderboards
            .entry("high-scores".to_string())
            .or_default()
            .insert("alice".to_string(), 9000);
        storage.save(&state).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(
            loaded.leaderboards.get("high-scores").and_then(|b| b.get("alice")),
            Some(&9000)
        );
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = scratch_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(STATE_FILE), b"{ not json").unwrap();
        let storage = Storage::new(dir.clone());
        assert!(storage.load().is_err());
        fs::remove_dir_all(dir).unwrap();
    }
}
