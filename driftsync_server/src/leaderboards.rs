// Leaderboard store.
//
// Leaderboards are declared in the server configuration; clients can only
// submit to boards that exist. Each board keeps one score per username, and
// a submit overwrites unconditionally so games can implement their own
// "keep best" policy client-side. Browsing sorts by score descending with
// username as the tie-breaker.

use std::collections::BTreeMap;

use driftsync_protocol::message::LeaderboardEntry;

pub struct LeaderboardStore {
    boards: BTreeMap<String, BTreeMap<String, i64>>,
    dirty: bool,
}

impl LeaderboardStore {
    pub fn new(names: &[String]) -> Self {
        Self {
            boards: names
                .iter()
                .map(|n| (n.clone(), BTreeMap::new()))
                .collect(),
            dirty: false,
        }
    }

    /// Restores persisted scores, keeping only configured boards and adding
    /// empty ones for boards configured since the snapshot.
    pub fn restore(names: &[String], mut scores: BTreeMap<String, BTreeMap<String, i64>>) -> Self {
        let boards = names
            .iter()
            .map(|n| (n.clone(), scores.remove(n).unwrap_or_default()))
            .collect();
        Self {
            boards,
            dirty: false,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, i64>> {
        self.boards.clone()
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn has(&self, name: &str) -> bool {
        self.boards.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.boards.keys().cloned().collect()
    }

    /// One page of a board, best scores first. None if the board does not
    /// exist. A `page_size` of 0 returns the whole board.
    pub fn browse(&self, name: &str, page_size: u32, page: u32) -> Option<Vec<LeaderboardEntry>> {
        let board = self.boards.get(name)?;
        let mut entries: Vec<LeaderboardEntry> = board
            .iter()
            .map(|(username, score)| LeaderboardEntry {
                username: username.clone(),
                score: *score,
            })
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.username.cmp(&b.username)));
        if page_size == 0 {
            return Some(entries);
        }
        Some(
            entries
                .into_iter()
                .skip(page_size as usize * page as usize)
                .take(page_size as usize)
                .collect(),
        )
    }

    /// None if the board does not exist; Some(None) if the board exists but
    /// the user has no score on it.
    pub fn score(&self, name: &str, username: &str) -> Option<Option<i64>> {
        Some(self.boards.get(name)?.get(username).copied())
    }

    /// Overwrites the user's score. False if the board does not exist.
    pub fn submit(&mut self, name: &str, username: &str, score: i64) -> bool {
        let Some(board) = self.boards.get_mut(name) else {
            return false;
        };
        board.insert(username.to_string(), score);
        self.dirty = true;
        true
    }

    /// Removes the user's score. False if the board does not exist; removing
    /// an absent score is not an error.
    pub fn delete(&mut self, name: &str, username: &str) -> bool {
        let Some(board) = self.boards.get_mut(name) else {
            return false;
        };
        if board.remove(username).is_some() {
            self.dirty = true;
        }
        true
    }

    /// Drops the user's scores from every board (account deletion).
    pub fn remove_user(&mut self, username: &str) {
        for board in self.boards.values_mut() {
            if board.remove(username).is_some() {
                self.dirty = true;
            }
        }
    }

    /// Re-keys the user's scores after a username change.
    pub fn rename_user(&mut self, old: &str, new: &str) {
        for board in self.boards.values_mut() {
            if let Some(score) = board.remove(old) {
                board.insert(new.to_string(), score);
                self.dirty = true;
            }
        }
    }
}
