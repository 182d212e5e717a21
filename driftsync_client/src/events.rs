// Events surfaced to the game by `SyncClient::poll()`, and the delay queue
// that holds back synced events until their shared fire time.

use std::time::{Duration, Instant};

use serde_json::Value;

use driftsync_protocol::message::{LobbyInfo, NodeSpawn};
use driftsync_protocol::response::{
    ConnectError, CriticalError, LobbyCreateError, LobbyJoinError,
};
use driftsync_protocol::types::ClientId;

/// Everything the sync layer can tell the game. Returned in order by
/// `SyncClient::poll()`; the game matches on the variants it cares about.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Connected,
    /// A connection attempt failed with the server's stated reason.
    /// (I/O-level failures surface as `ClientError` from `connect`.)
    ConnectionFailed(ConnectError),
    Disconnected,
    ClientIdChanged(ClientId),

    LobbyCreated(String),
    LobbyCreationFailed {
        name: String,
        error: LobbyCreateError,
    },
    LobbyJoined(String),
    LobbyJoinFailed {
        name: String,
        error: LobbyJoinError,
    },
    LobbiesReceived(Vec<LobbyInfo>),
    /// value = None means the key was erased.
    LobbyDataChanged {
        key: String,
        value: Option<Value>,
    },
    LobbyTagChanged {
        key: String,
        value: Option<Value>,
    },
    ClientJoined(ClientId),
    ClientLeft(ClientId),
    PlayerDataChanged {
        client: ClientId,
        key: String,
        value: Option<Value>,
    },
    HostChanged {
        /// True when this client became the host.
        is_host: bool,
        host: ClientId,
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
    SyncedEventTriggered {
        name: String,
        args: Vec<Value>,
    },
    NodeInstantiated(NodeSpawn),
    OwnerChanged {
        node_path: String,
        owner: Option<ClientId>,
    },

    CriticalError(CriticalError),
}

/// Synced events waiting for their fire time. The server stamps every lobby
/// member's copy with the same delay, so peers that received the event at
/// roughly the same time fire at roughly the same time.
pub(crate) struct DelayQueue {
    entries: Vec<(Instant, String, Vec<Value>)>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Schedule an event `delay` seconds from now. Non-finite or negative
    /// delays fire immediately.
    pub fn push(&mut self, name: String, args: Vec<Value>, delay: f32) {
        let delay = if delay.is_finite() && delay > 0.0 {
            Duration::from_secs_f32(delay)
        } else {
            Duration::ZERO
        };
        self.entries.push((Instant::now() + delay, name, args));
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<(String, Vec<Value>)> {
        let mut due: Vec<(Instant, String, Vec<Value>)> = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].0 <= now {
                due.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|(at, _, _)| *at);
        due.into_iter().map(|(_, name, args)| (name, args)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn zero_delay_fires_immediately() {
        let mut queue = DelayQueue::new();
        queue.push("go".into(), vec![json!(1)], 0.0);
        let fired = queue.drain_due(Instant::now());
        assert_eq!(fired, vec![("go".to_string(), vec![json!(1)])]);
        assert!(queue.is_empty());
    }

    #[test]
    fn negative_delay_is_clamped() {
        let mut queue = DelayQueue::new();
        queue.push("go".into(), Vec::new(), -5.0);
        assert_eq!(queue.drain_due(Instant::now()).len(), 1);
    }

    #[test]
    fn future_events_wait() {
        let mut queue = DelayQueue::new();
        queue.push("later".into(), Vec::new(), 60.0);
        assert!(queue.drain_due(Instant::now()).is_empty());
        assert!(!queue.is_empty());
    }

    #[test]
    fn due_events_come_out_earliest_first() {
        let mut queue = DelayQueue::new();
        queue.push("second".into(), Vec::new(), 0.002);
        queue.push("first".into(), Vec::new(), 0.001);
        std::thread::sleep(Duration::from_millis(10));
        let fired = queue.drain_due(Instant::now());
        assert_eq!(fired[0].0, "first");
        assert_eq!(fired[1].0, "second");
    }
}
