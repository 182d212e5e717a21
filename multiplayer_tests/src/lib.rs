// Test-only wrapper for end-to-end multiplayer tests.
//
// Wraps the real `SyncClient` (from `driftsync_client`) with synchronous
// polling helpers so integration tests can write
// connect → create lobby → replicate → verify as straight-line code. All
// networking uses the same code paths as a real game; the only
// test-specific code here is the blocking loops around `SyncClient::poll()`.
//
// See also: `tests/full_pipeline.rs` and `tests/account_flow.rs` for the
// scenarios.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use driftsync_client::{SyncClient, SyncEvent};

/// Default timeout for blocking waits.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A test game client wrapping a real `SyncClient`. Events polled while
/// waiting for something specific are buffered, so waits on different event
/// kinds can run in any order.
pub struct TestClient {
    pub inner: SyncClient,
    buffered: VecDeque<SyncEvent>,
}

impl TestClient {
    /// Connect to a sync server with no api key.
    pub fn connect(addr: SocketAddr, username: &str) -> Self {
        Self::connect_with_key(addr, "", username)
    }

    pub fn connect_with_key(addr: SocketAddr, api_key: &str, username: &str) -> Self {
        let inner = SyncClient::connect(&addr.to_string(), api_key, username)
            .expect("TestClient::connect failed");
        Self {
            inner,
            buffered: VecDeque::new(),
        }
    }

    /// Blocking: poll until an event matching `pred` arrives, buffering
    /// everything else. Panics (failing the test) after the timeout; `what`
    /// names the expectation in the panic message.
    pub fn wait_for(&mut self, what: &str, pred: impl Fn(&SyncEvent) -> bool) -> SyncEvent {
        let start = Instant::now();
        loop {
            if let Some(pos) = self.buffered.iter().position(|e| pred(e)) {
                return self.buffered.remove(pos).expect("position was valid");
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}; buffered: {:?}",
                self.buffered
            );
            self.buffered.extend(self.inner.poll());
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Poll repeatedly for `duration`, buffering everything that arrives.
    pub fn pump_for(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.buffered.extend(self.inner.poll());
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Non-blocking: return everything buffered plus anything pending.
    pub fn drain(&mut self) -> Vec<SyncEvent> {
        self.buffered.extend(self.inner.poll());
        self.buffered.drain(..).collect()
    }

    /// Send Goodbye and close the connection.
    pub fn disconnect(&mut self) {
        self.inner.disconnect();
    }
}
