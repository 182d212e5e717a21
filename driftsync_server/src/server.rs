// TCP server and main event loop for the sync service.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per client): call `framing::read_message()` in a
//   loop, deserialize `ClientMessage`, and send `InternalEvent::MessageFrom`
//   to the main thread. On error/EOF, send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Hub`, receives events from the channel, and
//   dispatches them. Uses `recv_timeout` so persistence flushes happen on a
//   steady cadence even when no client traffic arrives.
//
// The main thread is the only writer to client TCP streams (via
// `Hub::send_to`). Reader threads only read from streams. This avoids
// concurrent read/write on the same `TcpStream`, which is safe on most
// platforms but fragile.
//
// Shutdown: the main thread checks a `keep_running` flag (set to false by
// `ServerHandle::stop`) and breaks out of the event loop, flushing a final
// snapshot on the way out.

use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use driftsync_protocol::framing::{read_message, write_message};
use driftsync_protocol::message::{ClientMessage, ServerMessage};
use driftsync_protocol::response::ConnectError;
use driftsync_protocol::types::ClientId;

use crate::accounts::{AccountPolicy, AccountService};
use crate::hub::{Caps, Hub};
use crate::leaderboards::LeaderboardStore;
use crate::storage::{PersistedState, Storage};

/// Protocol version spoken by this server. Logged on handshake mismatch but
/// not (yet) enforced.
pub const PROTOCOL_VERSION: u32 = 1;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_TIMEOUT: Duration = Duration::from_millis(500);
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
    },
    MessageFrom {
        client: ClientId,
        message: ClientMessage,
        wire_len: usize,
    },
    Disconnected {
        client: ClientId,
    },
}

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal the server to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a sync server.
pub struct ServerConfig {
    pub port: u16,
    /// When set, clients must present this key in their Hello.
    pub api_key: Option<String>,
    /// Directory for the persisted snapshot. None = fully in-memory.
    pub data_dir: Option<PathBuf>,
    pub require_verification: bool,
    /// Cumulative api request bytes before requests are refused.
    pub data_cap: Option<u64>,
    /// Minimum spacing between api requests per client. Zero disables.
    pub min_request_interval: Duration,
    /// Leaderboards available to clients; submissions to other names fail.
    pub leaderboards: Vec<String>,
    pub caps: Caps,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8877,
            api_key: None,
            data_dir: None,
            require_verification: false,
            data_cap: None,
            min_request_interval: Duration::ZERO,
            leaderboards: Vec::new(),
            caps: Caps::default(),
        }
    }
}

/// Start the sync server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used to
/// let the OS pick a free port).
pub fn start_server(config: ServerConfig) -> std::io::Result<(ServerHandle, std::net::SocketAddr)> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    let thread = thread::spawn(move || {
        run_server(listener, config, keep_running_clone);
    });

    Ok((
        ServerHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Build the hub from config plus whatever snapshot is on disk. A snapshot
/// that exists but fails to load leaves the hub answering NoDatabase rather
/// than silently losing accounts.
fn build_hub(config: &ServerConfig, storage: Option<&Storage>) -> Hub {
    let policy = AccountPolicy {
        require_verification: config.require_verification,
        ..AccountPolicy::default()
    };
    let mut db_ok = true;
    let mut loaded = None;
    if let Some(storage) = storage {
        match storage.load() {
            Ok(state) => loaded = state,
            Err(e) => {
                log::error!("failed to load persisted state: {e}");
                db_ok = false;
            }
        }
    }
    let (accounts, leaderboards) = match loaded {
        Some(state) => (
            AccountService::restore(policy, state.accounts),
            LeaderboardStore::restore(&config.leaderboards, state.leaderboards),
        ),
        None => (
            AccountService::new(policy),
            LeaderboardStore::new(&config.leaderboards),
        ),
    };
    Hub::new(
        accounts,
        leaderboards,
        config.caps.clone(),
        config.min_request_interval,
        config.data_cap,
        db_ok,
    )
}

/// Main server loop. Runs until `keep_running` is set to false.
fn run_server(listener: TcpListener, config: ServerConfig, keep_running: Arc<AtomicBool>) {
    let storage = config.data_dir.clone().map(Storage::new);
    let mut hub = build_hub(&config, storage.as_ref());
    let api_key = config.api_key.clone();

    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Set the listener to non-blocking so the accept thread can check
    // keep_running periodically.
    listener.set_nonblocking(true).ok();

    // Listener thread: accepts new connections.
    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => break,
            }
        }
    });

    let mut last_flush = Instant::now();

    // Main event loop.
    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(EVENT_TIMEOUT) {
            Ok(event) => {
                handle_event(&mut hub, event, api_key.as_deref(), &tx, &keep_running);
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut hub, event, api_key.as_deref(), &tx, &keep_running);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if last_flush.elapsed() >= FLUSH_INTERVAL {
            flush(&mut hub, storage.as_ref());
            last_flush = Instant::now();
        }
    }

    flush(&mut hub, storage.as_ref());
}

/// Write a snapshot if either store changed since the last flush.
fn flush(hub: &mut Hub, storage: Option<&Storage>) {
    let Some(storage) = storage else {
        return;
    };
    let accounts_dirty = hub.accounts.take_dirty();
    let leaderboards_dirty = hub.leaderboards.take_dirty();
    if !accounts_dirty && !leaderboards_dirty {
        return;
    }
    let state = PersistedState {
        accounts: hub.accounts.snapshot(),
        leaderboards: hub.leaderboards.snapshot(),
    };
    if let Err(e) = storage.save(&state) {
        log::error!("failed to persist state: {e}");
    }
}

/// Dispatch a single event to the hub.
fn handle_event(
    hub: &mut Hub,
    event: InternalEvent,
    api_key: Option<&str>,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    match event {
        InternalEvent::NewConnection { stream } => {
            handle_new_connection(hub, stream, api_key, tx, keep_running);
        }
        InternalEvent::MessageFrom {
            client,
            message,
            wire_len,
        } => {
            hub.handle_message(client, message, wire_len);
        }
        InternalEvent::Disconnected { client } => {
            hub.remove_client(client);
        }
    }
}

/// Handle a new TCP connection: read the Hello handshake, check the api key,
/// register the client, and spawn a reader thread.
fn handle_new_connection(
    hub: &mut Hub,
    stream: TcpStream,
    api_key: Option<&str>,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    // Set a read timeout so the handshake doesn't block forever.
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();

    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    });

    let hello_bytes = match read_message(&mut reader) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };

    let hello: ClientMessage = match serde_json::from_slice(&hello_bytes) {
        Ok(msg) => msg,
        Err(_) => return,
    };

    match hello {
        ClientMessage::Hello {
            protocol_version,
            api_key: presented_key,
            username,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                log::warn!(
                    "client speaks protocol {protocol_version}, server speaks {PROTOCOL_VERSION}"
                );
            }
            if api_key.is_some_and(|key| key != presented_key) {
                log::warn!("connection refused: invalid api key");
                reject(stream, ConnectError::InvalidKey);
                return;
            }

            let write_stream = match stream.try_clone() {
                Ok(s) => s,
                Err(_) => return,
            };
            let client = hub.add_client(username, write_stream);

            // Clear read timeout for the long-lived reader loop.
            stream.set_read_timeout(None).ok();
            let tx_reader = tx.clone();
            let keep_running_reader = keep_running.clone();
            thread::spawn(move || {
                reader_loop(reader, client, tx_reader, keep_running_reader);
            });
        }
        _ => {
            // Expected Hello as first message — drop the connection.
        }
    }
}

/// Send a Rejected message and close the connection.
fn reject(stream: TcpStream, error: ConnectError) {
    let rejected = ServerMessage::Rejected { error };
    if let Ok(json) = serde_json::to_vec(&rejected) {
        let mut writer = BufWriter::new(stream);
        let _ = write_message(&mut writer, &json);
    }
}

/// Reader loop for a single client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    client: ClientId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_message(&mut reader) {
            Ok(bytes) => {
                let wire_len = bytes.len();
                match serde_json::from_slice::<ClientMessage>(&bytes) {
                    Ok(ClientMessage::Goodbye) => {
                        let _ = tx.send(InternalEvent::Disconnected { client });
                        break;
                    }
                    Ok(message) => {
                        let _ = tx.send(InternalEvent::MessageFrom {
                            client,
                            message,
                            wire_len,
                        });
                    }
                    Err(_) => {
                        // Malformed message — disconnect.
                        let _ = tx.send(InternalEvent::Disconnected { client });
                        break;
                    }
                }
            }
            Err(_) => {
                // Read error or EOF — disconnect.
                let _ = tx.send(InternalEvent::Disconnected { client });
                break;
            }
        }
    }
}
