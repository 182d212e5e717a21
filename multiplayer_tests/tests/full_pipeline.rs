// End-to-end tests for the realtime path: connect, lobbies, replication,
// synced events, node spawns, ownership, host migration.
//
// Each test starts a real server on a random port and connects real
// `SyncClient` instances (via `TestClient`). The scenarios exercise the
// same code paths as a live game; the only test-specific code is the
// synchronous polling wrappers in `TestClient`.

use std::thread;
use std::time::Duration;

use driftsync_client::{CreateLobbyOptions, InstantiateOptions, SyncEvent};
use driftsync_protocol::response::{CriticalError, LobbyJoinError};
use driftsync_protocol::types::ClientId;
use driftsync_server::{Caps, ServerConfig, ServerHandle, start_server};
use multiplayer_tests::TestClient;
use serde_json::json;

/// Start a server on a random port with the given config.
fn start_test_server(config: ServerConfig) -> (ServerHandle, std::net::SocketAddr) {
    let (handle, addr) = start_server(ServerConfig { port: 0, ..config }).unwrap();
    thread::sleep(Duration::from_millis(30));
    (handle, addr)
}

fn default_server() -> (ServerHandle, std::net::SocketAddr) {
    start_test_server(ServerConfig::default())
}

/// Host creates a lobby, joiner joins it, both settle.
fn lobby_pair(addr: std::net::SocketAddr, lobby: &str) -> (TestClient, TestClient) {
    let mut host = TestClient::connect(addr, "Host");
    let mut joiner = TestClient::connect(addr, "Joiner");

    host.inner
        .create_lobby(lobby, CreateLobbyOptions::default())
        .unwrap();
    host.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));

    joiner.inner.join_lobby(lobby, "").unwrap();
    joiner.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));
    host.wait_for("joiner arrival", |e| {
        matches!(e, SyncEvent::ClientJoined(_))
    });

    (host, joiner)
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Client IDs are assigned sequentially from 1.
#[test]
fn client_ids_start_at_one() {
    let (handle, addr) = default_server();

    let mut first = TestClient::connect(addr, "First");
    first.wait_for("connected", |e| matches!(e, SyncEvent::Connected));
    let mut second = TestClient::connect(addr, "Second");
    second.wait_for("connected", |e| matches!(e, SyncEvent::Connected));

    assert_eq!(first.inner.client_id(), ClientId(1));
    assert_eq!(second.inner.client_id(), ClientId(2));

    handle.stop();
}

/// A created public lobby shows up in the directory with the right
/// metadata, and joining replicates the roster to both sides.
#[test]
fn lobby_create_join_and_directory() {
    let (handle, addr) = default_server();

    let mut host = TestClient::connect(addr, "Host");
    host.inner
        .create_lobby(
            "arena",
            CreateLobbyOptions {
                tags: [("mode".to_string(), json!("ffa"))].into(),
                ..CreateLobbyOptions::default()
            },
        )
        .unwrap();
    host.wait_for("lobby created ack", |e| {
        matches!(e, SyncEvent::LobbyCreated(name) if name == "arena")
    });
    host.wait_for("lobby joined", |e| {
        matches!(e, SyncEvent::LobbyJoined(name) if name == "arena")
    });
    assert!(host.inner.is_host());

    let mut browser = TestClient::connect(addr, "Browser");
    browser.inner.get_public_lobbies().unwrap();
    let listing = browser.wait_for("lobby directory", |e| {
        matches!(e, SyncEvent::LobbiesReceived(_))
    });
    let SyncEvent::LobbiesReceived(lobbies) = listing else {
        unreachable!()
    };
    assert_eq!(lobbies.len(), 1);
    assert_eq!(lobbies[0].name, "arena");
    assert_eq!(lobbies[0].player_count, 1);
    assert!(lobbies[0].open);
    assert!(!lobbies[0].has_password);
    assert_eq!(lobbies[0].tags.get("mode"), Some(&json!("ffa")));

    browser.inner.join_lobby("arena", "").unwrap();
    browser.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));
    assert_eq!(browser.inner.lobby_player_count(), 2);
    assert_eq!(browser.inner.host(), host.inner.client_id());
    assert!(!browser.inner.is_host());

    host.wait_for("roster update", |e| {
        matches!(e, SyncEvent::ClientJoined(id) if *id == browser.inner.client_id())
    });
    assert_eq!(host.inner.lobby_player_count(), 2);

    handle.stop();
}

/// A replicated var write reaches the peer (with the sender's ID) but is
/// never echoed back to the sender.
#[test]
fn sync_var_reaches_peer_but_not_sender() {
    let (handle, addr) = default_server();
    let (mut host, mut joiner) = lobby_pair(addr, "arena");

    host.inner
        .sync_var("world/player1", "health", json!(73), true)
        .unwrap();

    let event = joiner.wait_for("replicated var", |e| matches!(e, SyncEvent::VarSet { .. }));
    let SyncEvent::VarSet {
        from,
        node_path,
        variable,
        value,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(from, host.inner.client_id());
    assert_eq!(node_path, "world/player1");
    assert_eq!(variable, "health");
    assert_eq!(value, json!(73));

    // The mirror tracks who sent the last replicated message, and forgets
    // on leaving the lobby.
    assert_eq!(joiner.inner.sender_id(), host.inner.client_id());
    joiner.inner.leave_lobby().unwrap();
    assert_eq!(joiner.inner.sender_id(), ClientId::NONE);

    host.pump_for(Duration::from_millis(200));
    assert!(
        !host
            .drain()
            .iter()
            .any(|e| matches!(e, SyncEvent::VarSet { .. })),
        "sender must not receive its own var write"
    );

    handle.stop();
}

/// A targeted function call reaches only the addressed peer.
#[test]
fn targeted_call_reaches_only_the_target() {
    let (handle, addr) = default_server();
    let (mut host, mut joiner) = lobby_pair(addr, "arena");
    let mut third = TestClient::connect(addr, "Third");
    third.inner.join_lobby("arena", "").unwrap();
    third.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));

    host.inner
        .call_func_on(
            third.inner.client_id(),
            "world/ui",
            "show_message",
            vec![json!("hello")],
            true,
        )
        .unwrap();

    let event = third.wait_for("targeted call", |e| {
        matches!(e, SyncEvent::FunctionCalled { .. })
    });
    let SyncEvent::FunctionCalled { from, function, .. } = event else {
        unreachable!()
    };
    assert_eq!(from, host.inner.client_id());
    assert_eq!(function, "show_message");

    joiner.pump_for(Duration::from_millis(200));
    assert!(
        !joiner
            .drain()
            .iter()
            .any(|e| matches!(e, SyncEvent::FunctionCalled { .. })),
        "untargeted member must not receive a targeted call"
    );

    handle.stop();
}

/// A synced event fires on every member, including the sender, after the
/// shared delay.
#[test]
fn synced_event_fires_on_all_members() {
    let (handle, addr) = default_server();
    let (mut host, mut joiner) = lobby_pair(addr, "arena");

    host.inner
        .create_synced_event("round_start", 0.05, vec![json!(3)])
        .unwrap();

    for client in [&mut host, &mut joiner] {
        let event = client.wait_for("synced event", |e| {
            matches!(e, SyncEvent::SyncedEventTriggered { .. })
        });
        let SyncEvent::SyncedEventTriggered { name, args } = event else {
            unreachable!()
        };
        assert_eq!(name, "round_start");
        assert_eq!(args, vec![json!(3)]);
    }

    handle.stop();
}

/// A spawn marked replicate_on_join is replayed to clients that join later.
#[test]
fn spawn_is_replayed_to_late_joiner() {
    let (handle, addr) = default_server();

    let mut host = TestClient::connect(addr, "Host");
    host.inner
        .create_lobby("arena", CreateLobbyOptions::default())
        .unwrap();
    host.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));

    let node_path = host
        .inner
        .multiplayer_instantiate("scenes/ball.tscn", "world", InstantiateOptions::default())
        .unwrap();
    assert!(node_path.starts_with("world/ball@"));
    // Let the server record the spawn before the joiner arrives.
    host.pump_for(Duration::from_millis(100));

    let mut joiner = TestClient::connect(addr, "Joiner");
    joiner.inner.join_lobby("arena", "").unwrap();
    joiner.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));
    let event = joiner.wait_for("replayed spawn", |e| {
        matches!(e, SyncEvent::NodeInstantiated(_))
    });
    let SyncEvent::NodeInstantiated(spawn) = event else {
        unreachable!()
    };
    assert_eq!(spawn.node_path, node_path);
    assert_eq!(spawn.scene, "scenes/ball.tscn");
    assert_eq!(spawn.instantiator, host.inner.client_id());

    handle.stop();
}

/// Ownership changes are echoed to everyone (sender included). When the
/// owner leaves, its entries are cleared and the host migrates to the
/// lowest remaining ID.
#[test]
fn ownership_clears_and_host_migrates_on_leave() {
    let (handle, addr) = default_server();
    let (mut host, mut joiner) = lobby_pair(addr, "arena");
    let host_id = host.inner.client_id();

    host.inner.set_node_owner("world/crown", host_id).unwrap();
    for client in [&mut host, &mut joiner] {
        client.wait_for("ownership echo", |e| {
            matches!(e, SyncEvent::OwnerChanged { node_path, owner }
                if node_path == "world/crown" && *owner == Some(host_id))
        });
        assert_eq!(client.inner.node_owner("world/crown"), Some(host_id));
    }
    assert!(host.inner.is_node_owner("world/crown"));

    host.disconnect();

    joiner.wait_for("departure", |e| {
        matches!(e, SyncEvent::ClientLeft(id) if *id == host_id)
    });
    joiner.wait_for("ownership cleared", |e| {
        matches!(e, SyncEvent::OwnerChanged { owner: None, .. })
    });
    let promotion = joiner.wait_for("host migration", |e| {
        matches!(e, SyncEvent::HostChanged { .. })
    });
    assert_eq!(
        promotion,
        SyncEvent::HostChanged {
            is_host: true,
            host: joiner.inner.client_id(),
        }
    );
    assert!(joiner.inner.is_host());
    assert_eq!(joiner.inner.node_owner("world/crown"), None);
    assert_eq!(joiner.inner.lobby_player_count(), 1);

    handle.stop();
}

/// An emptied lobby is destroyed and disappears from the directory.
#[test]
fn emptied_lobby_is_destroyed() {
    let (handle, addr) = default_server();

    let mut client = TestClient::connect(addr, "Solo");
    client
        .inner
        .create_lobby("fleeting", CreateLobbyOptions::default())
        .unwrap();
    client.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));

    client.inner.leave_lobby().unwrap();
    client.inner.get_public_lobbies().unwrap();
    let listing = client.wait_for("lobby directory", |e| {
        matches!(e, SyncEvent::LobbiesReceived(_))
    });
    assert_eq!(listing, SyncEvent::LobbiesReceived(Vec::new()));

    handle.stop();
}

/// Closed lobbies and wrong passwords refuse joins with the right errors.
#[test]
fn join_is_refused_when_closed_or_password_wrong() {
    let (handle, addr) = default_server();

    let mut host = TestClient::connect(addr, "Host");
    host.inner
        .create_lobby(
            "private",
            CreateLobbyOptions {
                password: "sesame".into(),
                ..CreateLobbyOptions::default()
            },
        )
        .unwrap();
    host.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));

    let mut joiner = TestClient::connect(addr, "Joiner");
    joiner.inner.join_lobby("private", "wrong").unwrap();
    joiner.wait_for("password refusal", |e| {
        matches!(e, SyncEvent::LobbyJoinFailed { error, .. }
            if *error == LobbyJoinError::IncorrectPassword)
    });

    host.inner.close_lobby().unwrap();
    // Let the close land before the next join attempt.
    thread::sleep(Duration::from_millis(100));
    joiner.inner.join_lobby("private", "sesame").unwrap();
    joiner.wait_for("closed refusal", |e| {
        matches!(e, SyncEvent::LobbyJoinFailed { error, .. }
            if *error == LobbyJoinError::Closed)
    });

    handle.stop();
}

/// Two clients with the same username cannot share a lobby.
#[test]
fn duplicate_username_cannot_join() {
    let (handle, addr) = default_server();

    let mut first = TestClient::connect(addr, "Robin");
    first
        .inner
        .create_lobby("arena", CreateLobbyOptions::default())
        .unwrap();
    first.wait_for("lobby joined", |e| matches!(e, SyncEvent::LobbyJoined(_)));

    let mut second = TestClient::connect(addr, "Robin");
    second.inner.join_lobby("arena", "").unwrap();
    second.wait_for("duplicate refusal", |e| {
        matches!(e, SyncEvent::LobbyJoinFailed { error, .. }
            if *error == LobbyJoinError::DuplicateUsername)
    });

    handle.stop();
}

/// Player data fans out to the lobby; writes past the cap are refused with
/// an out-of-band critical error and do not replicate.
#[test]
fn player_data_fans_out_and_cap_is_enforced() {
    let (handle, addr) = start_test_server(ServerConfig {
        caps: Caps {
            player_data_bytes: 64,
            ..Caps::default()
        },
        ..ServerConfig::default()
    });
    let (mut host, mut joiner) = lobby_pair(addr, "arena");

    host.inner.set_player_data("team", json!("red")).unwrap();
    joiner.wait_for("player data fan-out", |e| {
        matches!(e, SyncEvent::PlayerDataChanged { client, key, value }
            if *client == host.inner.client_id()
                && key == "team"
                && *value == Some(json!("red")))
    });
    assert_eq!(
        joiner
            .inner
            .get_player_data(host.inner.client_id(), "team"),
        Some(&json!("red"))
    );

    host.inner
        .set_player_data("bio", json!("x".repeat(200)))
        .unwrap();
    host.wait_for("cap violation", |e| {
        matches!(
            e,
            SyncEvent::CriticalError(CriticalError::PlayerDataFull)
        )
    });

    joiner.pump_for(Duration::from_millis(200));
    assert!(
        !joiner.drain().iter().any(
            |e| matches!(e, SyncEvent::PlayerDataChanged { key, .. } if key == "bio")
        ),
        "over-cap write must not replicate"
    );

    handle.stop();
}

/// Lobby data and tag changes replicate to every member, sender included.
#[test]
fn lobby_data_replicates_to_all_members() {
    let (handle, addr) = default_server();
    let (mut host, mut joiner) = lobby_pair(addr, "arena");

    host.inner.set_lobby_data("map", json!("canyon")).unwrap();
    for client in [&mut host, &mut joiner] {
        client.wait_for("lobby data", |e| {
            matches!(e, SyncEvent::LobbyDataChanged { key, value }
                if key == "map" && *value == Some(json!("canyon")))
        });
        assert_eq!(client.inner.get_lobby_data("map"), Some(&json!("canyon")));
    }

    host.inner.erase_lobby_data("map").unwrap();
    joiner.wait_for("lobby data erased", |e| {
        matches!(e, SyncEvent::LobbyDataChanged { key, value: None } if key == "map")
    });

    handle.stop();
}
