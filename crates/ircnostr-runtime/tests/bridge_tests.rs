//! End-to-end tests of the bridging engine against mock collaborators

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::time::timeout;

use ircnostr_core::events::{chat_event, profile_event, sign, EPHEMERAL_CHAT_KIND};
use ircnostr_core::{
    AppConfig, BridgeDefinition, BridgeEntry, ConnectionKey, IrcSettings, NostrSettings,
    RuntimeConfig, SHUTDOWN_REASON,
};
use ircnostr_harness::{wait_until, ChatCommand, MockChatClient, MockProfileLookup, MockRelay, MockRelayPool};
use ircnostr_runtime::{BridgeServices, ConnectionMultiplexer, Orchestrator, SessionManager};

const RELAY: &str = "wss://relay.test";
const SERVER: &str = "irc.test";

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

async fn within<F: Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

fn connection_key(nick: &str) -> ConnectionKey {
    ConnectionKey::new(SERVER, nick, true, 6697)
}

fn definition(nick: &str, channel: &str, topic: &str, keys: &Keys) -> BridgeDefinition {
    BridgeDefinition {
        irc: IrcSettings {
            server: SERVER.to_string(),
            port: 6697,
            secure: true,
            nick: nick.to_string(),
            channel: channel.to_string(),
        },
        nostr: NostrSettings {
            nsec: keys.secret_key().unwrap().to_bech32().unwrap(),
            relay: RELAY.to_string(),
            channel: topic.to_string(),
            profile: None,
        },
    }
}

fn runtime() -> RuntimeConfig {
    RuntimeConfig {
        connect_attempts: 3,
        connect_retry_delay_secs: 0,
        subscription_retry_secs: 0,
        restart_delay_secs: 0,
        ..RuntimeConfig::default()
    }
}

struct TestBed {
    chat: Arc<MockChatClient>,
    relays: Arc<MockRelayPool>,
    lookup: Arc<MockProfileLookup>,
    runtime: RuntimeConfig,
}

impl TestBed {
    fn new() -> Self {
        Self {
            chat: Arc::new(MockChatClient::new()),
            relays: Arc::new(MockRelayPool::new()),
            lookup: Arc::new(MockProfileLookup::new()),
            runtime: runtime(),
        }
    }

    fn relay(&self) -> Arc<MockRelay> {
        self.relays.get(RELAY)
    }

    fn start(&self, bridges: Vec<BridgeDefinition>) -> (Orchestrator, usize) {
        self.start_entries(bridges.into_iter().map(BridgeEntry::from).collect())
    }

    fn start_entries(&self, bridges: Vec<BridgeEntry>) -> (Orchestrator, usize) {
        let config = AppConfig {
            lookup_relays: vec!["wss://lookup.test".to_string()],
            runtime: self.runtime.clone(),
            bridges,
        };
        let services = BridgeServices::new(
            self.chat.clone(),
            self.relays.clone(),
            self.lookup.clone(),
            &config,
        );
        let mut orchestrator = Orchestrator::new(services);
        let started = orchestrator.start(&config.bridges);
        (orchestrator, started)
    }
}

fn contents(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.content.clone()).collect()
}

// ----------------------------------------------------------------------------
// Shared Connections and Sessions
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_acquisitions_open_one_connection() {
    let chat = Arc::new(MockChatClient::new().with_connect_delay(Duration::from_millis(10)));
    let multiplexer = ConnectionMultiplexer::new(chat.clone(), 3, Duration::from_millis(1));

    let leases: Vec<_> = (0..10)
        .map(|_| multiplexer.acquire(connection_key("bridge")))
        .collect();
    let mut connections = Vec::new();
    for lease in &leases {
        connections.push(within(lease.ready()).await.unwrap());
    }

    assert_eq!(chat.connects(), 1);
    assert_eq!(multiplexer.active_connections(), 1);
    assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
}

#[tokio::test]
async fn test_connection_closes_after_last_release() {
    let chat = Arc::new(MockChatClient::new());
    let multiplexer = ConnectionMultiplexer::new(chat.clone(), 3, Duration::from_millis(1));

    let first = multiplexer.acquire(connection_key("bridge"));
    let second = multiplexer.acquire(connection_key("bridge"));
    within(first.ready()).await.unwrap();
    let connection = chat.latest().unwrap();

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(connection.is_open());

    drop(second);
    within(chat.wait_for_idle()).await;
    assert_eq!(
        connection.commands().last(),
        Some(&ChatCommand::Quit(SHUTDOWN_REASON.to_string()))
    );
    within(wait_until(|| multiplexer.is_idle())).await;
}

#[tokio::test]
async fn test_reacquire_never_overlaps_teardown() {
    let chat = Arc::new(MockChatClient::new().with_connect_delay(Duration::from_millis(2)));
    let multiplexer = ConnectionMultiplexer::new(chat.clone(), 3, Duration::from_millis(1));

    for _ in 0..5 {
        let lease = multiplexer.acquire(connection_key("bridge"));
        within(lease.ready()).await.unwrap();
        drop(lease);
    }
    let last = multiplexer.acquire(connection_key("bridge"));
    within(last.ready()).await.unwrap();

    assert_eq!(chat.max_live(), 1);
    assert_eq!(chat.live(), 1);
}

#[tokio::test]
async fn test_failed_connection_reaches_every_holder() {
    let chat = Arc::new(MockChatClient::new());
    chat.fail_next_connects(3);
    let multiplexer = ConnectionMultiplexer::new(chat.clone(), 3, Duration::from_millis(1));

    let first = multiplexer.acquire(connection_key("bridge"));
    let second = multiplexer.acquire(connection_key("bridge"));
    assert!(within(first.ready()).await.is_err());
    assert!(within(second.ready()).await.is_err());
    assert_eq!(chat.connects(), 3);

    drop(first);
    drop(second);
    within(wait_until(|| multiplexer.is_idle())).await;

    let fresh = multiplexer.acquire(connection_key("bridge"));
    assert!(within(fresh.ready()).await.is_ok());
    assert_eq!(chat.connects(), 4);
}

#[tokio::test]
async fn test_sessions_part_before_quit() {
    let chat = Arc::new(MockChatClient::new());
    let sessions = SessionManager::new(ConnectionMultiplexer::new(
        chat.clone(),
        3,
        Duration::from_millis(1),
    ));

    let a1 = sessions.join(connection_key("bridge"), "#a");
    let a2 = sessions.join(connection_key("bridge"), "#a");
    let b = sessions.join(connection_key("bridge"), "#b");
    for lease in [&a1, &a2, &b] {
        within(lease.ready()).await.unwrap();
    }

    let connection = chat.latest().unwrap();
    let joins_a = connection
        .commands()
        .iter()
        .filter(|c| **c == ChatCommand::Join("#a".to_string()))
        .count();
    assert_eq!(joins_a, 1);
    assert_eq!(chat.connects(), 1);

    drop(a1);
    drop(a2);
    let part_a = ChatCommand::Part {
        channel: "#a".to_string(),
        reason: SHUTDOWN_REASON.to_string(),
    };
    within(connection.wait_for_commands(|c| c.contains(&part_a))).await;
    assert!(connection.is_open());

    drop(b);
    within(wait_until(|| sessions.is_idle())).await;

    let commands = connection.commands();
    let part_b = commands
        .iter()
        .position(|c| matches!(c, ChatCommand::Part { channel, .. } if channel == "#b"))
        .unwrap();
    let quit = commands
        .iter()
        .position(|c| matches!(c, ChatCommand::Quit(_)))
        .unwrap();
    assert!(part_b < quit);
    assert!(!connection.is_open());
}

#[tokio::test]
async fn test_session_rejoins_after_reconnect() {
    let chat = Arc::new(MockChatClient::new());
    let sessions = SessionManager::new(ConnectionMultiplexer::new(
        chat.clone(),
        3,
        Duration::from_millis(1),
    ));

    let session = sessions.join(connection_key("bridge"), "#a");
    within(session.ready()).await.unwrap();
    chat.latest().unwrap().drop_link();

    within(chat.wait_for_connections(2)).await;
    let second = chat.connections()[1].clone();
    within(second.wait_for_join("#a")).await;
    within(wait_until(|| session.current().is_ready())).await;
    assert_eq!(chat.max_live(), 1);
}

// ----------------------------------------------------------------------------
// Forwarding
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_nostr_event_reaches_irc_with_display_name() {
    let bed = TestBed::new();
    let bridge = Keys::generate();
    let alice = Keys::generate();
    bed.lookup
        .add_profile(sign(profile_event(&Metadata::new().name("Alice")), &alice).unwrap());

    let (_orchestrator, started) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    assert_eq!(started, 1);

    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    within(connection.wait_for_join("#test")).await;
    let relay = bed.relay();
    within(relay.wait_for_subscribers(1)).await;

    relay
        .deliver(sign(chat_event("test-topic", "hello"), &alice).unwrap())
        .await;
    within(connection.wait_for_said("#test", 1)).await;

    assert_eq!(connection.said("#test"), vec!["Alice: hello".to_string()]);
}

#[tokio::test]
async fn test_unknown_author_is_anonymous() {
    let bed = TestBed::new();
    let bridge = Keys::generate();
    let stranger = Keys::generate();

    let (_orchestrator, _) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    let relay = bed.relay();
    within(relay.wait_for_subscribers(1)).await;

    relay
        .deliver(sign(chat_event("test-topic", "hey"), &stranger).unwrap())
        .await;
    within(connection.wait_for_said("#test", 1)).await;

    assert_eq!(connection.said("#test"), vec!["anon: hey".to_string()]);
    assert_eq!(
        bed.lookup.last_relays(),
        vec!["wss://lookup.test".to_string(), RELAY.to_string()]
    );
}

#[tokio::test]
async fn test_irc_message_is_published() {
    let bed = TestBed::new();
    let bridge = Keys::generate();

    let (_orchestrator, _) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    within(wait_until(|| connection.inject("#test", "bob", "hi") > 0)).await;

    let relay = bed.relay();
    within(relay.wait_for_published(2)).await;
    let published = relay.published();
    assert_eq!(
        published[0].content,
        format!("Started bridge to ircs://{}:6697/#test", SERVER)
    );

    let event = &published[1];
    assert_eq!(event.content, "bob: hi");
    assert_eq!(event.kind, EPHEMERAL_CHAT_KIND);
    assert_eq!(event.identifier(), Some("test-topic"));
    assert_eq!(event.pubkey, bridge.public_key());
    assert!(event.verify().is_ok());
}

#[tokio::test]
async fn test_own_messages_are_not_echoed() {
    let bed = TestBed::new();
    let bridge = Keys::generate();
    let alice = Keys::generate();

    let (_orchestrator, _) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    let relay = bed.relay();
    within(relay.wait_for_subscribers(1)).await;

    // IRC lines from the bridge nick, or a nick derived from it
    within(wait_until(|| connection.inject("#test", "bridge", "loop") > 0)).await;
    connection.inject("#test", "bridge_", "loop");
    connection.inject("#test", "carol", "after");
    within(wait_until(|| {
        contents(&relay.published()).contains(&"carol: after".to_string())
    }))
    .await;
    assert!(!contents(&relay.published()).iter().any(|c| c.starts_with("bridge")));

    // Nostr events signed with the bridge key
    relay
        .deliver(sign(chat_event("test-topic", "echo"), &bridge).unwrap())
        .await;
    relay
        .deliver(sign(chat_event("test-topic", "real"), &alice).unwrap())
        .await;
    within(connection.wait_for_said("#test", 1)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the published "carol: after" came back through the relay as well
    assert_eq!(connection.said("#test"), vec!["anon: real".to_string()]);
}

#[tokio::test]
async fn test_irc_messages_are_published_in_order() {
    let bed = TestBed::new();
    let relay = bed
        .relays
        .insert(MockRelay::new(RELAY).with_publish_delay(Duration::from_millis(20)));
    let bridge = Keys::generate();

    let (_orchestrator, _) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();

    within(wait_until(|| connection.inject("#test", "bob", "M1") > 0)).await;
    connection.inject("#test", "bob", "M2");
    connection.inject("#test", "bob", "M3");
    within(relay.wait_for_published(4)).await;

    let relayed: Vec<String> = contents(&relay.published())
        .into_iter()
        .filter(|c| c.starts_with("bob: "))
        .collect();
    assert_eq!(relayed, vec!["bob: M1", "bob: M2", "bob: M3"]);
    assert_eq!(relay.max_in_flight(), 1);
}

#[tokio::test]
async fn test_publish_failure_drops_only_that_message() {
    let bed = TestBed::new();
    let bridge = Keys::generate();

    let (_orchestrator, _) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    let relay = bed.relay();
    within(relay.wait_for_published(1)).await;

    relay.fail_publishes(true);
    within(wait_until(|| connection.inject("#test", "bob", "lost") > 0)).await;
    within(wait_until(|| relay.publish_calls() >= 2)).await;
    relay.fail_publishes(false);

    connection.inject("#test", "bob", "kept");
    within(relay.wait_for_published(2)).await;

    let relayed = contents(&relay.published());
    assert!(relayed.contains(&"bob: kept".to_string()));
    assert!(!relayed.contains(&"bob: lost".to_string()));
}

#[tokio::test]
async fn test_profile_is_announced_before_channel_marker() {
    let bed = TestBed::new();
    let bridge = Keys::generate();
    let mut definition = definition("bridge", "#test", "test-topic", &bridge);
    definition.nostr.profile = Some(Metadata::new().name("irc-bridge"));

    let (orchestrator, _) = bed.start(vec![definition]);
    let relay = bed.relay();
    within(wait_until(|| {
        contents(&relay.published()).contains(&"Starting IRC bridge".to_string())
    }))
    .await;

    let published = relay.published();
    let profile = published.iter().position(|e| e.kind == Kind::Metadata).unwrap();
    let marker = published
        .iter()
        .position(|e| e.content == "Starting IRC bridge")
        .unwrap();
    assert!(profile < marker);
    assert!(orchestrator
        .services()
        .resolver
        .store()
        .has(&bridge.public_key()));
}

#[tokio::test]
async fn test_bridge_announces_again_after_reconnect() {
    let bed = TestBed::new();
    let bridge = Keys::generate();

    let (_orchestrator, _) = bed.start(vec![definition("bridge", "#test", "test-topic", &bridge)]);
    let relay = bed.relay();
    within(relay.wait_for_published(1)).await;

    bed.chat.latest().unwrap().drop_link();
    within(bed.chat.wait_for_connections(2)).await;
    within(relay.wait_for_published(2)).await;

    let second = bed.chat.connections()[1].clone();
    within(wait_until(|| second.inject("#test", "bob", "back") > 0)).await;
    within(wait_until(|| contents(&relay.published()).contains(&"bob: back".to_string()))).await;

    let announcements = contents(&relay.published())
        .iter()
        .filter(|c| c.starts_with("Started bridge to"))
        .count();
    assert_eq!(announcements, 2);
}

// ----------------------------------------------------------------------------
// Orchestration
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_bridges_share_one_connection() {
    let bed = TestBed::new();
    let (_orchestrator, started) = bed.start(vec![
        definition("bridge", "#one", "one", &Keys::generate()),
        definition("bridge", "#two", "two", &Keys::generate()),
    ]);
    assert_eq!(started, 2);

    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    within(connection.wait_for_join("#one")).await;
    within(connection.wait_for_join("#two")).await;
    assert_eq!(bed.chat.connects(), 1);
}

#[tokio::test]
async fn test_malformed_key_only_stops_that_bridge() {
    let bed = TestBed::new();
    let mut broken = definition("broken", "#broken", "broken", &Keys::generate());
    broken.nostr.nsec = "nsec1notakey".to_string();

    let (orchestrator, started) = bed.start(vec![
        broken,
        definition("bridge", "#test", "test-topic", &Keys::generate()),
    ]);
    assert_eq!(started, 1);
    assert_eq!(orchestrator.running(), 1);

    within(bed.chat.wait_for_connections(1)).await;
    assert_eq!(bed.chat.latest().unwrap().key(), &connection_key("bridge"));
}

#[tokio::test]
async fn test_incomplete_entry_only_stops_that_bridge() {
    let bed = TestBed::new();
    let nsec = Keys::generate().secret_key().unwrap().to_bech32().unwrap();
    let bridge = |nick_line: &str, channel: &str| {
        format!(
            "[[bridges]]\n[bridges.irc]\nserver = \"{}\"\nport = 6697\nsecure = true\n{}channel = \"{}\"\n\
             [bridges.nostr]\nnsec = \"{}\"\nrelay = \"{}\"\nchannel = \"test-topic\"\n",
            SERVER, nick_line, channel, nsec, RELAY
        )
    };
    let raw = format!("{}{}", bridge("", "#broken"), bridge("nick = \"bridge\"\n", "#test"));
    let config = AppConfig::from_toml(&raw).unwrap();
    assert!(!config.bridges[0].is_valid());

    let (orchestrator, started) = bed.start_entries(config.bridges);
    assert_eq!(started, 1);
    assert_eq!(orchestrator.running(), 1);

    within(bed.chat.wait_for_connections(1)).await;
    let connection = bed.chat.latest().unwrap();
    assert_eq!(connection.key(), &connection_key("bridge"));
    within(connection.wait_for_join("#test")).await;
}

#[tokio::test]
async fn test_failed_bridge_restarts_without_affecting_siblings() {
    let bed = TestBed::new();
    bed.chat.reject_join("#banned");
    let healthy_keys = Keys::generate();
    let alice = Keys::generate();

    let mut healthy_definition = definition("bridge", "#test", "test-topic", &healthy_keys);
    healthy_definition.nostr.relay = "wss://other.test".to_string();

    let (_orchestrator, _) = bed.start(vec![
        definition("banned", "#banned", "banned", &Keys::generate()),
        healthy_definition,
    ]);

    // the rejected bridge keeps coming back on fresh connections
    within(wait_until(|| {
        bed.chat
            .connections()
            .iter()
            .filter(|c| c.key() == &connection_key("banned"))
            .count()
            >= 3
    }))
    .await;

    let healthy = bed
        .chat
        .connections()
        .into_iter()
        .find(|c| c.key() == &connection_key("bridge"))
        .unwrap();
    assert!(healthy.is_open());

    let relay = bed.relays.get("wss://other.test");
    within(relay.wait_for_subscribers(1)).await;
    relay
        .deliver(sign(chat_event("test-topic", "still here"), &alice).unwrap())
        .await;
    within(healthy.wait_for_said("#test", 1)).await;
}

#[tokio::test]
async fn test_shutdown_parts_and_quits_every_bridge() {
    let bed = TestBed::new();
    let (mut orchestrator, _) = bed.start(vec![
        definition("bridge-a", "#one", "one", &Keys::generate()),
        definition("bridge-b", "#two", "two", &Keys::generate()),
    ]);

    within(bed.chat.wait_for_connections(2)).await;
    let connections = bed.chat.connections();
    for connection in &connections {
        let channel = if connection.key().nick == "bridge-a" { "#one" } else { "#two" };
        within(connection.wait_for_join(channel)).await;
    }

    let drained = within(orchestrator.shutdown(Duration::from_secs(5))).await;
    assert!(drained);
    assert_eq!(bed.chat.live(), 0);

    for connection in &connections {
        let commands = connection.commands();
        let part = commands
            .iter()
            .position(|c| matches!(c, ChatCommand::Part { reason, .. } if reason == SHUTDOWN_REASON))
            .unwrap();
        let quit = commands
            .iter()
            .position(|c| *c == ChatCommand::Quit(SHUTDOWN_REASON.to_string()))
            .unwrap();
        assert!(part < quit);
    }
}
