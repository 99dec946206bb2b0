//! Relay behaviour over the in-memory transport

use backhaul_proto::{codec, PeerId, TunnelMessage};
use backhaul_relay::{PeerState, RelayServer, RelayState};
use backhaul_transport::memory::MemoryNetwork;
use backhaul_transport::{Connection, TransportConnector};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    network: MemoryNetwork,
    state: RelayState,
}

impl Harness {
    fn start() -> Self {
        let network = MemoryNetwork::new();
        let listener = network.listen("relay");
        let server = RelayServer::new(listener);
        let state = server.state().clone();
        tokio::spawn(server.run());
        Self { network, state }
    }

    async fn connect(&self) -> Connection {
        self.network.connector().connect("relay").await.unwrap()
    }

    async fn connect_agent(&self) -> Connection {
        let agent = self.connect().await;
        agent
            .sender
            .send_message(&TunnelMessage::Identify)
            .await
            .unwrap();

        let routing = self.state.routing.clone();
        wait_for(|| {
            let routing = routing.clone();
            async move { routing.has_agent().await.then_some(()) }
        })
        .await;
        agent
    }

    /// Connect a peer and complete its handshake with `agent`
    async fn connect_peer(&self, agent: &mut Connection) -> (Connection, PeerId) {
        let peer = self.connect().await;
        let id = match next_message(agent).await {
            TunnelMessage::NewConnection { id } => id,
            other => panic!("Expected new_connection, got {:?}", other),
        };
        agent
            .sender
            .send_message(&TunnelMessage::AcknowledgeNewConnection { id: id.clone() })
            .await
            .unwrap();

        let routing = self.state.routing.clone();
        let established = id.clone();
        wait_for(|| {
            let routing = routing.clone();
            let id = established.clone();
            async move { (routing.peer_state(&id) == Some(PeerState::Established)).then_some(()) }
        })
        .await;

        (peer, id)
    }
}

async fn wait_for<F, Fut, T>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    timeout(WAIT, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn next_text(connection: &mut Connection) -> String {
    timeout(WAIT, connection.receiver.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("transport error")
        .expect("connection closed")
}

async fn next_message(connection: &mut Connection) -> TunnelMessage {
    codec::decode(&next_text(connection).await).unwrap()
}

async fn assert_silent(connection: &mut Connection) {
    let result = timeout(Duration::from_millis(100), connection.receiver.recv()).await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

#[tokio::test]
async fn test_peer_traffic_round_trip() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;
    let (mut peer, id) = relay.connect_peer(&mut agent).await;

    assert!(!relay.state.pending.contains(&id));

    peer.sender.send(r#"{"ping":1}"#).await.unwrap();
    assert_eq!(
        next_message(&mut agent).await,
        TunnelMessage::Data {
            id: id.clone(),
            data: json!({"ping": 1})
        }
    );

    agent
        .sender
        .send_message(&TunnelMessage::Return {
            id: id.clone(),
            data: json!({"pong": 1}),
        })
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&next_text(&mut peer).await).unwrap();
    assert_eq!(reply, json!({"pong": 1}));

    // String payloads reach the peer as raw text
    agent
        .sender
        .send_message(&TunnelMessage::Return {
            id,
            data: json!("plain text"),
        })
        .await
        .unwrap();
    assert_eq!(next_text(&mut peer).await, "plain text");
}

#[tokio::test]
async fn test_frames_sent_during_handshake_wait_for_ack() {
    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;

    let peer = relay.connect().await;
    let id = match next_message(&mut agent).await {
        TunnelMessage::NewConnection { id } => id,
        other => panic!("Expected new_connection, got {:?}", other),
    };
    assert!(relay.state.pending.contains(&id));

    peer.sender.send(r#"{"seq":1}"#).await.unwrap();
    peer.sender.send(r#"{"seq":2}"#).await.unwrap();
    assert_silent(&mut agent).await;
    assert_eq!(relay.state.routing.peer_state(&id), Some(PeerState::Handshaking));

    agent
        .sender
        .send_message(&TunnelMessage::AcknowledgeNewConnection { id: id.clone() })
        .await
        .unwrap();

    for seq in 1..=2 {
        assert_eq!(
            next_message(&mut agent).await,
            TunnelMessage::Data {
                id: id.clone(),
                data: json!({ "seq": seq })
            }
        );
    }
    assert_eq!(relay.state.pending.count(), 0);
}

#[tokio::test]
async fn test_peer_without_agent_stays_open() {
    let relay = Harness::start();

    let mut peer = relay.connect().await;
    peer.sender.send(r#"{"ping":1}"#).await.unwrap();

    let routing = relay.state.routing.clone();
    wait_for(|| {
        let routing = routing.clone();
        async move { (routing.peer_count() == 1).then_some(()) }
    })
    .await;

    assert!(!relay.state.routing.has_agent().await);
    assert_eq!(relay.state.pending.count(), 0);
    assert_silent(&mut peer).await;
    assert!(!peer.sender.is_closed());
}

#[tokio::test]
async fn test_peer_disconnect_during_handshake() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;

    let peer = relay.connect().await;
    let id = match next_message(&mut agent).await {
        TunnelMessage::NewConnection { id } => id,
        other => panic!("Expected new_connection, got {:?}", other),
    };

    // The agent never acknowledges, as when its backend dial fails
    peer.sender.close().await;

    assert_eq!(
        next_message(&mut agent).await,
        TunnelMessage::DelConnection { id: id.clone() }
    );
    assert!(!relay.state.pending.contains(&id));
    assert!(!relay.state.routing.contains_peer(&id));
}

#[tokio::test]
async fn test_peer_disconnect_notifies_agent_once() {
    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;
    let (peer, id) = relay.connect_peer(&mut agent).await;

    peer.sender.close().await;

    assert_eq!(
        next_message(&mut agent).await,
        TunnelMessage::DelConnection { id: id.clone() }
    );
    assert_silent(&mut agent).await;
    assert_eq!(relay.state.routing.peer_count(), 0);
}

#[tokio::test]
async fn test_agent_disconnect_clears_slot() {
    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;
    let (mut peer, _id) = relay.connect_peer(&mut agent).await;

    agent.sender.close().await;

    let routing = relay.state.routing.clone();
    wait_for(|| {
        let routing = routing.clone();
        async move { (!routing.has_agent().await).then_some(()) }
    })
    .await;

    // The peer stays connected; its traffic is dropped
    peer.sender.send(r#"{"ping":2}"#).await.unwrap();
    assert_silent(&mut peer).await;
    assert_eq!(relay.state.routing.peer_count(), 1);
}

#[tokio::test]
async fn test_second_identify_replaces_agent() {
    let relay = Harness::start();
    let mut first = relay.connect_agent().await;
    let first_id = relay.state.routing.agent_id().await.unwrap();

    let mut second = relay.connect().await;
    // The first agent is told about the newcomer before it identifies
    let announced = match next_message(&mut first).await {
        TunnelMessage::NewConnection { id } => id,
        other => panic!("Expected new_connection, got {:?}", other),
    };
    second
        .sender
        .send_message(&TunnelMessage::Identify)
        .await
        .unwrap();

    // ...and told to drop it once it turns out to be an agent
    assert_eq!(
        next_message(&mut first).await,
        TunnelMessage::DelConnection {
            id: announced.clone()
        }
    );

    let routing = relay.state.routing.clone();
    let previous = first_id.clone();
    let second_id = wait_for(|| {
        let routing = routing.clone();
        let previous = previous.clone();
        async move { routing.agent_id().await.filter(|id| id != &previous) }
    })
    .await;
    assert_eq!(second_id, announced);

    // Closing the replaced agent leaves the new one attached
    first.sender.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.state.routing.agent_id().await, Some(second_id));

    // New peers are announced to the second agent
    let _peer = relay.connect().await;
    assert!(matches!(
        next_message(&mut second).await,
        TunnelMessage::NewConnection { .. }
    ));
}

#[tokio::test]
async fn test_bad_agent_frames_are_dropped() {
    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;

    agent.sender.send("not json").await.unwrap();
    agent.sender.send(r#"{"body":"return"}"#).await.unwrap();
    agent
        .sender
        .send_message(&TunnelMessage::Return {
            id: PeerId::from("gone"),
            data: json!("late"),
        })
        .await
        .unwrap();
    agent
        .sender
        .send_message(&TunnelMessage::AcknowledgeNewConnection {
            id: PeerId::from("never-announced"),
        })
        .await
        .unwrap();
    // Untagged payload from the agent is not echoed back to it
    agent.sender.send(r#"{"ping":1}"#).await.unwrap();
    assert_silent(&mut agent).await;

    // The agent connection still works
    let (mut peer, id) = relay.connect_peer(&mut agent).await;
    agent
        .sender
        .send_message(&TunnelMessage::Return {
            id,
            data: json!("still here"),
        })
        .await
        .unwrap();
    assert_eq!(next_text(&mut peer).await, "still here");
}

#[tokio::test]
async fn test_opaque_tags_from_peer_are_wrapped() {
    let relay = Harness::start();
    let mut agent = relay.connect_agent().await;
    let (peer, id) = relay.connect_peer(&mut agent).await;

    let spoofed = json!({"body": "del_connection", "id": "someone-else"});
    peer.sender.send(spoofed.to_string()).await.unwrap();

    assert_eq!(
        next_message(&mut agent).await,
        TunnelMessage::Data { id, data: spoofed }
    );
    assert_eq!(relay.state.routing.peer_count(), 1);
}
