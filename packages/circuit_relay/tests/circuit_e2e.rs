//! End-to-end circuits over the in-memory network: dialer -> relay -> destination.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use circuit_relay::{
    CircuitAddr, ConnectionRegistry, DialError, ErrorClass, MemoryNetwork, MemoryNode, PeerId,
    RelayConfig, RelayLimits, RelayPolicy, RelayService, StatusCode,
};

struct Node {
    node: Arc<MemoryNode>,
    service: Arc<RelayService<MemoryNode>>,
}

impl Node {
    fn peer(&self) -> &PeerId {
        self.node.local_peer()
    }
}

fn config(policy: RelayPolicy) -> RelayConfig {
    RelayConfig {
        policy,
        limits: RelayLimits {
            max_circuits: 8,
            buffer_size: 4096,
            dial_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            linger: Duration::from_millis(200),
        },
        ..RelayConfig::default()
    }
}

fn start(net: &MemoryNetwork, id: &str, config: RelayConfig) -> Node {
    let node = net.add_node(PeerId::parse(id).unwrap());
    let service = Arc::new(RelayService::new(node.clone(), config));
    service.spawn(node.take_incoming().unwrap());
    Node { node, service }
}

/// Client, relay and destination with the given relay policy.
fn triangle(relay_config: RelayConfig) -> (MemoryNetwork, Node, Node, Node) {
    let net = MemoryNetwork::new();
    let client = start(&net, "QmSrcPeer", config(RelayPolicy::client()));
    let relay = start(&net, "QmRe1ayPeer", relay_config);
    let dest = start(&net, "QmDestPeer", config(RelayPolicy::client()));
    (net, client, relay, dest)
}

fn via(relay: &Node, dest: &PeerId) -> CircuitAddr {
    let relay_addr = relay.node.addr().with_peer(relay.peer());
    format!("{relay_addr}/p2p-circuit/ipfs/{dest}")
        .parse()
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn relays_random_bytes_end_to_end() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::relay(true)));

    let mut stream = client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    let mut conn = dest.service.accept().await.unwrap();
    assert_eq!(&conn.source, client.peer());
    assert_eq!(&conn.relay, relay.peer());

    let payload: Vec<u8> = (0..128).map(|_| rand::random::<u8>()).collect();
    stream.write_all(&payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    conn.stream.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);

    // and back
    conn.stream.write_all(b"ack").await.unwrap();
    let mut ack = [0u8; 3];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(&ack, b"ack");

    let circuits = relay.service.relay().active_circuits();
    assert_eq!(circuits.len(), 1);
    assert_eq!(&circuits[0].source, client.peer());
    assert_eq!(&circuits[0].destination, dest.peer());
}

#[tokio::test]
async fn disabled_client_issues_no_io() {
    let net = MemoryNetwork::new();
    let client = start(&net, "QmSrcPeer", config(RelayPolicy::default()));
    let relay = start(&net, "QmRe1ayPeer", config(RelayPolicy::relay(true)));

    let err = client
        .service
        .dial(&via(&relay, &PeerId::parse("QmDestPeer").unwrap()))
        .await
        .unwrap_err();
    assert!(matches!(err, DialError::RelayDisabled));
    assert_eq!(client.node.dial_count(), 0);
    assert_eq!(client.node.stream_count(), 0);
}

#[tokio::test]
async fn hop_disabled_relay_never_dials() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::client()));

    let err = client
        .service
        .dial(&via(&relay, dest.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopCantSpeakRelay));
    assert_eq!(err.class(), ErrorClass::Policy);
    assert_eq!(relay.node.dial_count(), 0);
    assert_eq!(relay.node.stream_count(), 0);
}

#[tokio::test]
async fn passive_relay_consults_allow_list() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::relay(false)));

    let err = client
        .service
        .dial(&via(&relay, dest.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopCantSpeakRelay));
    assert_eq!(relay.node.dial_count(), 0);

    // allowed, but a passive relay never dials out
    relay.node.allow(client.peer());
    let err = client
        .service
        .dial(&via(&relay, dest.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopNoConnToDst));
    assert_eq!(relay.node.dial_count(), 0);

    // once the destination is connected the circuit opens
    dest.node
        .dial(circuit_relay::DialTarget::Peer(relay.peer()))
        .await
        .unwrap();
    let mut stream = client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    let mut conn = dest.service.accept().await.unwrap();
    stream.write_all(b"passive").await.unwrap();
    let mut buf = [0u8; 7];
    conn.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"passive");
    assert_eq!(relay.node.dial_count(), 0);
}

#[tokio::test]
async fn active_relay_dials_unallowed_source() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::relay(true)));

    assert!(!relay.node.is_allowed(client.peer()));
    client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    assert_eq!(relay.node.dial_count(), 1);
    assert!(relay.node.is_connected_to(dest.peer()));
}

#[tokio::test]
async fn self_relay_rejected() {
    let (_net, client, relay, _dest) = triangle(config(RelayPolicy::relay(true)));

    let err = client
        .service
        .dial(&via(&relay, relay.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopCantRelayToSelf));
    assert_eq!(relay.node.dial_count(), 0);
}

#[tokio::test]
async fn unreachable_destination_is_reachability_error() {
    let (net, client, relay, dest) = triangle(config(RelayPolicy::relay(true)));
    net.set_unreachable(dest.peer(), true);

    let err = client
        .service
        .dial(&via(&relay, dest.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopCantDialDst));
    assert_eq!(err.class(), ErrorClass::Reachability);
    assert_eq!(relay.service.relay().circuit_count(), 0);
}

#[tokio::test]
async fn destination_refusing_relayed_connections() {
    let net = MemoryNetwork::new();
    let client = start(&net, "QmSrcPeer", config(RelayPolicy::client()));
    let relay = start(&net, "QmRe1ayPeer", config(RelayPolicy::relay(true)));
    let dest = start(&net, "QmDestPeer", config(RelayPolicy::default()));

    let err = client
        .service
        .dial(&via(&relay, dest.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopCantSpeakRelay));
}

#[tokio::test]
async fn destination_close_tears_down_circuit() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::relay(true)));

    let mut stream = client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    let mut conn = dest.service.accept().await.unwrap();
    stream.write_all(b"partial").await.unwrap();
    let mut buf = [0u8; 7];
    conn.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(relay.service.relay().circuit_count(), 1);

    drop(conn);

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut rest))
        .await
        .expect("source should observe close within linger");
    assert_eq!(read.unwrap_or(0), 0);

    wait_until(|| relay.service.relay().circuit_count() == 0).await;
}

#[tokio::test]
async fn concurrency_limit_rejects_then_recovers() {
    let mut relay_config = config(RelayPolicy::relay(true));
    relay_config.limits.max_circuits = 1;
    let (_net, client, relay, dest) = triangle(relay_config);

    let first = client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    let first_conn = dest.service.accept().await.unwrap();
    let dials = relay.node.dial_count();
    let streams = relay.node.stream_count();

    let err = client
        .service
        .dial(&via(&relay, dest.peer()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StatusCode::HopResourceLimitExceeded));
    assert_eq!(relay.node.dial_count(), dials);
    assert_eq!(relay.node.stream_count(), streams);

    drop(first);
    drop(first_conn);
    wait_until(|| relay.service.relay().circuit_count() == 0).await;

    let mut again = client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    let mut conn = dest.service.accept().await.unwrap();
    again.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    conn.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn relay_shutdown_closes_both_legs() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::relay(true)));

    let mut stream = client.service.dial(&via(&relay, dest.peer())).await.unwrap();
    let mut conn = dest.service.accept().await.unwrap();

    relay.service.shutdown();

    let mut buf = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    let n = tokio::time::timeout(Duration::from_secs(1), conn.stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    wait_until(|| relay.service.relay().circuit_count() == 0).await;
}

#[tokio::test]
async fn relay_less_address_uses_probed_relay() {
    let (_net, client, relay, dest) = triangle(config(RelayPolicy::relay(true)));
    let addr: CircuitAddr = format!("/p2p-circuit/ipfs/{}", dest.peer()).parse().unwrap();

    assert!(matches!(
        client.service.dial(&addr).await,
        Err(DialError::NoRelayAvailable)
    ));

    client
        .node
        .dial(circuit_relay::DialTarget::Addr(relay.node.addr()))
        .await
        .unwrap();
    assert!(client.service.dialer().probe_relay(relay.peer()).await.unwrap());

    let stream = client.service.dial(&addr).await.unwrap();
    assert_eq!(stream.relay(), relay.peer());
    let conn = dest.service.accept().await.unwrap();
    assert_eq!(&conn.source, client.peer());
}

#[tokio::test]
async fn many_simultaneous_circuits_keep_their_bytes_apart() {
    const CIRCUITS: usize = 8;
    let mut relay_config = config(RelayPolicy::relay(true));
    relay_config.limits.max_circuits = CIRCUITS;
    let (_net, client, relay, dest) = triangle(relay_config);
    let addr = via(&relay, dest.peer());

    // echo every relayed connection
    let dest_service = dest.service.clone();
    tokio::spawn(async move {
        while let Some(conn) = dest_service.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(conn.stream);
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    let all_open = Arc::new(tokio::sync::Barrier::new(CIRCUITS + 1));
    let mut dialers = Vec::new();
    for i in 0..CIRCUITS {
        let service = client.service.clone();
        let addr = addr.clone();
        let all_open = all_open.clone();
        dialers.push(tokio::spawn(async move {
            let mut stream = service.dial(&addr).await.unwrap();
            let payload: Vec<u8> = (0..4096).map(|j| (i * 31 + j) as u8).collect();
            stream.write_all(&payload).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload, "circuit {i} saw foreign bytes");
            all_open.wait().await;
            stream
        }));
    }

    tokio::time::timeout(Duration::from_secs(5), all_open.wait())
        .await
        .expect("all circuits should open together");
    assert_eq!(relay.service.relay().circuit_count(), CIRCUITS);

    for dialer in dialers {
        drop(dialer.await.unwrap());
    }
    wait_until(|| relay.service.relay().circuit_count() == 0).await;
}
