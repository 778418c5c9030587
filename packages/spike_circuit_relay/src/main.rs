//! Spike: validate circuit relaying over an in-memory network.
//!
//! This throwaway binary answers:
//! 1. Can a client reach a destination it is not connected to through a relay?
//! 2. Does the destination learn who dialed it, and via which relay?
//! 3. Do bytes flow unchanged in both directions, and does the circuit go away on close?
//!
//! Usage: cargo run -p spike_circuit_relay

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use circuit_relay::{
    CircuitAddr, ConnectionRegistry, MemoryNetwork, PeerId, RelayConfig, RelayPolicy, RelayService,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PAYLOAD_LEN: usize = 128;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Spike: circuit relay over memory transport ===");

    // --- Step 1: Build the network ---
    info!("Step 1: Creating client, relay and destination nodes...");
    let net = MemoryNetwork::new();
    let relay_config = RelayConfig::load(None).context("failed to load relay config")?;
    let relay_config = RelayConfig {
        policy: RelayPolicy::relay(true),
        ..relay_config
    };
    let client_config = RelayConfig {
        policy: RelayPolicy::client(),
        ..relay_config
    };

    let mut services = Vec::new();
    for (name, config) in [
        ("QmC1ientSpike", client_config),
        ("QmRe1aySpike", relay_config),
        ("QmDestSpike", client_config),
    ] {
        let peer = PeerId::parse(name).context("bad spike peer id")?;
        let node = net.add_node(peer);
        let incoming = node
            .take_incoming()
            .context("inbound queue already taken")?;
        let service = Arc::new(RelayService::new(node.clone(), config));
        service.spawn(incoming);
        info!("Node {} listening at {}", name, node.addr());
        services.push((node, service));
    }
    let [(client_node, client), (relay_node, relay), (dest_node, dest)] =
        <[_; 3]>::try_from(services).map_err(|_| anyhow::anyhow!("expected three nodes"))?;

    // --- Step 2: Dial through the relay ---
    let addr: CircuitAddr = format!(
        "{}/p2p-circuit/ipfs/{}",
        relay_node.addr().with_peer(relay_node.local_peer()),
        dest_node.local_peer()
    )
    .parse()?;
    info!("Step 2: Dialing {}", addr);
    let mut stream = client.dial(&addr).await?;
    info!("Client: circuit established via {}", stream.relay());

    // --- Step 3: Destination accepts ---
    info!("Step 3: Waiting for relayed connection at destination...");
    let mut conn = tokio::time::timeout(Duration::from_secs(5), dest.accept())
        .await
        .context("destination accept timed out")?
        .context("destination listener closed")?;
    info!(
        "Destination: accepted connection from {} via {}",
        conn.source, conn.relay
    );
    if &conn.source != client_node.local_peer() {
        bail!("destination saw source {}, expected {}", conn.source, client_node.local_peer());
    }

    // --- Step 4: Exchange random bytes ---
    info!("Step 4: Sending {} random bytes...", PAYLOAD_LEN);
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|_| rand::random::<u8>()).collect();
    stream.write_all(&payload).await?;
    let mut received = vec![0u8; PAYLOAD_LEN];
    conn.stream.read_exact(&mut received).await?;
    if received != payload {
        bail!("payload corrupted in transit");
    }
    info!("Destination: received {} bytes intact", received.len());

    conn.stream.write_all(&received).await?;
    let mut echoed = vec![0u8; PAYLOAD_LEN];
    stream.read_exact(&mut echoed).await?;
    if echoed != payload {
        bail!("echo corrupted in transit");
    }
    info!("Client: echo received intact");

    for circuit in relay.relay().active_circuits() {
        info!(
            "Relay: circuit {} {} -> {} ({} / {} bytes)",
            circuit.id,
            circuit.source.short(),
            circuit.destination.short(),
            circuit.counters.forward(),
            circuit.counters.backward()
        );
    }

    // --- Step 5: Teardown ---
    info!("Step 5: Closing client side...");
    drop(stream);
    let mut rest = Vec::new();
    conn.stream.read_to_end(&mut rest).await?;
    info!("Destination: observed close");
    drop(conn);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.relay().circuit_count() > 0 {
        if tokio::time::Instant::now() > deadline {
            bail!("relay still holds {} circuits", relay.relay().circuit_count());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    info!("Relay: circuit released");

    for service in [&client, &relay, &dest] {
        service.shutdown();
    }

    info!("=== Spike complete: all checks passed ===");
    Ok(())
}
