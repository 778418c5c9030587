//! Circuit relay transport: reach a peer through a mutually reachable relay.
//!
//! A dialer asks a relay to `HOP` to a destination; the relay opens a stream to
//! the destination, announces the circuit with `STOP`, and then splices bytes in
//! both directions until either side closes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use circuit_relay::{CircuitAddr, MemoryNetwork, PeerId, RelayConfig, RelayPolicy, RelayService};
//!
//! #[tokio::main]
//! async fn main() {
//!     let net = MemoryNetwork::new();
//!     let node = net.add_node(PeerId::parse("QmSrc").unwrap());
//!     let config = RelayConfig {
//!         policy: RelayPolicy::client(),
//!         ..Default::default()
//!     };
//!     let service = Arc::new(RelayService::new(node.clone(), config));
//!     service.spawn(node.take_incoming().unwrap());
//!
//!     let addr: CircuitAddr = "/memory/QmRe1ay/ipfs/QmRe1ay/p2p-circuit/ipfs/QmDest"
//!         .parse()
//!         .unwrap();
//!     let _stream = service.dial(&addr).await;
//! }
//! ```

pub mod address;
pub mod config;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod memory;
pub mod peer;
pub mod policy;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod service;
pub mod splice;

pub use address::{CircuitAddr, TransportAddr, compose, parse};
pub use config::{FileConfig, RelayConfig, load_config};
pub use dialer::{CircuitDialer, DialerConfig, RelayedStream};
pub use error::{AddrError, ConfigError, DialError, ErrorClass, HopError, ProtocolError, TransportError};
pub use listener::{CircuitListener, RelayedConnection};
pub use memory::{MemoryNetwork, MemoryNode};
pub use peer::PeerId;
pub use policy::{HopPolicy, RelayMode, RelayPolicy};
pub use protocol::{PROTOCOL_ID, RelayMessage, StatusCode};
pub use registry::{BoxedStream, ConnectionRegistry, DialTarget, InboundStream};
pub use relay::{CircuitId, CircuitInfo, CircuitState, Relay, RelayLimits};
pub use service::RelayService;
pub use splice::{SpliceConfig, SpliceReport};
