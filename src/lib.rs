//! brokerlink: agent-side reverse tunnel client.
//!
//! An endpoint agent keeps exactly one authenticated, encrypted TCP (or
//! TLS) connection to a broker and multiplexes everything over it:
//! outbound HTTP-style requests, file downloads, websocket streams, and
//! *inbound* HTTP requests the broker dials back into the agent.
//!
//! ```no_run
//! use brokerlink::{Config, TunnelBuilder};
//!
//! # async fn run() -> Result<(), brokerlink::TunnelError> {
//! let cfg = Config {
//!     semver: "1.4.2".to_owned(),
//!     addresses: vec!["broker.example.com:8443".to_owned()],
//!     ..Config::default()
//! };
//! let tunnel = TunnelBuilder::new()
//!     .heartbeat_interval(std::time::Duration::from_secs(120))
//!     .open(cfg)
//!     .await?;
//!
//! tunnel
//!     .oneway_json("/api/v1/minion/startup", &serde_json::json!({"ok": true}), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! `open` returns once the first session is live (the `connected` callback
//! has fired); a background supervisor then keeps the session alive —
//! backoff redials, a single machine-id rebuild on duplicate registration,
//! heartbeat supervision — until the broker terminally rejects the node or
//! the cancellation token fires.

pub mod address;
pub mod attach;
pub mod config;
mod dial;
pub mod dispatch;
pub mod error;
mod handshake;
mod heartbeat;
pub mod ident;
pub mod listener;
pub mod machine_id;
pub mod mux;
pub mod notify;
pub mod secret;
mod session;
pub mod supervisor;
pub mod wsconn;

pub use address::{Address, AddressBook, Origin};
pub use attach::Attachment;
pub use config::{Config, ConfigLoader};
pub use dispatch::{ScopedTunnel, Tunnel};
pub use error::{HttpError, TunnelError};
pub use ident::{Identity, SessionGrant};
pub use listener::{ClosedServer, InboundServer, RouterServer, StreamListener};
pub use machine_id::{DEFAULT_CACHE_FILE, Identifier, MachineId};
pub use mux::{MuxSession, MuxStream};
pub use notify::{NoopNotifier, Notifier};
pub use secret::{Cipher, PresharedCipher};
pub use supervisor::{TunnelBuilder, open};
pub use wsconn::WsConn;
