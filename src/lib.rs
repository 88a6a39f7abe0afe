//! Peer-to-peer sessions negotiated through a shared relay store.
//!
//! Two endpoints exchange an offer, an answer and ICE candidates through a
//! [`RelayStore`]; afterwards messages and files travel directly over one
//! ordered data channel.
//!
//! ```no_run
//! use peerlink::{MemoryRelay, PeerSession, RtcTransportFactory, SessionConfig, SessionEvent};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), peerlink::SessionError> {
//! peerlink::logger::init();
//! let relay = MemoryRelay::new();
//! let factory = Arc::new(RtcTransportFactory::new());
//!
//! let host = PeerSession::new(SessionConfig::default(), relay.clone(), factory.clone())?;
//! let guest = PeerSession::new(SessionConfig::default(), relay, factory)?;
//! let mut inbox = guest.subscribe();
//!
//! let id = host.initiate().await?;
//! guest.join(&id).await?;
//! host.send_message("hello").await?;
//! if let Some(SessionEvent::Message(text)) = inbox.recv().await {
//!     println!("{text}");
//! }
//! host.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod utils;

pub use config::{ServerConfig, SessionConfig};
pub use error::{ProtocolError, RelayError, SessionError, TransportError};
pub use events::{EventStream, SessionEvent};
pub use peer::mock::MockNetwork;
pub use peer::{ConnectionState, NegotiationState, Role, RtcTransportFactory};
pub use relay::memory::MemoryRelay;
pub use relay::RelayStore;
pub use session::PeerSession;
pub use transfer::{OutgoingFile, ReceivedFile, CHUNK_SIZE};
