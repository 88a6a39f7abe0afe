pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod mock;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::RtcTransportFactory;
pub use ice::CandidateBuffer;
pub use state::{NegotiationState, SessionState};
pub use transport::{ChannelEvent, ChannelHandle, DataChannel, PeerTransport, TransportFactory};
pub use types::{ConnectionState, IceCandidate, Role, SessionDescription};
