pub mod protocol;
pub mod relay;
pub mod stats;
pub mod transport;

pub use protocol::{
    DisputeOutcome, Envelope, EnvelopeError, Evidence, GameEndReport, GameSnapshot, MatchOffer,
    Message, MessageFamily, MessageKind, Metric, QueueTicket, StakeProposal,
};
pub use relay::{LinkId, LocalRelay, MatchQueue, RelayConfig, RelayLink};
pub use stats::{LinkSimulation, LinkStats};
pub use transport::{LinkState, Transport, TransportError, TransportEvent};
