//! Network subsystem for the stream connection

pub mod signal;
pub mod socket;
pub mod transport;

pub use signal::{Mailbox, Signal, SignalSet, Signals};
pub use transport::{
    EventSink, Transport, TransportCommand, TransportConfig, TransportEvent, TransportStats,
};
