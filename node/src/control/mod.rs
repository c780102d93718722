//! Single-coordinator architecture: an authoritative [`Coordinator`] and thin
//! [`Terminal`] mirrors, both built from an input source and an event sink.

mod coordinator;
mod input;
mod peers;
mod terminal;

pub use coordinator::{Coordinator, CoordinatorRules, CoordinatorState};
pub use input::{ChannelInput, Input, StdinInput, Ticker};
pub use peers::PeerRegistry;
pub use terminal::{MirrorSink, Terminal, TerminalState};

use crate::event::{DomainEvent, EventFactory};
use crate::transport::PeerHandle;
use async_trait::async_trait;

/// Where an event entered the component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this process's own input source.
    Local,
    /// Sent by the authority this component mirrors (coordinator or leader).
    Authority,
    /// Sent by a connected peer.
    Peer(PeerHandle),
}

/// What the owning component should do after an event was consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Send the event on the component's outbound path.
    Emit(DomainEvent),
    /// Begin the component's shutdown path.
    Stop,
    /// Drop the transport state kept for a departed peer.
    Forget(PeerHandle),
}

/// Produces domain events from local stimuli (clock, keyboard, test harness).
#[async_trait]
pub trait InputSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self, factory: &EventFactory) -> Option<DomainEvent>;
}

/// Consumes domain events and mutates the state it owns.
#[async_trait]
pub trait EventSink: Send {
    async fn consume(&mut self, event: DomainEvent, origin: Origin) -> Vec<Reaction>;
}
