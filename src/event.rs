//! Node event system.

use tokio::sync::broadcast;

/// Events emitted by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Node has started and is accepting requests.
    Started {
        /// Address the HTTP listener is bound to.
        addr: String,
    },

    /// Node is shutting down.
    ShuttingDown,

    /// A 402 challenge was issued.
    ChallengeIssued {
        /// The new reference.
        reference: String,
        /// Lamports required.
        amount: u64,
    },

    /// A payment was verified and its reference consumed.
    PaymentConsumed {
        /// The consumed reference.
        reference: String,
        /// Fee payer of the paying transaction.
        payer: String,
        /// Lamports received.
        amount: u64,
    },

    /// Expired pending references were purged.
    ReferencesSwept {
        /// Number of references removed.
        count: usize,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving node events.
pub type NodeEventsChannel = broadcast::Receiver<NodeEvent>;

/// Sender for node events.
pub type NodeEventsSender = broadcast::Sender<NodeEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (NodeEventsSender, NodeEventsChannel) {
    broadcast::channel(256)
}
