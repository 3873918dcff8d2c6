//! Link events
//!
//! Everything the operator console needs to react to is published on one
//! [`EventBus`]. Subscribers that fall behind lose the oldest events; the
//! bus never blocks a publisher.

use tokio::sync::broadcast;

use crate::recipe_store::RecipeChange;
use crate::status::{MoverStatusRecord, StatusTransition, SystemStatus};
use crate::transport::{ConnectionState, StateChange};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// Fresh snapshot of every mover.
    StatusUpdated(Vec<MoverStatusRecord>),
    StatusTransition(StatusTransition),
    SystemStatus(SystemStatus),
    OperationSucceeded {
        operation: String,
        detail: String,
    },
    OperationFailed {
        operation: String,
        detail: String,
    },
    RecipeChanged(RecipeChange),
}

impl From<StateChange> for LinkEvent {
    fn from(change: StateChange) -> Self {
        Self::StateChanged {
            old: change.old,
            new: change.new,
        }
    }
}

/// Broadcast channel of [`LinkEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LinkEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.sender.subscribe()
    }

    /// Deliver to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: LinkEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
