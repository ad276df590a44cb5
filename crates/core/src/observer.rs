//! Change observers
//!
//! Listeners register for a [`Target`] and are called once per committed
//! update that touched it, after the update has landed in the document.

use std::fmt;

use tracing::trace;

use crate::clock::ReplicaId;
use crate::document::{Document, Target, Touched, UpdateId};

/// Where a committed update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Committed by a local transaction
    Local,
    /// Received from a peer (or replayed from storage when `None`)
    Remote(Option<ReplicaId>),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// Notification delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub update: UpdateId,
    pub origin: Origin,
    pub touched: Touched,
}

type Listener = Box<dyn FnMut(&ChangeEvent, &Document) + Send>;

struct Registration {
    id: ObserverId,
    target: Target,
    listener: Listener,
}

/// Registered listeners, called in registration order
#[derive(Default)]
pub struct Observers {
    next_id: u64,
    registrations: Vec<Registration>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        target: Target,
        listener: impl FnMut(&ChangeEvent, &Document) + Send + 'static,
    ) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.registrations.push(Registration {
            id,
            target,
            listener: Box::new(listener),
        });
        id
    }

    /// Returns whether the listener was registered
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        self.registrations.len() != before
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn notify(&mut self, event: &ChangeEvent, document: &Document) {
        trace!(
            update = %event.update,
            listeners = self.registrations.len(),
            "Dispatching change event"
        );
        for registration in &mut self.registrations {
            if event.touched.matches(registration.target) {
                (registration.listener)(event, document);
            }
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.registrations.len())
            .finish()
    }
}
