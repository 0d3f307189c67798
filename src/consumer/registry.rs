//! Handler registry keyed by event type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::event::{Envelope, EventType};

/// Applies one event to local state.
///
/// Called only after the payload passed the schema gate. Handlers decode with
/// [`Envelope::decode`]; a decode error is treated as a contract violation.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

enum Entry {
    Handle(Arc<dyn EventHandler>),
    Ignore,
}

pub enum Route<'a> {
    Handle(&'a Arc<dyn EventHandler>),
    /// Known on this queue, deliberately not acted on.
    Ignore,
    /// Nothing registered. The delivery is rejected, not dropped.
    Unregistered,
}

#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<EventType, Entry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any earlier entry.
    pub fn on(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.entries.insert(event_type, Entry::Handle(handler));
        self
    }

    pub fn ignore(mut self, event_type: EventType) -> Self {
        self.entries.insert(event_type, Entry::Ignore);
        self
    }

    pub fn route(&self, event_type: EventType) -> Route<'_> {
        match self.entries.get(&event_type) {
            Some(Entry::Handle(handler)) => Route::Handle(handler),
            Some(Entry::Ignore) => Route::Ignore,
            None => Route::Unregistered,
        }
    }

    /// Event types with a handler, sorted.
    pub fn handled_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Handle(_)))
            .map(|(event_type, _)| *event_type)
            .collect();
        types.sort();
        types
    }
}
