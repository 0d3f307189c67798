//! Tracker-side event handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::TaskStore;
use crate::consumer::{EventHandler, HandlerRegistry};
use crate::error::Result;
use crate::event::{Envelope, EventType, UserCreated};
use crate::model::User;

/// Keeps the tracker's user cache in step with the identity service. The
/// cache drives worker selection and role checks.
pub struct UserCreatedHandler {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl EventHandler for UserCreatedHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event: UserCreated = envelope.decode()?;
        self.store
            .upsert_user(&User::new(event.id, event.username, event.role))
            .await?;
        info!(user_id = %event.id, role = %event.role, "user cached");
        Ok(())
    }
}

/// Handlers for the tracker inbound queue. Task events are the tracker's own
/// output and are ignored if they ever arrive here.
pub fn tracker_registry(store: Arc<dyn TaskStore>) -> HandlerRegistry {
    HandlerRegistry::new()
        .on(EventType::UserCreated, Arc::new(UserCreatedHandler { store }))
        .ignore(EventType::TaskCreated)
        .ignore(EventType::TaskAssigned)
        .ignore(EventType::TaskCompleted)
}
