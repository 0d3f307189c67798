//! Accounting-side event handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Ledger, LedgerStore};
use crate::consumer::{EventHandler, HandlerRegistry};
use crate::error::Result;
use crate::event::{Envelope, EventType, TaskAssigned, TaskCompleted, UserCreated};
use crate::model::User;

/// Mirrors identity-service users into the ledger's user table.
pub struct UserCreatedHandler {
    store: Arc<dyn LedgerStore>,
}

#[async_trait]
impl EventHandler for UserCreatedHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event: UserCreated = envelope.decode()?;
        self.store
            .upsert_user(&User::new(event.id, event.username, event.role))
            .await?;
        info!(user_id = %event.id, role = %event.role, "user mirrored");
        Ok(())
    }
}

/// Charges the assignee the assignment cost.
pub struct TaskAssignedHandler {
    ledger: Ledger,
}

#[async_trait]
impl EventHandler for TaskAssignedHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event: TaskAssigned = envelope.decode()?;
        self.ledger
            .record_debit(event.assignee_id, event.amount, envelope.event_id)
            .await?;
        Ok(())
    }
}

/// Pays the assignee the completion cost.
pub struct TaskCompletedHandler {
    ledger: Ledger,
}

#[async_trait]
impl EventHandler for TaskCompletedHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let event: TaskCompleted = envelope.decode()?;
        self.ledger
            .record_credit(event.assignee_id, event.amount, envelope.event_id)
            .await?;
        Ok(())
    }
}

/// Handlers for the accounting inbound queue.
pub fn accounting_registry(ledger: &Ledger) -> HandlerRegistry {
    HandlerRegistry::new()
        .on(
            EventType::UserCreated,
            Arc::new(UserCreatedHandler {
                store: ledger.store().clone(),
            }),
        )
        .on(
            EventType::TaskAssigned,
            Arc::new(TaskAssignedHandler {
                ledger: ledger.clone(),
            }),
        )
        .on(
            EventType::TaskCompleted,
            Arc::new(TaskCompletedHandler {
                ledger: ledger.clone(),
            }),
        )
        .ignore(EventType::TaskCreated)
}
