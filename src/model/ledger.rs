//! Ledger records: the append-only operation trail and the balance folded
//! from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventId, OperationId, UserId};

/// One ledger-affecting event. Append-only, never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    /// Signed: negative for charges, positive for payments.
    pub amount: i64,
    pub user_id: UserId,
    /// The event this entry was folded from, when known.
    pub event_id: Option<EventId>,
    pub created_at: DateTime<Utc>,
}

/// Running balance per user. Always equals the sum of that user's
/// operation amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub amount: i64,
}

/// Outcome of folding one entry into the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// New operation written and balance adjusted.
    Applied(Operation),
    /// An operation for this event id already exists; nothing changed.
    Duplicate,
}
