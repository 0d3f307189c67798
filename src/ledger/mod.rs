//! Ledger aggregator: per-user balances folded from task events.
//!
//! Every entry writes one immutable [`Operation`] and adjusts the user's
//! [`Account`] by the same signed amount in one transaction, so an account
//! always equals the sum of its operations. Entries carrying an event id are
//! applied at most once per id.

pub mod handlers;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{Account, EventId, Operation, Recorded, User, UserId};
use crate::telemetry::metrics;

pub use handlers::accounting_registry;
pub use memory::InMemoryLedgerStore;

/// Storage owned by the ledger side.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn upsert_user(&self, user: &User) -> Result<()>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// Atomically append an operation of `amount` and add it to the account.
    /// Returns [`Recorded::Duplicate`] without writing when `event_id` was
    /// already recorded.
    async fn record_entry(
        &self,
        user_id: UserId,
        amount: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded>;

    async fn account(&self, user_id: UserId) -> Result<Option<Account>>;

    /// Operations for a user, oldest first.
    async fn operations(&self, user_id: UserId) -> Result<Vec<Operation>>;
}

/// Result of checking an account against its operation trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub user_id: UserId,
    pub balance: i64,
    pub operations_total: i64,
    pub operation_count: usize,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.balance == self.operations_total
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Charge `amount` against the user. Stored as `-amount`.
    pub async fn record_debit(
        &self,
        user_id: UserId,
        amount: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded> {
        self.record("debit", user_id, -amount, event_id).await
    }

    /// Pay `amount` to the user. Stored as `+amount`.
    pub async fn record_credit(
        &self,
        user_id: UserId,
        amount: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded> {
        self.record("credit", user_id, amount, event_id).await
    }

    async fn record(
        &self,
        direction: &'static str,
        user_id: UserId,
        signed: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded> {
        let recorded = self.store.record_entry(user_id, signed, event_id).await?;
        let result = match &recorded {
            Recorded::Applied(op) => {
                info!(%user_id, amount = op.amount, operation_id = %op.id, direction, "ledger entry applied");
                "applied"
            }
            Recorded::Duplicate => {
                debug!(%user_id, ?event_id, direction, "ledger entry already recorded");
                "duplicate"
            }
        };
        metrics::ledger_entries().add(
            1,
            &[
                KeyValue::new("direction", direction),
                KeyValue::new("result", result),
            ],
        );
        Ok(recorded)
    }

    /// Current balance, zero for a user with no entries.
    pub async fn balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self
            .store
            .account(user_id)
            .await?
            .map(|account| account.amount)
            .unwrap_or(0))
    }

    pub async fn operations(&self, user_id: UserId) -> Result<Vec<Operation>> {
        self.store.operations(user_id).await
    }

    /// Compare the stored balance with the sum of the operation trail.
    pub async fn reconcile(&self, user_id: UserId) -> Result<Reconciliation> {
        let balance = self.balance(user_id).await?;
        let operations = self.store.operations(user_id).await?;
        let report = Reconciliation {
            user_id,
            balance,
            operations_total: operations.iter().map(|op| op.amount).sum(),
            operation_count: operations.len(),
        };
        if !report.is_consistent() {
            warn!(
                %user_id,
                balance,
                operations_total = report.operations_total,
                "account diverges from operation log"
            );
        }
        Ok(report)
    }
}
