//! In-memory ledger store for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::LedgerStore;
use crate::error::{Error, Result};
use crate::model::{Account, EventId, Operation, OperationId, Recorded, User, UserId};

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, User>,
    operations: Vec<Operation>,
    accounts: HashMap<UserId, i64>,
    recorded_events: HashSet<EventId>,
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
    failing_writes: AtomicUsize,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("ledger state poisoned".into()))
    }

    /// Make the next `n` entry writes fail as a database outage would.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Total number of operations across all users.
    pub fn operation_count(&self) -> usize {
        self.lock().map(|state| state.operations.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        let mut state = self.lock()?;
        let created_at = state
            .users
            .get(&user.id)
            .map(|existing| existing.created_at)
            .unwrap_or(user.created_at);
        state.users.insert(
            user.id,
            User {
                created_at,
                updated_at: Utc::now(),
                ..user.clone()
            },
        );
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn record_entry(
        &self,
        user_id: UserId,
        amount: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded> {
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Other("ledger write failed".into()));
        }

        let mut state = self.lock()?;
        if let Some(id) = event_id
            && !state.recorded_events.insert(id)
        {
            return Ok(Recorded::Duplicate);
        }

        let operation = Operation {
            id: OperationId::new(),
            amount,
            user_id,
            event_id,
            created_at: Utc::now(),
        };
        state.operations.push(operation.clone());
        *state.accounts.entry(user_id).or_insert(0) += amount;
        Ok(Recorded::Applied(operation))
    }

    async fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        Ok(self
            .lock()?
            .accounts
            .get(&user_id)
            .map(|&amount| Account { user_id, amount }))
    }

    async fn operations(&self, user_id: UserId) -> Result<Vec<Operation>> {
        Ok(self
            .lock()?
            .operations
            .iter()
            .filter(|op| op.user_id == user_id)
            .cloned()
            .collect())
    }
}
