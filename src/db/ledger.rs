//! Operations and accounts.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::ledger::LedgerStore;
use crate::model::{Account, EventId, Operation, OperationId, Recorded, User, UserId};

impl super::Db {
    /// Append one operation and fold it into the account, atomically.
    ///
    /// The balance is adjusted by the database (`amount = accounts.amount +
    /// EXCLUDED.amount`), which row-locks the account for the rest of the
    /// transaction. Concurrent entries for one user serialize there; entries
    /// for different users never contend.
    pub async fn record_entry(
        &self,
        user_id: UserId,
        amount: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();

        let inserted: Option<OperationRow> = sqlx::query_as(
            "INSERT INTO operations (id, amount, user_id, event_id, created_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (event_id) DO NOTHING
             RETURNING id, amount, user_id, event_id, created_at",
        )
        .bind(id)
        .bind(amount)
        .bind(user_id.0)
        .bind(event_id.map(|e| e.0))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.commit().await?;
            return Ok(Recorded::Duplicate);
        };

        sqlx::query(
            "INSERT INTO accounts (user_id, amount) VALUES ($1, $2)
             ON CONFLICT (user_id) DO UPDATE SET amount = accounts.amount + EXCLUDED.amount",
        )
        .bind(user_id.0)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Recorded::Applied(row.into_operation()))
    }

    pub async fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        let row: Option<(Uuid, i64)> =
            sqlx::query_as("SELECT user_id, amount FROM accounts WHERE user_id = $1")
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id, amount)| Account {
            user_id: UserId(user_id),
            amount,
        }))
    }

    pub async fn operations(&self, user_id: UserId) -> Result<Vec<Operation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(
            "SELECT id, amount, user_id, event_id, created_at FROM operations
             WHERE user_id = $1 ORDER BY created_at, id",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OperationRow::into_operation).collect())
    }
}

#[async_trait]
impl LedgerStore for super::Db {
    async fn upsert_user(&self, user: &User) -> Result<()> {
        super::Db::upsert_user(self, user).await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        super::Db::get_user(self, id).await
    }

    async fn record_entry(
        &self,
        user_id: UserId,
        amount: i64,
        event_id: Option<EventId>,
    ) -> Result<Recorded> {
        super::Db::record_entry(self, user_id, amount, event_id).await
    }

    async fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        super::Db::account(self, user_id).await
    }

    async fn operations(&self, user_id: UserId) -> Result<Vec<Operation>> {
        super::Db::operations(self, user_id).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct OperationRow {
    id: Uuid,
    amount: i64,
    user_id: Uuid,
    event_id: Option<Uuid>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl OperationRow {
    fn into_operation(self) -> Operation {
        Operation {
            id: OperationId(self.id),
            amount: self.amount,
            user_id: UserId(self.user_id),
            event_id: self.event_id.map(EventId),
            created_at: self.created_at,
        }
    }
}
