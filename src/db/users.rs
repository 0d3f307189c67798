//! Mirrored users.

use uuid::Uuid;

use crate::error::Result;
use crate::model::{Role, User, UserId};

impl super::Db {
    /// Insert or refresh a mirrored user. `created_at` survives refreshes.
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, role, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (id) DO UPDATE
             SET username = EXCLUDED.username, role = EXCLUDED.role, updated_at = now()",
        )
        .bind(user.id.0)
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, username, role, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::try_into_user).transpose()
    }

    /// Users holding `role`, ordered by id.
    pub async fn users_by_role(&self, role: Role) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as(
            "SELECT id, username, role, created_at, updated_at FROM users
             WHERE role = $1 ORDER BY id",
        )
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(UserRow::try_into_user).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    role: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl UserRow {
    fn try_into_user(self) -> Result<User> {
        Ok(User {
            id: UserId(self.id),
            username: self.username,
            role: self.role.parse()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
