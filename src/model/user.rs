//! Users and roles, mirrored from `user_created` events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Worker,
    Accountant,
    Manager,
    Admin,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Worker, Role::Accountant, Role::Manager, Role::Admin];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Accountant => "accountant",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    /// May reshuffle task assignments.
    pub fn can_reassign(self) -> bool {
        matches!(self, Role::Manager | Role::Admin)
    }

    /// May read other users' balances and operation logs.
    pub fn can_audit(self) -> bool {
        matches!(self, Role::Accountant | Role::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown role: {s}")))
    }
}

/// Local read copy of an identity-service user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id,
            username: username.into(),
            role,
            created_at: now,
            updated_at: now,
        }
    }
}
