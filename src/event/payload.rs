//! Payload DTOs. Field names are the contract; unknown fields are rejected.

use serde::{Deserialize, Serialize};

use super::{EventPayload, EventType};
use crate::model::{Role, TaskId, UserId};

/// Published by the identity service when an account is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserCreated {
    pub id: UserId,
    pub username: String,
    pub role: Role,
}

impl EventPayload for UserCreated {
    const EVENT_TYPE: EventType = EventType::UserCreated;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskCreated {
    pub task_id: TaskId,
    pub description: String,
    pub author_id: UserId,
    pub assignee_id: UserId,
}

impl EventPayload for TaskCreated {
    const EVENT_TYPE: EventType = EventType::TaskCreated;
}

/// The assignee is charged `amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskAssigned {
    pub amount: i64,
    pub assignee_id: UserId,
}

impl EventPayload for TaskAssigned {
    const EVENT_TYPE: EventType = EventType::TaskAssigned;
}

/// The assignee is paid `amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskCompleted {
    pub amount: i64,
    pub assignee_id: UserId,
}

impl EventPayload for TaskCompleted {
    const EVENT_TYPE: EventType = EventType::TaskCompleted;
}
