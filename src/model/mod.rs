//! Core data model.
//!
//! Tasks and their costs belong to the tracker. Operations and accounts
//! belong to the ledger. Users are owned by the identity service and only
//! mirrored here, one copy per consuming service.

pub mod ids;
pub mod ledger;
pub mod task;
pub mod user;

pub use ids::{EventId, OperationId, TaskId, UserId};
pub use ledger::{Account, Operation, Recorded};
pub use task::{NewTask, Task, TaskCost, TaskStatus};
pub use user::{Role, User};
