//! # taskledger
//!
//! Event-driven task tracking with a derived per-user ledger.
//!
//! The tracker creates and completes tasks and emits lifecycle events after
//! they pass the schema gate. The accounting service consumes those events
//! from its queue and folds them into per-user balances. Queues are pgmq on
//! Postgres; observability is OpenTelemetry.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod event;
pub mod http;
pub mod ledger;
pub mod model;
pub mod outbox;
pub mod publisher;
pub mod schema;
pub mod telemetry;
pub mod tracker;

pub use error::{Error, ErrorClass, Result};
