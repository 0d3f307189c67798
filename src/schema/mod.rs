//! Schema gate: validates candidate event payloads against versioned
//! contracts before anything is published.
//!
//! Documents are keyed by `(event_type, version)` and resolved by the
//! convention `{dir}/{event_type}/{version}.json` and compiled once at load
//! time. Validation is pass/fail with no side effects, so producers can
//! pre-flight freely.

pub mod client;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::Validator;
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{EventType, SCHEMA_VERSION};
use crate::telemetry::metrics;

pub use client::HttpSchemaGate;

/// Anything that can accept or reject a payload for an event type.
#[async_trait]
pub trait SchemaGate: Send + Sync {
    /// `Ok(())` when valid; [`Error::ContractViolation`] when not. Other
    /// errors mean the gate itself could not answer.
    async fn validate(&self, event_type: EventType, payload: &[u8]) -> Result<()>;
}

/// A compiled JSON Schema document. Formats such as `uuid` are asserted,
/// not just annotated.
#[derive(Clone)]
pub struct Schema {
    validator: Arc<Validator>,
}

impl Schema {
    pub fn compile(document: &Value) -> Result<Self> {
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(document)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            validator: Arc::new(validator),
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)?;
        Self::compile(&document)
    }

    /// Every violation in `value`, joined into one reason.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        let reasons: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons.join("; "))
        }
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").finish_non_exhaustive()
    }
}

/// In-process registry of compiled schema documents.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    documents: HashMap<(EventType, u32), Schema>,
}

const BUILTIN: [(EventType, &str); 4] = [
    (
        EventType::UserCreated,
        include_str!("../../schemas/user_created/1.json"),
    ),
    (
        EventType::TaskCreated,
        include_str!("../../schemas/task_created/1.json"),
    ),
    (
        EventType::TaskAssigned,
        include_str!("../../schemas/task_assigned/1.json"),
    ),
    (
        EventType::TaskCompleted,
        include_str!("../../schemas/task_completed/1.json"),
    ),
];

impl SchemaRegistry {
    /// Registry with no documents. Every validation fails as unresolvable.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The documents shipped with this build.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::empty();
        for (event_type, text) in BUILTIN {
            let schema = Schema::from_json(text).map_err(|e| {
                Error::Config(format!("bad builtin schema for {event_type}: {e}"))
            })?;
            registry.insert(event_type, SCHEMA_VERSION, schema);
        }
        Ok(registry)
    }

    /// Load `{dir}/{event_type}/{version}.json` for every known event type.
    /// Missing directories are skipped; a file that does not parse or
    /// compile is an error.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        for event_type in EventType::ALL {
            let type_dir = dir.join(event_type.as_str());
            if !type_dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&type_dir)? {
                let path = entry?.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let Some(version) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok())
                else {
                    continue;
                };
                let text = std::fs::read_to_string(&path)?;
                let schema = Schema::from_json(&text).map_err(|e| {
                    Error::Config(format!("bad schema document {}: {e}", path.display()))
                })?;
                debug!(%event_type, version, path = %path.display(), "loaded schema");
                registry.insert(event_type, version, schema);
            }
        }

        Ok(registry)
    }

    pub fn insert(&mut self, event_type: EventType, version: u32, schema: Schema) {
        self.documents.insert((event_type, version), schema);
    }

    pub fn get(&self, event_type: EventType, version: u32) -> Option<&Schema> {
        self.documents.get(&(event_type, version))
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Validate raw payload bytes against a specific schema version.
    pub fn validate_version(&self, event_type: EventType, version: u32, payload: &[u8]) -> Result<()> {
        let outcome = self.check(event_type, version, payload);
        metrics::schema_validations().add(
            1,
            &[
                KeyValue::new("event_type", event_type.as_str()),
                KeyValue::new("result", if outcome.is_ok() { "valid" } else { "invalid" }),
            ],
        );
        outcome
    }

    fn check(&self, event_type: EventType, version: u32, payload: &[u8]) -> Result<()> {
        let schema = self.get(event_type, version).ok_or_else(|| {
            Error::contract(
                event_type.as_str(),
                format!("no schema document for version {version}"),
            )
        })?;
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| Error::contract(event_type.as_str(), format!("malformed JSON: {e}")))?;
        schema
            .validate(&value)
            .map_err(|reason| Error::contract(event_type.as_str(), reason))
    }
}

#[async_trait]
impl SchemaGate for SchemaRegistry {
    async fn validate(&self, event_type: EventType, payload: &[u8]) -> Result<()> {
        self.validate_version(event_type, SCHEMA_VERSION, payload)
    }
}
