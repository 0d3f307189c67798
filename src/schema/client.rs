//! HTTP client for a remote schema gate.
//!
//! Speaks `POST {base}/validate/{event_type}/event` with the raw payload as
//! the body: 200 is valid, 400 is a contract violation, anything else means
//! the gate could not decide.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::warn;

use super::SchemaGate;
use crate::error::{Error, Result};
use crate::event::EventType;

pub struct HttpSchemaGate {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSchemaGate {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, event_type: EventType) -> String {
        format!("{}/validate/{}/event", self.base_url, event_type)
    }
}

#[async_trait]
impl SchemaGate for HttpSchemaGate {
    async fn validate(&self, event_type: EventType, payload: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(event_type))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::BAD_REQUEST => {
                let reason = response.text().await.unwrap_or_default();
                Err(Error::contract(event_type.as_str(), reason))
            }
            status => {
                warn!(%event_type, %status, "schema gate could not validate");
                Err(Error::Delivery(format!("schema gate returned {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_follows_the_gate_convention() {
        let gate = HttpSchemaGate::new("http://registry:8010/").unwrap();
        assert_eq!(
            gate.endpoint(EventType::TaskAssigned),
            "http://registry:8010/validate/task_assigned/event"
        );
    }
}
