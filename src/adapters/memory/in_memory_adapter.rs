//! Non-durable [`MemoryAdapter`] backed by process memory.
//!
//! Envelopes are kept in their serialized JSON form and go back through
//! [`EnvelopeValidator`] on every read, so callers see the same schema and
//! integrity checks a durable backend would apply.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::domain::errors::DomainResult;
use crate::domain::models::{BreakerSnapshot, Envelope, TransmissionRecord};
use crate::domain::ports::{EnvelopeFilter, MemoryAdapter};
use crate::infrastructure::validators::EnvelopeValidator;

/// Memory adapter for tests and hosts that do not need durability.
#[derive(Debug)]
pub struct InMemoryAdapter {
    validator: EnvelopeValidator,
    /// `(patch_id, serialized envelope)`, oldest store first.
    envelopes: RwLock<Vec<(String, Value)>>,
    breakers: RwLock<HashMap<String, BreakerSnapshot>>,
    transmissions: Mutex<Vec<TransmissionRecord>>,
}

impl InMemoryAdapter {
    pub fn new() -> DomainResult<Self> {
        Ok(Self {
            validator: EnvelopeValidator::new()?,
            envelopes: RwLock::new(Vec::new()),
            breakers: RwLock::new(HashMap::new()),
            transmissions: Mutex::new(Vec::new()),
        })
    }

    /// Every telemetry record stored so far, oldest first.
    pub async fn transmissions(&self) -> Vec<TransmissionRecord> {
        self.transmissions.lock().await.clone()
    }

    pub async fn envelope_count(&self) -> usize {
        self.envelopes.read().await.len()
    }

    pub async fn session_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.breakers.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl MemoryAdapter for InMemoryAdapter {
    async fn store_envelope(&self, envelope: &Envelope) -> DomainResult<()> {
        let value = envelope.to_json()?;
        self.validator.validate(&value)?;

        let mut envelopes = self.envelopes.write().await;
        envelopes.retain(|(id, _)| id != envelope.patch_id());
        envelopes.push((envelope.patch_id().to_string(), value));
        Ok(())
    }

    async fn query_envelopes(&self, filter: &EnvelopeFilter) -> DomainResult<Vec<Envelope>> {
        let envelopes = self.envelopes.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut matched = Vec::new();

        for (_, value) in envelopes.iter().rev() {
            if matched.len() >= limit {
                break;
            }
            let envelope = self.validator.parse(value.clone())?;
            if filter.matches(&envelope) {
                matched.push(envelope);
            }
        }
        Ok(matched)
    }

    async fn get_breaker_state(&self, session_key: &str) -> DomainResult<Option<BreakerSnapshot>> {
        Ok(self.breakers.read().await.get(session_key).cloned())
    }

    async fn store_breaker_state(
        &self,
        session_key: &str,
        snapshot: &BreakerSnapshot,
    ) -> DomainResult<()> {
        self.breakers
            .write()
            .await
            .insert(session_key.to_string(), snapshot.clone());
        Ok(())
    }

    async fn store_transmission(&self, record: &TransmissionRecord) -> DomainResult<()> {
        self.transmissions.lock().await.push(record.clone());
        Ok(())
    }
}
