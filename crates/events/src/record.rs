use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::TenantId;

/// A record published onto the message bus, containing multi-tenant +
/// routing metadata.
///
/// This is the wire unit of the outbox: topic, headers and payload are the
/// public event contract consumed by the AML/risk worker and analytics sinks.
///
/// Notes:
/// - **Multi-tenancy** is carried here via `tenant_id`.
/// - `partition_key` selects the bus partition; ordering is only guaranteed
///   per partition, never globally.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusRecord<E> {
    record_id: Uuid,
    tenant_id: TenantId,

    topic: String,
    partition_key: String,
    headers: HashMap<String, String>,

    payload: E,
}

impl<E> BusRecord<E> {
    pub fn new(
        record_id: Uuid,
        tenant_id: TenantId,
        topic: impl Into<String>,
        partition_key: impl Into<String>,
        headers: HashMap<String, String>,
        payload: E,
    ) -> Self {
        Self {
            record_id,
            tenant_id,
            topic: topic.into(),
            partition_key: partition_key.into(),
            headers,
            payload,
        }
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
