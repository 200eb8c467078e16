use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{CqrsError, DomainEvent, Result, Uuid};

/// The `StoredEvent` struct is the envelope an event is persisted in.
///
/// It carries the event's own ID, its type, the aggregate it belongs to, the serialized
/// payload, the aggregate version the event produced, and the time it was stored. Events
/// are typically built with [`StoredEvent::new`] from a recorded [`DomainEvent`], and read
/// back with [`StoredEvent::payload`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: Uuid,

    pub event_type: String,

    pub aggregate_id: Uuid,

    payload: serde_json::Value,

    /// The aggregate version after this event was applied. Starts at 1.
    pub version: u64,

    pub timestamp: DateTime<Utc>,
}

impl StoredEvent {
    pub fn new<E>(aggregate_id: Uuid, version: u64, event: &E) -> Result<Self>
    where
        E: DomainEvent,
    {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            aggregate_id,
            payload: serde_json::to_value(event)?,
            version,
            timestamp: Utc::now(),
        })
    }

    /// Deserializes the payload back into the aggregate's event type.
    pub fn payload<E>(&self) -> Result<E>
    where
        E: DomainEvent,
    {
        serde_json::from_value(self.payload.clone()).map_err(CqrsError::PayloadDeserialization)
    }

    pub fn raw_payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// The `EventStore` trait defines how event streams are appended to and read back.
///
/// Each aggregate owns one ordered stream. Appends carry the version the writer last saw;
/// a store must refuse the append with [`CqrsError::Concurrency`] when the stream has moved
/// past it.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to the stream of `aggregate_id` if its current version equals
    /// `expected_version`.
    async fn save_events(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: &[StoredEvent],
    ) -> Result<()>;

    /// The whole stream, oldest first. Unknown aggregates have an empty stream.
    async fn load_events(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>> {
        self.load_events_after(aggregate_id, 0).await
    }

    /// The events that moved the aggregate past `version`, oldest first.
    async fn load_events_after(&self, aggregate_id: Uuid, version: u64)
    -> Result<Vec<StoredEvent>>;
}

/// An event store keeping every stream in memory. Used by tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<Uuid, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_version(&self, aggregate_id: Uuid) -> u64 {
        self.streams
            .read()
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map_or(0, |event| event.version)
    }

    pub fn event_count(&self) -> usize {
        self.streams.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_events(
        &self,
        aggregate_id: Uuid,
        expected_version: u64,
        events: &[StoredEvent],
    ) -> Result<()> {
        let mut streams = self.streams.write();
        let stream = streams.entry(aggregate_id).or_default();
        let actual = stream.last().map_or(0, |event| event.version);

        if actual != expected_version {
            return Err(CqrsError::Concurrency {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut next = actual;
        for event in events {
            next += 1;
            if event.aggregate_id != aggregate_id || event.version != next {
                return Err(CqrsError::StoreOperation {
                    aggregate_id,
                    source: anyhow::anyhow!(
                        "event {} (version {}) does not continue the stream at version {}",
                        event.id,
                        event.version,
                        next
                    ),
                });
            }
        }

        stream.extend_from_slice(events);
        tracing::debug!(
            %aggregate_id,
            from = expected_version,
            to = next,
            "events appended"
        );
        Ok(())
    }

    async fn load_events_after(
        &self,
        aggregate_id: Uuid,
        version: u64,
    ) -> Result<Vec<StoredEvent>> {
        Ok(self
            .streams
            .read()
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.version > version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
