use std::{any::type_name, collections::HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{AggregateState, CqrsError, Result, Uuid};

/// The `SnapshotStore` trait defines the behavior for storing and loading aggregate snapshots.
///
/// Aggregate snapshots are a copy of an aggregate's state at a specific version, allowing
/// repositories to replay only the events recorded after it.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Saves a snapshot, replacing any older one for the same aggregate.
    async fn save_snapshot(&self, snapshot: AggregateSnapshot) -> Result<()>;

    /// Loads the latest snapshot of an aggregate, if any.
    async fn load_snapshot(&self, aggregate_id: Uuid) -> Result<Option<AggregateSnapshot>>;
}

/// The `AggregateSnapshot` struct holds the serialized state of one aggregate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub aggregate_id: Uuid,

    /// Type of the state the payload was taken from, checked on restore.
    pub aggregate_type: String,

    pub version: u64,

    pub taken_at: DateTime<Utc>,

    payload: serde_json::Value,
}

impl AggregateSnapshot {
    pub fn new<S>(state: &S) -> Result<Self>
    where
        S: AggregateState,
    {
        let payload = serde_json::to_value(state)
            .map_err(|err| CqrsError::Snapshot(format!("cannot serialize state: {err}")))?;

        Ok(Self {
            aggregate_id: state.aggregate_id(),
            aggregate_type: type_name::<S>().to_string(),
            version: state.version(),
            taken_at: Utc::now(),
            payload,
        })
    }

    /// Deserializes the state the snapshot was taken from.
    pub fn restore<S>(&self) -> Result<S>
    where
        S: AggregateState,
    {
        if self.aggregate_type != type_name::<S>() {
            return Err(CqrsError::Snapshot(format!(
                "snapshot of aggregate {} holds a `{}`, not a `{}`",
                self.aggregate_id,
                self.aggregate_type,
                type_name::<S>()
            )));
        }

        let state: S = serde_json::from_value(self.payload.clone())?;
        if state.version() != self.version {
            return Err(CqrsError::Snapshot(format!(
                "snapshot of aggregate {} is tagged version {} but holds version {}",
                self.aggregate_id,
                self.version,
                state.version()
            )));
        }
        Ok(state)
    }
}

/// Keeps the latest snapshot of every aggregate in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, AggregateSnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save_snapshot(&self, snapshot: AggregateSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        match snapshots.get(&snapshot.aggregate_id) {
            Some(current) if current.version >= snapshot.version => {
                tracing::debug!(
                    aggregate_id = %snapshot.aggregate_id,
                    version = snapshot.version,
                    "newer snapshot already stored"
                );
            }
            _ => {
                snapshots.insert(snapshot.aggregate_id, snapshot);
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self, aggregate_id: Uuid) -> Result<Option<AggregateSnapshot>> {
        Ok(self.snapshots.read().get(&aggregate_id).cloned())
    }
}
