use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;

use crate::{
    Aggregate, AggregateRoot, AggregateSnapshot, AggregateState, CqrsError, EventStore, Result,
    SnapshotStore, StoredEvent, UnitOfWork, Uuid,
};

/// A trait representing a repository for event-sourced aggregates.
///
/// Repositories hide the storage engine: they persist the events an aggregate recorded and
/// rebuild aggregates from their stream.
#[async_trait]
pub trait Repository<A>: Send + Sync
where
    A: Aggregate,
{
    /// Persists the events `aggregate` recorded since it was loaded or last saved.
    async fn save(&self, aggregate: &A) -> Result<()>;

    /// Rebuilds the aggregate from its stored events.
    async fn get_by_id(&self, id: Uuid) -> Result<A>;
}

/// When a repository takes a snapshot after saving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotPolicy {
    interval: Option<u64>,
}

impl SnapshotPolicy {
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// Snapshot whenever a save crosses a multiple of `events` versions. Zero means never.
    pub fn every(events: u64) -> Self {
        Self {
            interval: (events > 0).then_some(events),
        }
    }

    pub fn should_snapshot(&self, from: u64, to: u64) -> bool {
        match self.interval {
            Some(interval) => from / interval != to / interval,
            None => false,
        }
    }
}

/// Event-sourced repository over an [`EventStore`], with optional snapshots.
///
/// When a [`UnitOfWork`] is attached, every saved aggregate is registered with it, so its
/// events are published once the unit of work commits. Snapshots are best effort: a
/// failing snapshot store is logged and never fails a save whose events were stored.
pub struct EventSourcedRepository<A>
where
    A: Aggregate,
{
    events: Arc<dyn EventStore>,
    snapshots: Option<(Arc<dyn SnapshotStore>, SnapshotPolicy)>,
    unit_of_work: Option<Arc<UnitOfWork>>,
    marker: PhantomData<fn() -> A>,
}

impl<A> Clone for EventSourcedRepository<A>
where
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
            snapshots: self.snapshots.clone(),
            unit_of_work: self.unit_of_work.clone(),
            marker: PhantomData,
        }
    }
}

impl<A> EventSourcedRepository<A>
where
    A: Aggregate,
{
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self {
            events,
            snapshots: None,
            unit_of_work: None,
            marker: PhantomData,
        }
    }

    pub fn with_snapshots(mut self, store: Arc<dyn SnapshotStore>, policy: SnapshotPolicy) -> Self {
        self.snapshots = Some((store, policy));
        self
    }

    pub fn with_unit_of_work(mut self, unit_of_work: Arc<UnitOfWork>) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self
    }

    async fn restore(&self, id: Uuid) -> Result<Option<(A::State, u64)>> {
        let Some((store, _)) = &self.snapshots else {
            return Ok(None);
        };
        let Some(snapshot) = store.load_snapshot(id).await? else {
            return Ok(None);
        };

        let state = snapshot.restore::<A::State>()?;
        tracing::debug!(aggregate_id = %id, version = snapshot.version, "restored snapshot");
        Ok(Some((state, snapshot.version)))
    }

    async fn snapshot_if_due(&self, root: &AggregateRoot<A::State>, from: u64) -> Result<()> {
        let Some((store, policy)) = &self.snapshots else {
            return Ok(());
        };
        if !policy.should_snapshot(from, root.version()) {
            return Ok(());
        }

        store
            .save_snapshot(AggregateSnapshot::new(root.state())?)
            .await?;
        tracing::debug!(aggregate_id = %root.id(), version = root.version(), "snapshot taken");
        Ok(())
    }
}

#[async_trait]
impl<A> Repository<A> for EventSourcedRepository<A>
where
    A: Aggregate,
{
    async fn save(&self, aggregate: &A) -> Result<()> {
        let root = aggregate.root();
        root.ensure_consistent()?;
        let id = root.id();
        let batch = root.ledger().unpersisted();

        let Some(first) = batch.first() else {
            tracing::debug!(aggregate_id = %id, "nothing to save");
            return Ok(());
        };
        let expected_version = first.version - 1;

        let stored = batch
            .iter()
            .map(|recorded| StoredEvent::new(id, recorded.version, &recorded.event))
            .collect::<Result<Vec<_>>>()?;

        self.events
            .save_events(id, expected_version, &stored)
            .await?;
        root.ledger().mark_persisted(stored.len());
        if let Some(unit_of_work) = &self.unit_of_work {
            unit_of_work.register(aggregate);
        }

        tracing::debug!(
            aggregate_id = %id,
            from = expected_version,
            to = root.version(),
            "aggregate saved"
        );

        // The events are stored at this point; a missing snapshot only lengthens replays.
        if let Err(error) = self.snapshot_if_due(root, expected_version).await {
            tracing::warn!(aggregate_id = %id, %error, "failed to take snapshot");
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<A> {
        let (state, from) = match self.restore(id).await? {
            Some((state, version)) => (Some(state), version),
            None => (None, 0),
        };

        let stored = self.events.load_events_after(id, from).await?;
        if stored.is_empty() && state.is_none() {
            return Err(CqrsError::AggregateNotFound(id));
        }

        let events = stored
            .iter()
            .map(StoredEvent::payload::<<A::State as AggregateState>::Event>)
            .collect::<Result<Vec<_>>>()?;

        let root = match state {
            Some(state) => AggregateRoot::from_snapshot(state, events)?,
            None => AggregateRoot::from_history(events)?,
        };

        if root.version() != from + stored.len() as u64 {
            return Err(CqrsError::StoreOperation {
                aggregate_id: id,
                source: anyhow::anyhow!(
                    "replayed {} events from version {} but reached version {}",
                    stored.len(),
                    from,
                    root.version()
                ),
            });
        }

        Ok(A::from_root(root))
    }
}
