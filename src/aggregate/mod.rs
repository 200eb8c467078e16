use std::{fmt::Debug, sync::Arc};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};

use crate::{AnyNotification, CqrsError, Result, Uuid};

pub mod snapshot;

/// The `DomainEvent` trait describes the closed set of events an aggregate can record.
///
/// It is usually implemented on an enum through [`domain_event!`](crate::domain_event), with
/// one variant per event kind wrapping the payload that handlers observe.
pub trait DomainEvent: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of the event kind, stored next to the payload.
    fn event_type(&self) -> &'static str;

    /// Unwraps the payload as a notification ready to be published.
    fn into_notification(self) -> Box<dyn AnyNotification>;
}

/// The `AggregateState` trait holds the persisted fields of one aggregate.
///
/// State is created with `Default` and changed only by [`AggregateState::apply`], which
/// dispatches on the event variant. `apply` must:
///
/// * bump the version by exactly one, and nothing else may touch the version;
/// * be deterministic: no clock, no randomness, no I/O. Replaying the same events must
///   produce the same state.
pub trait AggregateState:
    Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Event: DomainEvent;

    fn aggregate_id(&self) -> Uuid;

    fn version(&self) -> u64;

    fn apply(&mut self, event: &Self::Event);
}

/// An event recorded by an aggregate, with the version it moved the aggregate to.
#[derive(Clone, Debug)]
pub struct RecordedEvent<E> {
    pub version: u64,
    pub event: E,
}

/// Uncommitted events of one aggregate, shared between the aggregate and the unit of work
/// tracking it.
#[derive(Debug)]
pub struct EventLedger<E> {
    state: Mutex<LedgerState<E>>,
}

#[derive(Debug)]
struct LedgerState<E> {
    aggregate_id: Uuid,
    events: Vec<RecordedEvent<E>>,
    // Leading events already appended to the event store.
    persisted: usize,
}

impl<E> EventLedger<E>
where
    E: DomainEvent,
{
    fn new(aggregate_id: Uuid) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                aggregate_id,
                events: Vec::new(),
                persisted: 0,
            }),
        }
    }

    fn record(&self, aggregate_id: Uuid, version: u64, event: E) {
        let mut state = self.state.lock();
        state.aggregate_id = aggregate_id;
        state.events.push(RecordedEvent { version, event });
    }

    pub fn events(&self) -> Vec<E> {
        self.state
            .lock()
            .events
            .iter()
            .map(|recorded| recorded.event.clone())
            .collect()
    }

    /// Events not yet appended to the event store.
    pub fn unpersisted(&self) -> Vec<RecordedEvent<E>> {
        let state = self.state.lock();
        state.events[state.persisted..].to_vec()
    }

    /// Marks the next `count` unpersisted events as stored.
    pub fn mark_persisted(&self, count: usize) {
        let mut state = self.state.lock();
        state.persisted = (state.persisted + count).min(state.events.len());
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.events.clear();
        state.persisted = 0;
    }
}

/// Type-erased view of an [`EventLedger`], used by the unit of work.
pub trait PendingEvents: Send + Sync {
    fn aggregate_id(&self) -> Uuid;

    fn pending(&self) -> usize;

    /// Takes the uncommitted events already appended to the event store, in recording
    /// order, as notifications. Events recorded after the last save stay pending.
    fn drain(&self) -> Vec<Box<dyn AnyNotification>>;
}

impl<E> PendingEvents for EventLedger<E>
where
    E: DomainEvent,
{
    fn aggregate_id(&self) -> Uuid {
        self.state.lock().aggregate_id
    }

    fn pending(&self) -> usize {
        self.state.lock().events.len()
    }

    fn drain(&self) -> Vec<Box<dyn AnyNotification>> {
        let events: Vec<_> = {
            let mut state = self.state.lock();
            let persisted = std::mem::take(&mut state.persisted);
            state.events.drain(..persisted).collect()
        };

        events
            .into_iter()
            .map(|recorded| recorded.event.into_notification())
            .collect()
    }
}

/// The `AggregateRoot` owns the state of one aggregate and the events it recorded.
///
/// Business operations live on the domain type wrapping the root (see [`Aggregate`]); they
/// validate their input and call [`AggregateRoot::record`], which is the only way state
/// changes.
#[derive(Debug)]
pub struct AggregateRoot<S>
where
    S: AggregateState,
{
    state: S,
    ledger: Arc<EventLedger<S::Event>>,
    // Set when an `apply` broke the version step; the state is no longer trustworthy.
    poisoned: Option<VersionBreak>,
}

#[derive(Clone, Copy, Debug)]
struct VersionBreak {
    event_type: &'static str,
    from: u64,
    to: u64,
}

impl<S> AggregateRoot<S>
where
    S: AggregateState,
{
    /// A root with default state, ready for its creation event.
    pub fn new() -> Self {
        Self::with_state(S::default())
    }

    /// Rebuilds a root by replaying `events` against a fresh state.
    pub fn from_history<I>(events: I) -> Result<Self>
    where
        I: IntoIterator<Item = S::Event>,
    {
        Self::from_snapshot(S::default(), events)
    }

    /// Rebuilds a root from a restored state and the events recorded after it.
    pub fn from_snapshot<I>(state: S, events: I) -> Result<Self>
    where
        I: IntoIterator<Item = S::Event>,
    {
        let mut root = Self::with_state(state);
        for event in events {
            root.apply_checked(&event)?;
        }
        root.ledger = Arc::new(EventLedger::new(root.id()));
        Ok(root)
    }

    fn with_state(state: S) -> Self {
        let ledger = Arc::new(EventLedger::new(state.aggregate_id()));
        Self {
            state,
            ledger,
            poisoned: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.state.aggregate_id()
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Applies `event` to the state and appends it to the uncommitted events.
    ///
    /// Fails with [`CqrsError::VersionInvariant`] when the state's `apply` did not advance
    /// the version by exactly one. The event is not recorded, but `apply` has already run,
    /// so the root is poisoned: every later `record`, and every repository save, fails with
    /// the same error. Reload the aggregate from its store to continue.
    pub fn record(&mut self, event: S::Event) -> Result<()> {
        self.ensure_consistent()?;
        self.apply_checked(&event)?;
        self.ledger.record(self.id(), self.version(), event);
        Ok(())
    }

    pub fn uncommitted_events(&self) -> Vec<S::Event> {
        self.ledger.events()
    }

    pub fn has_uncommitted_events(&self) -> bool {
        self.ledger.pending() > 0
    }

    pub fn clear_uncommitted_events(&self) {
        self.ledger.clear();
    }

    pub fn ledger(&self) -> &Arc<EventLedger<S::Event>> {
        &self.ledger
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Fails when an earlier `record` left the state inconsistent.
    pub fn ensure_consistent(&self) -> Result<()> {
        match self.poisoned {
            Some(VersionBreak {
                event_type,
                from,
                to,
            }) => Err(CqrsError::VersionInvariant {
                aggregate_id: self.state.aggregate_id(),
                event_type,
                from,
                to,
            }),
            None => Ok(()),
        }
    }

    fn apply_checked(&mut self, event: &S::Event) -> Result<()> {
        let from = self.state.version();
        self.state.apply(event);
        let to = self.state.version();

        if to != from + 1 {
            self.poisoned = Some(VersionBreak {
                event_type: event.event_type(),
                from,
                to,
            });
            return self.ensure_consistent();
        }
        Ok(())
    }
}

impl<S> Default for AggregateRoot<S>
where
    S: AggregateState,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A domain type built around an [`AggregateRoot`].
///
/// Repositories and the unit of work only need to reach the root; everything else (the
/// business operations) is up to the implementor.
pub trait Aggregate: Send + Sync + 'static {
    type State: AggregateState;

    fn from_root(root: AggregateRoot<Self::State>) -> Self;

    fn root(&self) -> &AggregateRoot<Self::State>;
}

impl<S> Aggregate for AggregateRoot<S>
where
    S: AggregateState,
{
    type State = S;

    fn from_root(root: AggregateRoot<S>) -> Self {
        root
    }

    fn root(&self) -> &AggregateRoot<S> {
        self
    }
}

/// The `domain_event!` macro declares an event enum whose variants wrap notification payloads.
///
/// It implements [`DomainEvent`] for the enum, [`Notification`](crate::Notification) for
/// every payload, and `From<Payload>` for the enum. The enum's derives are up to the caller
/// and must include `Clone`, `Debug`, `Serialize` and `Deserialize`.
///
/// # Example
///
/// ```rust
/// use mini_cqrs_di::{domain_event, Uuid};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// pub struct Opened { pub account_id: Uuid }
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// pub struct Deposited { pub account_id: Uuid, pub amount: u64 }
///
/// domain_event! {
///     #[derive(Clone, Debug, Serialize, Deserialize)]
///     pub enum AccountEvent {
///         Opened(Opened),
///         Deposited(Deposited),
///     }
/// }
/// ```
#[macro_export]
macro_rules! domain_event {
    (
        $(#[$meta:meta])*
        $vis:vis enum $Name:ident {
            $($Variant:ident($Payload:ty)),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $Name {
            $($Variant($Payload),)*
        }

        impl $crate::DomainEvent for $Name {
            fn event_type(&self) -> &'static str {
                match self {
                    $($Name::$Variant(_) => stringify!($Variant),)*
                }
            }

            fn into_notification(self) -> ::std::boxed::Box<dyn $crate::AnyNotification> {
                match self {
                    $($Name::$Variant(payload) => ::std::boxed::Box::new(payload),)*
                }
            }
        }

        $(
            impl $crate::Notification for $Payload {}

            impl ::std::convert::From<$Payload> for $Name {
                fn from(payload: $Payload) -> Self {
                    $Name::$Variant(payload)
                }
            }
        )*
    };
}
