//! # MiniCQRS/DI
//!
//! A small CQRS/ES framework built around three pieces:
//!
//! * a lifetime-aware service container ([`ServiceCollection`], [`ServiceContainer`],
//!   [`ServiceScope`]) resolving singleton, scoped and transient services;
//! * a [`Mediator`] routing requests to exactly one handler and notifications to any number
//!   of handlers, each notification handler running in its own scope, with a chain of
//!   [`PipelineBehavior`]s around every invocation;
//! * event-sourced aggregates ([`AggregateRoot`], [`AggregateState`]) persisted through an
//!   [`EventSourcedRepository`] with optimistic concurrency, and a [`UnitOfWork`] that
//!   publishes recorded events only after they were stored.
//!
//! The container and the mediator know nothing about aggregates; the event-sourcing layer
//! sits on top of them.

pub mod aggregate;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod mediator;
pub mod repository;
pub mod telemetry;
pub mod uow;

pub use aggregate::{
    Aggregate, AggregateRoot, AggregateState, DomainEvent, EventLedger, PendingEvents,
    RecordedEvent,
    snapshot::{AggregateSnapshot, InMemorySnapshotStore, SnapshotStore},
};
pub use config::{CqrsConfig, FailurePolicy, MediatorConfig, PublishStrategy, RegistrationPolicy};
pub use container::{
    Dispose, Lifetime, ResolutionChain, Resolver, ServiceCollection, ServiceContainer,
    ServiceDescriptor, ServiceKey, ServiceScope,
};
pub use error::{CqrsError, HandlerFailure, Result};
pub use events::{EventStore, InMemoryEventStore, StoredEvent};
pub use mediator::{
    AnyNotification, LoggingBehavior, Mediator, MediatorBuilder, MessageContext, MessageKind,
    Next, Notification, NotificationHandler, PipelineBehavior, PipelineResult, Request,
    RequestHandler,
};
pub use repository::{EventSourcedRepository, Repository, SnapshotPolicy};
pub use uow::{UnitOfWork, UnitOfWorkBehavior};

pub use async_trait::async_trait;
pub use uuid::Uuid;
