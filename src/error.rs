use std::fmt::{self, Display, Formatter};

use thiserror::Error;
use uuid::Uuid;

use crate::container::ResolutionChain;

#[derive(Error, Debug)]
pub enum CqrsError {
    #[error("Service `{service}` is not registered")]
    ServiceNotRegistered { service: &'static str },

    #[error("Service `{service}` is already registered")]
    DuplicateRegistration { service: &'static str },

    #[error("Scoped service `{service}` cannot be resolved outside of a scope")]
    ScopedServiceOutsideScope { service: &'static str },

    #[error("Cannot resolve `{service}`: scope {scope_id} has been disposed")]
    ScopeDisposed { service: &'static str, scope_id: Uuid },

    #[error("Circular dependency detected: {chain}")]
    CircularDependency { chain: ResolutionChain },

    #[error("Failed to construct `{service}` (resolution chain: {chain}): {source}")]
    ServiceConstruction {
        service: &'static str,
        chain: ResolutionChain,
        #[source]
        source: anyhow::Error,
    },

    #[error("No handler registered for `{message}`")]
    HandlerNotFound { message: &'static str },

    #[error("{} handlers registered for `{message}`: {}", .handlers.len(), .handlers.join(", "))]
    AmbiguousHandler {
        message: &'static str,
        handlers: Vec<&'static str>,
    },

    #[error("Pipeline produced a response of the wrong type for `{message}`")]
    ResponseTypeMismatch { message: &'static str },

    #[error("{} notification handler(s) failed: {}", .0.len(), summarize(.0))]
    HandlerFailures(Vec<HandlerFailure>),

    #[error("Failed to deserialize event payload: {0}")]
    PayloadDeserialization(#[from] serde_json::Error),

    #[error("Event store operation failed for aggregate {aggregate_id}: {source}")]
    StoreOperation {
        aggregate_id: Uuid,
        #[source]
        source: anyhow::Error,
    },

    #[error("Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}")]
    Concurrency {
        aggregate_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("Aggregate '{0}' not found")]
    AggregateNotFound(Uuid),

    #[error("Event `{event_type}` moved aggregate {aggregate_id} from version {from} to {to}, expected a single step")]
    VersionInvariant {
        aggregate_id: Uuid,
        event_type: &'static str,
        from: u64,
        to: u64,
    },

    #[error("Snapshot operation failed: {0}")]
    Snapshot(String),

    #[error("Generic CQRS error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl CqrsError {
    /// Returns `true` for the one error callers are expected to recover from by reloading.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, CqrsError::Concurrency { .. })
    }

    /// Failures collected while publishing, empty for every other variant.
    pub fn handler_failures(&self) -> &[HandlerFailure] {
        match self {
            CqrsError::HandlerFailures(failures) => failures,
            _ => &[],
        }
    }
}

/// A notification handler that failed while a notification was being published.
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub notification: &'static str,
    pub error: CqrsError,
}

impl HandlerFailure {
    pub fn new(handler: &'static str, notification: &'static str, error: CqrsError) -> Self {
        Self {
            handler,
            notification,
            error,
        }
    }
}

impl Display for HandlerFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` failed handling `{}`: {}",
            self.handler, self.notification, self.error
        )
    }
}

fn summarize(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// Result alias within the library
pub type Result<T, E = CqrsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_handler_lists_every_candidate() {
        let err = CqrsError::AmbiguousHandler {
            message: "CreateOrder",
            handlers: vec!["FirstHandler", "SecondHandler"],
        };
        assert_eq!(
            err.to_string(),
            "2 handlers registered for `CreateOrder`: FirstHandler, SecondHandler"
        );
    }

    #[test]
    fn handler_failures_are_summarized_in_order() {
        let err = CqrsError::HandlerFailures(vec![
            HandlerFailure::new("Mailer", "OrderCreated", anyhow::anyhow!("smtp down").into()),
            HandlerFailure::new("Audit", "OrderCreated", anyhow::anyhow!("disk full").into()),
        ]);

        let rendered = err.to_string();
        assert!(rendered.starts_with("2 notification handler(s) failed"));
        let mailer = rendered.find("Mailer").unwrap();
        let audit = rendered.find("Audit").unwrap();
        assert!(mailer < audit);
        assert_eq!(err.handler_failures().len(), 2);
    }

    #[test]
    fn only_concurrency_errors_are_conflicts() {
        let conflict = CqrsError::Concurrency {
            aggregate_id: Uuid::nil(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_concurrency_conflict());
        assert!(!CqrsError::AggregateNotFound(Uuid::nil()).is_concurrency_conflict());
    }

    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<CqrsError>();
        }
    };
}
