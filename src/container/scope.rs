use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use uuid::Uuid;

use super::{
    ResolutionChain, ServiceContainer, ServiceKey,
    descriptor::{Disposer, Instance, TrackedInstance, downcast, release_all},
};
use crate::{CqrsError, Result};

/// One unit of work: a request, or one dispatched notification.
///
/// Scoped services are built at most once per scope and shared by everything resolved
/// through it. [`ServiceScope::dispose`] runs the release hooks of the services the scope
/// built, in reverse construction order. A scope is meant to be driven by a single task;
/// clones are handles to the same scope.
#[derive(Clone)]
pub struct ServiceScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: Uuid,
    container: ServiceContainer,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    disposed: bool,
    instances: HashMap<ServiceKey, Instance>,
    tracked: Vec<TrackedInstance>,
}

enum Adoption {
    Stored,
    Existing(Instance),
    Disposed,
}

impl ServiceScope {
    pub(crate) fn new(container: ServiceContainer) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(scope_id = %id, "scope created");

        Self {
            inner: Arc::new(ScopeInner {
                id,
                container,
                state: Mutex::new(ScopeState::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.inner.container
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub async fn resolve<T>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        let instance = self
            .inner
            .container
            .resolve_key(key, Some(self), &ResolutionChain::default())
            .await?;
        downcast(key, &instance)
    }

    /// Resolves `T` when it is registered, `None` otherwise.
    pub async fn try_resolve<T>(&self) -> Result<Option<Arc<T>>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if !self.inner.container.is_registered_key(ServiceKey::of::<T>()) {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    /// The scoped `T` this scope has already built, if any. Never constructs anything.
    pub fn existing<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        let instance = self.inner.state.lock().instances.get(&key).cloned()?;
        downcast(key, &instance).ok()
    }

    /// Releases every tracked service, newest first. Calling it again is a no-op.
    pub async fn dispose(&self) {
        let (instances, tracked) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (
                std::mem::take(&mut state.instances),
                std::mem::take(&mut state.tracked),
            )
        };
        drop(instances);

        tracing::debug!(scope_id = %self.id(), pending = tracked.len(), "disposing scope");
        release_all(format!("scope {}", self.id()), tracked).await;
    }

    pub(crate) fn ensure_active(&self, key: ServiceKey) -> Result<()> {
        if self.is_disposed() {
            return Err(self.disposed_error(key));
        }
        Ok(())
    }

    pub(crate) fn cached(&self, key: ServiceKey) -> Result<Option<Instance>> {
        let state = self.inner.state.lock();
        if state.disposed {
            return Err(self.disposed_error(key));
        }
        Ok(state.instances.get(&key).cloned())
    }

    /// Stores a freshly built scoped instance. When another resolution stored one first,
    /// that one wins and the new instance is released.
    pub(crate) async fn adopt(
        &self,
        key: ServiceKey,
        instance: Instance,
        disposer: Option<&Disposer>,
    ) -> Result<Instance> {
        let adoption = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                Adoption::Disposed
            } else if let Some(existing) = state.instances.get(&key) {
                Adoption::Existing(existing.clone())
            } else {
                state.instances.insert(key, instance.clone());
                if let Some(disposer) = disposer {
                    state.tracked.push(TrackedInstance::new(
                        key,
                        instance.clone(),
                        disposer.clone(),
                    ));
                }
                Adoption::Stored
            }
        };

        let orphan = disposer.map(|d| TrackedInstance::new(key, instance.clone(), d.clone()));
        match adoption {
            Adoption::Stored => Ok(instance),
            Adoption::Existing(existing) => {
                if let Some(orphan) = orphan {
                    release_all(format!("scope {}", self.id()), vec![orphan]).await;
                }
                Ok(existing)
            }
            Adoption::Disposed => {
                if let Some(orphan) = orphan {
                    release_all(format!("scope {}", self.id()), vec![orphan]).await;
                }
                Err(self.disposed_error(key))
            }
        }
    }

    /// Tracks a transient instance built through this scope for release.
    pub(crate) async fn track(&self, tracked: TrackedInstance) -> Result<()> {
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                Some(tracked)
            } else {
                state.tracked.push(tracked);
                None
            }
        };

        match rejected {
            None => Ok(()),
            Some(tracked) => {
                let key = tracked.key;
                release_all(format!("scope {}", self.id()), vec![tracked]).await;
                Err(self.disposed_error(key))
            }
        }
    }

    fn disposed_error(&self, key: ServiceKey) -> CqrsError {
        CqrsError::ScopeDisposed {
            service: key.name(),
            scope_id: self.id(),
        }
    }
}

/// A handle that does not keep its scope alive, held by resolvers.
#[derive(Clone)]
pub(crate) struct WeakScope {
    id: Uuid,
    inner: Weak<ScopeInner>,
}

impl WeakScope {
    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<ServiceScope> {
        self.inner.upgrade().map(|inner| ServiceScope { inner })
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.instances.clear();

        let tracked = std::mem::take(&mut state.tracked);
        if tracked.is_empty() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(scope_id = %self.id, pending = tracked.len(), "scope dropped without disposal, releasing in background");
                handle.spawn(release_all(format!("scope {}", self.id), tracked));
            }
            Err(_) => {
                tracing::warn!(scope_id = %self.id, pending = tracked.len(), "scope dropped outside a tokio runtime without disposal, release hooks skipped");
            }
        }
    }
}
