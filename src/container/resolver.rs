use std::{
    fmt::{self, Debug, Display, Formatter},
    sync::Arc,
};

use uuid::Uuid;

use super::{ServiceContainer, ServiceKey, ServiceScope, descriptor::downcast, scope::WeakScope};
use crate::{CqrsError, Result};

/// The services being constructed, outermost first. Attached to construction errors.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolutionChain(Vec<ServiceKey>);

impl ResolutionChain {
    pub fn contains(&self, key: ServiceKey) -> bool {
        self.0.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn services(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(ServiceKey::name)
    }

    pub(crate) fn with(&self, key: ServiceKey) -> Self {
        let mut keys = self.0.clone();
        keys.push(key);
        Self(keys)
    }
}

impl Display for ResolutionChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        f.write_str(&self.services().collect::<Vec<_>>().join(" -> "))
    }
}

impl Debug for ResolutionChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// Handed to service factories to resolve their own dependencies.
///
/// A resolver built for a scoped or transient service resolves through the same scope,
/// so scoped dependencies are shared across the whole graph of one unit of work. A
/// resolver built for a singleton has no scope, and resolving a scoped service from it
/// fails.
///
/// The resolver only holds its scope weakly, so a service may keep its resolver for later
/// lookups without keeping the scope alive. Once the scope is gone those lookups fail with
/// [`CqrsError::ScopeDisposed`].
#[derive(Clone)]
pub struct Resolver {
    container: ServiceContainer,
    scope: Option<WeakScope>,
    chain: ResolutionChain,
}

impl Resolver {
    pub(crate) fn new(
        container: ServiceContainer,
        scope: Option<ServiceScope>,
        chain: ResolutionChain,
    ) -> Self {
        Self {
            container,
            scope: scope.as_ref().map(ServiceScope::downgrade),
            chain,
        }
    }

    pub async fn resolve<T>(&self) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = ServiceKey::of::<T>();
        let scope = self.live_scope(key)?;
        let instance = self
            .container
            .resolve_key(key, scope.as_ref(), &self.chain)
            .await?;
        downcast(key, &instance)
    }

    /// Resolves `T` when it is registered, `None` otherwise.
    pub async fn try_resolve<T>(&self) -> Result<Option<Arc<T>>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if !self.container.is_registered_key(ServiceKey::of::<T>()) {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    /// The scope this resolver builds for, while it is still alive.
    pub fn scope(&self) -> Option<ServiceScope> {
        self.scope.as_ref().and_then(WeakScope::upgrade)
    }

    pub fn scope_id(&self) -> Option<Uuid> {
        self.scope.as_ref().map(WeakScope::id)
    }

    pub fn chain(&self) -> &ResolutionChain {
        &self.chain
    }

    fn live_scope(&self, key: ServiceKey) -> Result<Option<ServiceScope>> {
        match &self.scope {
            None => Ok(None),
            Some(weak) => weak
                .upgrade()
                .map(Some)
                .ok_or(CqrsError::ScopeDisposed {
                    service: key.name(),
                    scope_id: weak.id(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Database;
    struct Repository;

    #[test]
    fn chain_renders_outermost_first() {
        let chain = ResolutionChain::default()
            .with(ServiceKey::of::<Repository>())
            .with(ServiceKey::of::<Database>());

        let rendered = chain.to_string();
        let repository = rendered.find("Repository").unwrap();
        let database = rendered.find("Database").unwrap();

        assert!(repository < database);
        assert!(rendered.contains(" -> "));
        assert!(chain.contains(ServiceKey::of::<Database>()));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn empty_chain_renders_as_root() {
        assert_eq!(ResolutionChain::default().to_string(), "<root>");
    }
}
