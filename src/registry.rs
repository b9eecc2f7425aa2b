//! Registry for enhancer factories.
//!
//! The `FactoryRegistry` maps capabilities to factories. It is populated at
//! startup and read-only afterwards; on-demand loading is an implementation
//! detail of individual factories (see [`LazyFactory`](crate::LazyFactory)).

use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::Capability;
use crate::enhancer::{Enhancer, EnhancerContext};
use crate::error::{RegistryError, RegistryResult, ResolutionError, ResolutionResult};
use crate::factory::EnhancerFactory;

/// A registry for managing enhancer factories.
///
/// The registry stores factories and provides methods for:
/// - Registration by name
/// - Lookup by name
/// - Selection by capability, honoring priority
/// - Resolving a capability on an element into an enhancer instance
///
/// # Example
///
/// ```rust
/// use enliven::prelude::*;
/// use std::sync::Arc;
///
/// # #[derive(Debug)] struct Noop;
/// # #[async_trait]
/// # impl Enhancer for Noop {
/// #     fn name(&self) -> &str { "noop" }
/// #     async fn initialize(&self, _: &EnhancerContext) -> EnhancerResult<()> { Ok(()) }
/// #     fn destroy(&self) {}
/// #     fn as_any(&self) -> &dyn std::any::Any { self }
/// # }
/// let mut registry = FactoryRegistry::new();
/// registry.register(Arc::new(FnFactory::new("display", CapabilityTag::Display, |_| {
///     Ok(Arc::new(Noop) as Arc<dyn Enhancer>)
/// })));
///
/// assert!(registry.get("display").is_some());
/// assert!(registry.find_best(&Capability::new(CapabilityTag::Display)).is_some());
/// ```
#[derive(Debug, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn EnhancerFactory>>,
    ordered: Vec<String>,
}

impl FactoryRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its name, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn EnhancerFactory>) {
        let name = factory.name().to_string();
        if !self.factories.contains_key(&name) {
            self.ordered.push(name.clone());
        }
        self.factories.insert(name, factory);
    }

    /// Register a factory, returning an error if the name is taken or blank.
    pub fn register_unique(&mut self, factory: Arc<dyn EnhancerFactory>) -> RegistryResult<()> {
        let name = factory.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName(name));
        }
        if self.factories.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.ordered.push(name.clone());
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Get a factory by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn EnhancerFactory>> {
        self.factories.get(name)
    }

    /// Find the best factory for `capability`.
    ///
    /// Highest priority wins; among equal priorities the earliest registered.
    pub fn find_best(&self, capability: &Capability) -> Option<&Arc<dyn EnhancerFactory>> {
        self.iter()
            .filter(|f| f.supports(capability))
            .fold(None, |best: Option<&Arc<dyn EnhancerFactory>>, f| match best {
                Some(b) if b.priority() >= f.priority() => Some(b),
                _ => Some(f),
            })
    }

    /// Find all factories that support `capability`, in registration order.
    pub fn find_all(&self, capability: &Capability) -> Vec<&Arc<dyn EnhancerFactory>> {
        self.iter().filter(|f| f.supports(capability)).collect()
    }

    /// Resolve the context's capability into a constructed, uninitialized
    /// enhancer.
    pub async fn resolve(&self, ctx: &EnhancerContext) -> ResolutionResult<Arc<dyn Enhancer>> {
        let factory = self
            .find_best(ctx.capability())
            .ok_or_else(|| ResolutionError::Unresolved {
                element: ctx.element(),
                capability: ctx.capability().to_string(),
            })?;
        factory.create(ctx).await
    }

    /// Check if a factory with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Remove a factory by name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn EnhancerFactory>> {
        self.ordered.retain(|n| n != name);
        self.factories.remove(name)
    }

    /// Get the names of all registered factories.
    pub fn names(&self) -> Vec<&str> {
        self.ordered.iter().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Iterate over all factories in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EnhancerFactory>> {
        self.ordered.iter().filter_map(move |name| self.factories.get(name))
    }
}

/// Builder for creating factory registries with fluent API.
#[derive(Debug, Default)]
pub struct FactoryRegistryBuilder {
    registry: FactoryRegistry,
}

impl FactoryRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory to the registry.
    pub fn with(mut self, factory: impl EnhancerFactory + 'static) -> Self {
        self.registry.register(Arc::new(factory));
        self
    }

    pub fn build(self) -> FactoryRegistry {
        self.registry
    }
}
