//! Enhancer factories.
//!
//! A factory turns a capability on an element into a constructed but not yet
//! initialized [`Enhancer`]. Factories are registered in a
//! [`FactoryRegistry`](crate::FactoryRegistry) and selected by the capability
//! they support.

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::capability::{Capability, CapabilityTag};
use crate::enhancer::{Enhancer, EnhancerContext};
use crate::error::{ResolutionError, ResolutionResult};

/// Produces enhancers for one capability tag.
#[async_trait]
pub trait EnhancerFactory: Send + Sync + Debug {
    /// Unique name used for registration and lookup.
    fn name(&self) -> &str;

    /// The tag this factory serves.
    fn tag(&self) -> CapabilityTag;

    /// Whether this factory can build an enhancer for `capability`.
    ///
    /// The default accepts every capability with a matching tag. Override to
    /// narrow by sub-discriminator.
    fn supports(&self, capability: &Capability) -> bool {
        capability.tag == self.tag()
    }

    /// Returns the priority of this factory (higher = preferred).
    fn priority(&self) -> i32 {
        0
    }

    /// Construct an uninitialized enhancer for `ctx`.
    async fn create(&self, ctx: &EnhancerContext) -> ResolutionResult<Arc<dyn Enhancer>>;
}

type BuildFn = dyn Fn(&EnhancerContext) -> ResolutionResult<Arc<dyn Enhancer>> + Send + Sync;

/// A factory backed by a plain constructor function.
///
/// # Example
///
/// ```rust,ignore
/// let factory = FnFactory::new("add-to-cart", CapabilityTag::Action, |ctx| {
///     Ok(Arc::new(AddToCart::new(ctx.element())) as Arc<dyn Enhancer>)
/// })
/// .for_discriminators(["add-to-cart"]);
/// ```
pub struct FnFactory {
    name: String,
    tag: CapabilityTag,
    discriminators: Vec<String>,
    priority: i32,
    build: Box<BuildFn>,
}

impl FnFactory {
    pub fn new<F>(name: impl Into<String>, tag: CapabilityTag, build: F) -> Self
    where
        F: Fn(&EnhancerContext) -> ResolutionResult<Arc<dyn Enhancer>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            tag,
            discriminators: Vec::new(),
            priority: 0,
            build: Box::new(build),
        }
    }

    /// Only accept capabilities whose sub-discriminator is one of `values`.
    pub fn for_discriminators<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discriminators = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl Debug for FnFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFactory")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("discriminators", &self.discriminators)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EnhancerFactory for FnFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> CapabilityTag {
        self.tag
    }

    fn supports(&self, capability: &Capability) -> bool {
        capability.tag == self.tag && matches_discriminator(&self.discriminators, capability)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn create(&self, ctx: &EnhancerContext) -> ResolutionResult<Arc<dyn Enhancer>> {
        (self.build)(ctx)
    }
}

type LoadFn = dyn Fn() -> BoxFuture<'static, Result<Arc<dyn EnhancerFactory>, String>> + Send + Sync;

/// A factory whose implementation is loaded on first use.
///
/// Dispatch (`supports`) answers from the declared tag and discriminators, so
/// the sweep never forces a load for capabilities that are not on the page.
/// A failed load surfaces as [`ResolutionError::LoadFailed`] and is retried on
/// the next resolution.
pub struct LazyFactory {
    name: String,
    tag: CapabilityTag,
    discriminators: Vec<String>,
    priority: i32,
    loader: Box<LoadFn>,
    loaded: OnceCell<Arc<dyn EnhancerFactory>>,
}

impl LazyFactory {
    pub fn new<F>(name: impl Into<String>, tag: CapabilityTag, loader: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Arc<dyn EnhancerFactory>, String>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            tag,
            discriminators: Vec::new(),
            priority: 0,
            loader: Box::new(loader),
            loaded: OnceCell::new(),
        }
    }

    pub fn for_discriminators<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discriminators = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the implementation has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    async fn load(&self) -> ResolutionResult<&Arc<dyn EnhancerFactory>> {
        self.loaded
            .get_or_try_init(|| async {
                tracing::debug!(factory = %self.name, tag = %self.tag, "loading enhancer implementation");
                (self.loader)().await.map_err(|reason| {
                    tracing::warn!(factory = %self.name, %reason, "enhancer implementation failed to load");
                    ResolutionError::LoadFailed {
                        factory: self.name.clone(),
                        reason,
                    }
                })
            })
            .await
    }
}

impl Debug for LazyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyFactory")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("discriminators", &self.discriminators)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EnhancerFactory for LazyFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> CapabilityTag {
        self.tag
    }

    fn supports(&self, capability: &Capability) -> bool {
        capability.tag == self.tag && matches_discriminator(&self.discriminators, capability)
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn create(&self, ctx: &EnhancerContext) -> ResolutionResult<Arc<dyn Enhancer>> {
        let factory = self.load().await?;
        factory.create(ctx).await
    }
}

fn matches_discriminator(accepted: &[String], capability: &Capability) -> bool {
    accepted.is_empty()
        || capability
            .discriminator()
            .is_some_and(|d| accepted.iter().any(|a| a == d))
}
