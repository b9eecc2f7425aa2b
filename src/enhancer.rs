//! The enhancer lifecycle contract.
//!
//! An enhancer is a behavior object bound to one element. The runtime only
//! ever drives it through [`Enhancer`]; it never looks inside.
//!
//! Lifecycle rules the runtime guarantees:
//! - `initialize()` is called at most once per instance.
//! - `destroy()` is called exactly once for every instance whose
//!   `initialize()` was attempted, on every teardown path.
//! - `update()`/`refresh()` are only called on bound (initialized) instances.

use std::any::Any;
use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::capability::{Capability, CapabilityTag};
use crate::error::{EnhancerResult, InitializationError};
use crate::host::{ElementId, Host};

/// What an enhancer knows about the element it is bound to.
#[derive(Clone)]
pub struct EnhancerContext {
    element: ElementId,
    capability: Capability,
    host: Arc<dyn Host>,
}

impl EnhancerContext {
    pub fn new(element: ElementId, capability: Capability, host: Arc<dyn Host>) -> Self {
        Self {
            element,
            capability,
            host,
        }
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn tag(&self) -> CapabilityTag {
        self.capability.tag
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.capability.discriminator()
    }

    /// Read an attribute of the bound element.
    pub fn attribute(&self, name: &str) -> Option<String> {
        self.host.attribute(self.element, name)
    }

    pub fn is_connected(&self) -> bool {
        self.host.is_connected(self.element)
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }
}

impl Debug for EnhancerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnhancerContext")
            .field("element", &self.element)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

/// Behavior bound to one element.
///
/// Methods take `&self`; implementations keep their mutable state behind
/// their own interior mutability so the runtime can share the instance with
/// external producers calling `update()`/`refresh()`.
///
/// # Example
///
/// ```rust
/// use enliven::prelude::*;
/// use std::any::Any;
/// use std::sync::Mutex;
///
/// #[derive(Debug, Default)]
/// struct PriceDisplay {
///     path: Mutex<Option<String>>,
/// }
///
/// #[async_trait]
/// impl Enhancer for PriceDisplay {
///     fn name(&self) -> &str {
///         "price-display"
///     }
///
///     async fn initialize(&self, ctx: &EnhancerContext) -> EnhancerResult<()> {
///         let path = ctx
///             .attribute("data-next-display")
///             .ok_or_else(|| EnhancerError::MissingAttribute("data-next-display".into()))?;
///         *self.path.lock().unwrap() = Some(path);
///         Ok(())
///     }
///
///     fn destroy(&self) {
///         self.path.lock().unwrap().take();
///     }
///
///     fn as_any(&self) -> &dyn Any {
///         self
///     }
/// }
/// ```
#[async_trait]
pub trait Enhancer: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Attach to the element. May suspend (attribute reads, subscriptions,
    /// resource fetches, first render).
    async fn initialize(&self, ctx: &EnhancerContext) -> EnhancerResult<()>;

    /// A named piece of shared state changed (e.g. `"cart"`).
    async fn update(&self, _topic: &str) -> EnhancerResult<()> {
        Ok(())
    }

    /// Re-render from current state.
    async fn refresh(&self) -> EnhancerResult<()> {
        Ok(())
    }

    /// Release every subscription and timer created since `initialize()`.
    /// Must be idempotent.
    fn destroy(&self);

    /// Downcast to concrete type for advanced usage.
    fn as_any(&self) -> &dyn Any;
}

/// Extension trait for enhancer type checking.
pub trait EnhancerExt: Enhancer {
    /// Check if this enhancer is of type T.
    fn is<T: Enhancer + 'static>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast to type T.
    fn downcast_ref<T: Enhancer + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl<E: Enhancer + ?Sized> EnhancerExt for E {}

/// Runtime-side wrapper enforcing the lifecycle rules around one instance.
#[derive(Debug)]
pub(crate) struct ManagedEnhancer {
    element: ElementId,
    capability: Capability,
    inner: Arc<dyn Enhancer>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
}

impl ManagedEnhancer {
    pub(crate) fn new(element: ElementId, capability: Capability, inner: Arc<dyn Enhancer>) -> Self {
        Self {
            element,
            capability,
            inner,
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub(crate) fn capability(&self) -> &Capability {
        &self.capability
    }

    pub(crate) fn inner(&self) -> &Arc<dyn Enhancer> {
        &self.inner
    }

    /// Run `initialize()` once. Errors and panics become
    /// [`InitializationError`].
    pub(crate) async fn initialize(&self, ctx: &EnhancerContext) -> Result<(), InitializationError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(InitializationError::AlreadyInitialized {
                element: self.element,
                enhancer: self.inner.name().to_string(),
            });
        }
        match AssertUnwindSafe(self.inner.initialize(ctx)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(InitializationError::Failed {
                element: self.element,
                enhancer: self.inner.name().to_string(),
                source,
            }),
            Err(payload) => Err(InitializationError::Panicked {
                element: self.element,
                enhancer: self.inner.name().to_string(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Call `destroy()` on the instance if it has not been destroyed yet.
    /// Returns whether this call performed the destroy.
    pub(crate) fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if std::panic::catch_unwind(AssertUnwindSafe(|| self.inner.destroy())).is_err() {
            tracing::error!(
                element = %self.element,
                tag = %self.capability.tag,
                enhancer = self.inner.name(),
                "enhancer panicked during destroy"
            );
        }
        true
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for ManagedEnhancer {
    /// An instance abandoned mid-initialization (its bind task was aborted)
    /// still gets its `destroy()`.
    fn drop(&mut self) {
        if self.initialized.load(Ordering::Acquire) && self.destroy() {
            tracing::debug!(element = %self.element, tag = %self.capability.tag, "abandoned enhancer destroyed");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
