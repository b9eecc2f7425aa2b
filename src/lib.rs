//! # Enliven
//!
//! **Enliven** is a declarative element enhancement runtime. Markup authors
//! annotate elements with marker attributes (`data-next-display`,
//! `data-next-action`, ...); the runtime discovers them, binds one behavior
//! object ("enhancer") per capability, and keeps those bindings correct while
//! the tree mutates underneath it.
//!
//! ## Overview
//!
//! - **ElementClassifier**: element + attributes → ordered capability tags
//! - **EnhancerFactory**: capability → uninitialized enhancer, possibly loaded on demand
//! - **ChangeObserver**: filtered, normalized, debounced subtree mutations
//! - **EnhancementRuntime**: sweep, binding registry, steady-state reactivity, teardown
//! - **Enhancer**: the lifecycle contract every feature module implements
//!
//! ## Layer Structure
//!
//! ```text
//! runtime      - EnhancementRuntime (orchestrator, only stateful component)
//! observer     - ChangeObserver (debounce + filtering)
//! registry     - FactoryRegistry, EnhancerFactory (resolution)
//! classifier   - ElementClassifier, MarkerVocabulary (pure)
//! host         - Document + MutationSource contracts, MemoryDocument
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use enliven::prelude::*;
//!
//! let runtime = EnhancementRuntime::builder(host)
//!     .factory(FnFactory::new("display", CapabilityTag::Display, |_| {
//!         Ok(Arc::new(Display::default()) as Arc<dyn Enhancer>)
//!     }))
//!     .factory(LazyFactory::new("checkout", CapabilityTag::Action, load_checkout)
//!         .for_discriminators(["checkout"]))
//!     .build()?;
//!
//! runtime.start().await?;
//! runtime.notify("cart").await;
//! ```

mod bindings;
mod capability;
mod classifier;
mod config;
mod enhancer;
mod error;
mod factory;
mod markers;
mod observer;
mod registry;
mod runtime;

pub mod host;
pub mod stream;

pub mod prelude;

// Re-export core types
pub use bindings::BindingSnapshot;
pub use capability::{Capability, CapabilityTag};
pub use classifier::{Classification, ElementClassifier, Exclusion};
pub use config::{RuntimeConfig, DEFAULT_BATCH_SIZE, DEFAULT_DEBOUNCE};
pub use enhancer::{Enhancer, EnhancerContext, EnhancerExt};
pub use error::{
    ClassificationError, ClassificationResult, ConfigError, DocumentError, DocumentResult, EnhancerError,
    EnhancerResult, InitializationError, ObserverStartError, RegistryError, RegistryResult, ResolutionError,
    ResolutionResult, RuntimeError, RuntimeResult,
};
pub use factory::{EnhancerFactory, FnFactory, LazyFactory};
pub use host::{Document, ElementId, Host, MutationSource};
pub use markers::{has_placeholder, MarkerVocabulary, DEFAULT_PREFIX};
pub use observer::{ChangeDelivery, ChangeObserver, MutationEvent, MutationKind, ObserverStatus};
pub use registry::{FactoryRegistry, FactoryRegistryBuilder};
pub use runtime::{
    DispatchReport, EnhancementRuntime, RuntimeBuilder, RuntimeEvent, RuntimeState, RuntimeStats, SweepReport,
};
pub use stream::{EventHub, EventSender, EventStream, StreamBuilder};

// Re-export async-trait for convenience
pub use async_trait::async_trait;
