//! Prelude module for convenient imports.
//!
//! This module re-exports the types most enhancer and embedding code needs
//! for convenient glob imports.
//!
//! # Example
//!
//! ```rust
//! use enliven::prelude::*;
//! ```

// Enhancer contract
pub use crate::enhancer::{Enhancer, EnhancerContext, EnhancerExt};

// Capabilities and classification
pub use crate::capability::{Capability, CapabilityTag};
pub use crate::classifier::{Classification, ElementClassifier, Exclusion};
pub use crate::markers::MarkerVocabulary;

// Factories
pub use crate::factory::{EnhancerFactory, FnFactory, LazyFactory};
pub use crate::registry::{FactoryRegistry, FactoryRegistryBuilder};

// Runtime
pub use crate::config::RuntimeConfig;
pub use crate::runtime::{EnhancementRuntime, RuntimeEvent, RuntimeState, RuntimeStats, SweepReport};

// Host
pub use crate::host::{Document, ElementId, Host, MutationSource};

// Streams
pub use crate::stream::{EventSender, EventStream, StreamBuilder};

// Errors
pub use crate::error::{
    ClassificationError, EnhancerError, EnhancerResult, InitializationError, ObserverStartError, ResolutionError,
    ResolutionResult, RuntimeError, RuntimeResult,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
