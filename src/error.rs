//! Error types for Enliven.
//!
//! The taxonomy mirrors how far a failure is allowed to reach. Classification,
//! resolution and initialization errors are contained to one element (or one
//! tag on one element) and only ever show up in logs and runtime events.
//! Observer start failures and configuration errors are the only ones that
//! surface from public runtime operations.

use thiserror::Error;

use crate::host::ElementId;

/// Root error type for runtime-level operations.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// The operation is not valid in the runtime's current state.
    #[error("Cannot {operation} while runtime is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// The runtime has been torn down.
    #[error("Runtime has been destroyed")]
    Destroyed,

    /// The change observer could not attach; the runtime is non-reactive.
    #[error("Observer error: {0}")]
    ObserverStart(#[from] ObserverStartError),

    /// Configuration rejected at build time.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Malformed or contradictory markers on a single element.
///
/// The element is left unbound.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    /// A marker attribute carries a value the runtime cannot interpret.
    #[error("Malformed marker {attribute} on {element}: {reason}")]
    Malformed {
        element: ElementId,
        attribute: String,
        reason: String,
    },

    /// Two markers on the element contradict each other.
    #[error("Contradictory markers {first} and {second} on {element}")]
    Contradictory {
        element: ElementId,
        first: String,
        second: String,
    },
}

impl ClassificationError {
    /// The element the error was raised for.
    pub fn element(&self) -> ElementId {
        match self {
            Self::Malformed { element, .. } | Self::Contradictory { element, .. } => *element,
        }
    }
}

/// Failure to turn a capability into an enhancer instance.
///
/// Only the affected tag on the affected element is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// No registered factory supports the capability.
    #[error("No enhancer registered for {capability} on {element}")]
    Unresolved {
        element: ElementId,
        capability: String,
    },

    /// A lazily loaded factory failed to load its implementation.
    #[error("Factory {factory} failed to load: {reason}")]
    LoadFailed { factory: String, reason: String },

    /// The factory was found but refused to construct an enhancer.
    #[error("Factory {factory} could not create enhancer: {reason}")]
    CreateFailed { factory: String, reason: String },
}

/// An enhancer's `initialize()` failed.
///
/// That enhancer is discarded; siblings and other elements are unaffected.
#[derive(Error, Debug, Clone)]
pub enum InitializationError {
    /// `initialize()` returned an error.
    #[error("Enhancer {enhancer} failed to initialize on {element}: {source}")]
    Failed {
        element: ElementId,
        enhancer: String,
        #[source]
        source: EnhancerError,
    },

    /// `initialize()` panicked.
    #[error("Enhancer {enhancer} panicked during initialize on {element}: {message}")]
    Panicked {
        element: ElementId,
        enhancer: String,
        message: String,
    },

    /// `initialize()` was invoked a second time on the same instance.
    #[error("Enhancer {enhancer} on {element} was already initialized")]
    AlreadyInitialized { element: ElementId, enhancer: String },
}

/// Errors returned by enhancer implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnhancerError {
    /// Generic failure with message
    #[error("{0}")]
    Failed(String),

    /// A required attribute is absent on the element
    #[error("Missing attribute: {0}")]
    MissingAttribute(String),

    /// An external resource the enhancer depends on is unavailable
    #[error("Resource unavailable: {0}")]
    Unavailable(String),

    /// The operation was cancelled
    #[error("Operation was cancelled")]
    Cancelled,
}

impl From<String> for EnhancerError {
    fn from(msg: String) -> Self {
        EnhancerError::Failed(msg)
    }
}

impl From<&str> for EnhancerError {
    fn from(msg: &str) -> Self {
        EnhancerError::Failed(msg.to_string())
    }
}

/// The host rejected the subtree-mutation subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObserverStartError {
    /// The root handle does not name a live element.
    #[error("Observer root {0} does not exist")]
    InvalidRoot(ElementId),

    /// The root exists but is not attached to the document.
    #[error("Observer root {0} is detached from the document")]
    Detached(ElementId),

    /// The host refused the subscription for another reason.
    #[error("Host rejected mutation subscription: {0}")]
    Rejected(String),
}

/// Errors from in-memory tree operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The handle does not name a live element
    #[error("Unknown element: {0}")]
    UnknownElement(ElementId),

    /// The insertion would create a cycle or move the root
    #[error("Cannot insert {child} under {parent}")]
    HierarchyRequest { parent: ElementId, child: ElementId },

    /// The reference node is not a child of the given parent
    #[error("{reference} is not a child of {parent}")]
    NotAChild {
        parent: ElementId,
        reference: ElementId,
    },

    /// Only detached subtrees can be discarded
    #[error("Element {0} is still attached")]
    StillAttached(ElementId),
}

/// Errors that can occur in factory registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Factory already registered with this name
    #[error("Factory already registered: {0}")]
    AlreadyRegistered(String),

    /// Invalid factory name
    #[error("Invalid factory name: {0:?}")]
    InvalidName(String),
}

/// Invalid runtime configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Result type alias for classification.
pub type ClassificationResult<T> = Result<T, ClassificationError>;

/// Result type alias for enhancer resolution.
pub type ResolutionResult<T> = Result<T, ResolutionError>;

/// Result type alias for enhancer implementations.
pub type EnhancerResult<T> = Result<T, EnhancerError>;

/// Result type alias for in-memory tree operations.
pub type DocumentResult<T> = Result<T, DocumentError>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
