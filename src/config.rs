//! Runtime configuration.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::ConfigError;
use crate::host::ElementId;
use crate::markers::MarkerVocabulary;

/// Default number of elements processed between yields during a sweep.
pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Default debounce window: one 60 Hz frame.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(16);

/// Configuration for an [`EnhancementRuntime`](crate::EnhancementRuntime).
///
/// # Example
///
/// ```rust
/// use enliven::RuntimeConfig;
/// use std::time::Duration;
///
/// let config = RuntimeConfig::new()
///     .with_batch_size(50)
///     .with_debounce(Duration::from_millis(32))
///     .track_attribute("data-next-package-id");
///
/// assert!(config.validate().is_ok());
/// assert!(config
///     .tracked_attributes()
///     .contains(&"data-next-package-id".to_string()));
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Subtree to enhance and observe; the document root when `None`.
    pub root: Option<ElementId>,
    /// Elements classified and bound between yields of the initial sweep.
    pub batch_size: usize,
    /// Coalescing window for added/attribute-changed notifications.
    pub debounce: Duration,
    /// Marker attribute names.
    pub vocabulary: MarkerVocabulary,
    /// Non-marker attributes whose change should also rebind an element,
    /// e.g. a package id an action reads during initialize.
    pub extra_tracked_attributes: Vec<String>,
    /// Per-subscriber buffer of runtime events.
    pub event_buffer: usize,
    /// Buffer between the change observer and the runtime.
    pub delivery_buffer: usize,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, root: ElementId) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: MarkerVocabulary) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    /// Add a non-marker attribute to the observer allowlist.
    pub fn track_attribute(mut self, name: impl Into<String>) -> Self {
        self.extra_tracked_attributes.push(name.into());
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }

    pub fn with_delivery_buffer(mut self, size: usize) -> Self {
        self.delivery_buffer = size;
        self
    }

    /// The attribute allowlist handed to the change observer.
    pub fn tracked_attributes(&self) -> Vec<String> {
        let mut names = self.vocabulary.tracked_attributes();
        for extra in &self.extra_tracked_attributes {
            if !names.contains(extra) {
                names.push(extra.clone());
            }
        }
        names
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than 0".into()));
        }
        if self.debounce.is_zero() {
            return Err(ConfigError::Invalid("debounce must be greater than 0".into()));
        }
        if self.event_buffer == 0 || self.delivery_buffer == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be greater than 0".into()));
        }

        let names = self.vocabulary.tracked_attributes();
        if let Some(blank) = names.iter().find(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("marker attribute name {blank:?} is blank")));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(ConfigError::Invalid(format!("marker attribute {dup} is used twice")));
        }
        if self.extra_tracked_attributes.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid("tracked attribute names must not be blank".into()));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: None,
            batch_size: DEFAULT_BATCH_SIZE,
            debounce: DEFAULT_DEBOUNCE,
            vocabulary: MarkerVocabulary::default(),
            extra_tracked_attributes: Vec::new(),
            event_buffer: 256,
            delivery_buffer: 64,
        }
    }
}
