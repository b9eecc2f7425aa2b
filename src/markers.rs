//! Marker vocabulary.
//!
//! The attribute names markup authors put on elements. This is the contract
//! between markup and the runtime; it is configuration, not behavior.

use crate::capability::CapabilityTag;

/// Default attribute prefix.
pub const DEFAULT_PREFIX: &str = "data-next-";

/// Attribute names recognized by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerVocabulary {
    pub display: String,
    pub show: String,
    pub hide: String,
    pub action: String,
    pub selector: String,
    pub quantity: String,
    pub toggle: String,
    pub timer: String,
    /// Marks a replicated item template container.
    pub template: String,
}

impl MarkerVocabulary {
    /// Build the vocabulary under `prefix`, e.g. `data-shop-`.
    pub fn with_prefix(prefix: &str) -> Self {
        let name = |suffix: &str| format!("{prefix}{suffix}");
        Self {
            display: name("display"),
            show: name("show"),
            hide: name("hide"),
            action: name("action"),
            selector: name("selector"),
            quantity: name("quantity"),
            toggle: name("toggle"),
            timer: name("timer"),
            template: name("template"),
        }
    }

    /// Attributes whose presence makes an element a classification candidate.
    pub fn marker_attributes(&self) -> Vec<String> {
        vec![
            self.display.clone(),
            self.show.clone(),
            self.hide.clone(),
            self.action.clone(),
            self.selector.clone(),
            self.quantity.clone(),
            self.toggle.clone(),
            self.timer.clone(),
        ]
    }

    /// Marker attributes plus the template container attribute.
    pub fn tracked_attributes(&self) -> Vec<String> {
        let mut names = self.marker_attributes();
        names.push(self.template.clone());
        names
    }

    /// The tag a marker attribute maps to.
    pub fn tag_for(&self, attribute: &str) -> Option<CapabilityTag> {
        let tag = if attribute == self.display {
            CapabilityTag::Display
        } else if attribute == self.show || attribute == self.hide {
            CapabilityTag::Conditional
        } else if attribute == self.action {
            CapabilityTag::Action
        } else if attribute == self.selector {
            CapabilityTag::Selector
        } else if attribute == self.quantity {
            CapabilityTag::QuantityControl
        } else if attribute == self.toggle {
            CapabilityTag::Toggle
        } else if attribute == self.timer {
            CapabilityTag::Timer
        } else {
            return None;
        };
        Some(tag)
    }
}

impl Default for MarkerVocabulary {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

/// Whether a marker value still contains an unresolved template placeholder
/// such as `{item.id}` or `{{price}}`.
pub fn has_placeholder(value: &str) -> bool {
    value
        .find('{')
        .is_some_and(|open| value[open + 1..].contains('}'))
}
