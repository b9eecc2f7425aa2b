//! Capability tags.
//!
//! A capability tag names which kind of enhancer an element needs. One element
//! can carry several tags; each is resolved independently.

use std::fmt;
use std::str::FromStr;

/// Enumerated classification labels, in the order the classifier emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityTag {
    /// Renders a value from a data path.
    Display,
    /// Shows or hides the element based on a condition.
    Conditional,
    /// Runs a named behavior when activated.
    Action,
    /// Groups options into a single selection.
    Selector,
    /// Increments, decrements or sets a quantity.
    QuantityControl,
    /// Flips an item or state on and off.
    Toggle,
    /// Counts down to a deadline.
    Timer,
}

impl CapabilityTag {
    /// Every tag, in emission order.
    pub const ALL: [CapabilityTag; 7] = [
        CapabilityTag::Display,
        CapabilityTag::Conditional,
        CapabilityTag::Action,
        CapabilityTag::Selector,
        CapabilityTag::QuantityControl,
        CapabilityTag::Toggle,
        CapabilityTag::Timer,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            CapabilityTag::Display => "display",
            CapabilityTag::Conditional => "conditional",
            CapabilityTag::Action => "action",
            CapabilityTag::Selector => "selector",
            CapabilityTag::QuantityControl => "quantity-control",
            CapabilityTag::Toggle => "toggle",
            CapabilityTag::Timer => "timer",
        }
    }
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| format!("unknown capability tag: {s}"))
    }
}

/// A tag plus the optional sub-discriminator that narrows it, e.g. which
/// concrete behavior a generic `action` names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub tag: CapabilityTag,
    pub discriminator: Option<String>,
}

impl Capability {
    pub fn new(tag: CapabilityTag) -> Self {
        Self {
            tag,
            discriminator: None,
        }
    }

    pub fn with_discriminator(tag: CapabilityTag, discriminator: impl Into<String>) -> Self {
        Self {
            tag,
            discriminator: Some(discriminator.into()),
        }
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.discriminator {
            Some(d) => write!(f, "{}:{}", self.tag, d),
            None => write!(f, "{}", self.tag),
        }
    }
}

impl From<CapabilityTag> for Capability {
    fn from(tag: CapabilityTag) -> Self {
        Capability::new(tag)
    }
}
