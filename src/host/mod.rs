//! Host environment contracts.
//!
//! The runtime never touches a concrete tree. It needs three things from its
//! host: a tree it can query by attribute in document order ([`Document`]),
//! a subtree-mutation notification primitive ([`MutationSource`]), and a
//! scheduler, which is the tokio runtime the caller drives it on.
//!
//! [`memory::MemoryDocument`] is a complete in-memory host used for headless
//! embedding and tests.

pub mod memory;

pub use memory::MemoryDocument;

use std::fmt;

use tokio::sync::mpsc;

use crate::error::ObserverStartError;

/// Stable handle to an element.
///
/// Handles are generational: once the host discards an element, a new element
/// created in the same slot gets a different generation, so a stale handle
/// never aliases a live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId {
    index: u32,
    generation: u32,
}

impl ElementId {
    /// Create a handle from its raw parts.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the host arena.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Read access to the element tree.
///
/// All list-returning methods yield elements in document order.
pub trait Document: Send + Sync {
    /// The document root.
    fn root(&self) -> ElementId;

    /// Lowercase tag name, or `None` for an unknown handle.
    fn tag_name(&self, element: ElementId) -> Option<String>;

    /// Current value of an attribute.
    fn attribute(&self, element: ElementId, name: &str) -> Option<String>;

    fn has_attribute(&self, element: ElementId, name: &str) -> bool {
        self.attribute(element, name).is_some()
    }

    fn parent(&self, element: ElementId) -> Option<ElementId>;

    fn children(&self, element: ElementId) -> Vec<ElementId>;

    /// Whether the handle still names a live (not discarded) element.
    fn exists(&self, element: ElementId) -> bool;

    /// Whether the element is attached under the document root.
    fn is_connected(&self, element: ElementId) -> bool {
        let root = self.root();
        let mut current = Some(element);
        while let Some(node) = current {
            if node == root {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    /// All descendants of `element`, excluding itself.
    fn descendants(&self, element: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack: Vec<ElementId> = self.children(element).into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).into_iter().rev());
        }
        out
    }

    /// Descendants of `scope` (excluding `scope`) carrying any of `names`.
    fn query_attributes(&self, scope: ElementId, names: &[String]) -> Vec<ElementId> {
        self.descendants(scope)
            .into_iter()
            .filter(|el| names.iter().any(|name| self.has_attribute(*el, name)))
            .collect()
    }

    /// Whether `element` is `ancestor` or one of its descendants.
    fn contains(&self, ancestor: ElementId, element: ElementId) -> bool {
        let mut current = Some(element);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parent(node);
        }
        false
    }
}

/// Subtree-mutation notifications.
pub trait MutationSource: Send + Sync {
    /// Subscribe to mutations under `root`.
    ///
    /// Dropping the returned subscription unsubscribes.
    fn observe(
        &self,
        root: ElementId,
        options: ObserveOptions,
    ) -> Result<MutationSubscription, ObserverStartError>;
}

/// A complete host: queryable tree plus mutation notifications.
pub trait Host: Document + MutationSource {}

impl<T: Document + MutationSource + ?Sized> Host for T {}

/// What a subscription should report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveOptions {
    /// Report mutations on descendants, not just the root.
    pub subtree: bool,
    /// Report child insertions and removals.
    pub child_list: bool,
    /// Report attribute changes.
    pub attributes: bool,
    /// Only report attribute changes for these names; empty means all.
    pub attribute_filter: Vec<String>,
}

impl ObserveOptions {
    /// Subtree-wide child list and filtered attribute reporting.
    pub fn subtree_with_attributes(attribute_filter: Vec<String>) -> Self {
        Self {
            subtree: true,
            child_list: true,
            attributes: true,
            attribute_filter,
        }
    }

    /// Whether an attribute change on `name` passes the filter.
    pub fn wants_attribute(&self, name: &str) -> bool {
        self.attributes
            && (self.attribute_filter.is_empty() || self.attribute_filter.iter().any(|a| a == name))
    }
}

/// One raw mutation record as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMutation {
    /// Children of `target` were inserted and/or removed.
    ChildList {
        target: ElementId,
        added: Vec<ElementId>,
        removed: Vec<ElementId>,
    },
    /// An attribute of `target` was set or removed.
    Attribute {
        target: ElementId,
        name: String,
        old_value: Option<String>,
    },
}

impl RawMutation {
    /// The element the mutation was recorded on.
    pub fn target(&self) -> ElementId {
        match self {
            Self::ChildList { target, .. } | Self::Attribute { target, .. } => *target,
        }
    }
}

/// Live subscription handle returned by [`MutationSource::observe`].
#[derive(Debug)]
pub struct MutationSubscription {
    receiver: mpsc::UnboundedReceiver<Vec<RawMutation>>,
}

impl MutationSubscription {
    /// Wrap the receiving half of a host notification channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<Vec<RawMutation>>) -> Self {
        Self { receiver }
    }

    /// Wait for the next batch. `None` once the host stops reporting.
    pub async fn recv(&mut self) -> Option<Vec<RawMutation>> {
        self.receiver.recv().await
    }
}
