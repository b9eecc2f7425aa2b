//! In-memory host.
//!
//! `MemoryDocument` is an arena-backed element tree that implements both
//! [`Document`] and [`MutationSource`]. It reports mutations the way a DOM
//! `MutationObserver` would: per subscription, filtered by subtree and
//! attribute allowlist, with `batch()` coalescing everything done inside the
//! scope into a single delivered record list.

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Document, ElementId, MutationSource, MutationSubscription, ObserveOptions, RawMutation};
use crate::error::{DocumentError, DocumentResult, ObserverStartError};

#[derive(Debug)]
struct Node {
    tag: String,
    attributes: IndexMap<String, String>,
    parent: Option<ElementId>,
    children: Vec<ElementId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug)]
struct Subscriber {
    root: ElementId,
    options: ObserveOptions,
    tx: mpsc::UnboundedSender<Vec<RawMutation>>,
    buffer: Vec<RawMutation>,
}

#[derive(Debug)]
struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ElementId,
    subscribers: Vec<Subscriber>,
    batch_depth: usize,
}

impl Tree {
    fn node(&self, id: ElementId) -> Option<&Node> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: ElementId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    fn require(&self, id: ElementId) -> DocumentResult<&Node> {
        self.node(id).ok_or(DocumentError::UnknownElement(id))
    }

    fn allocate(&mut self, tag: &str) -> ElementId {
        let node = Node {
            tag: tag.to_ascii_lowercase(),
            attributes: IndexMap::new(),
            parent: None,
            children: Vec::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            ElementId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            ElementId::new(index, 0)
        }
    }

    fn contains(&self, ancestor: ElementId, element: ElementId) -> bool {
        let mut current = Some(element);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.node(id).and_then(|n| n.parent);
        }
        false
    }

    fn detach(&mut self, child: ElementId) -> Option<ElementId> {
        let parent = self.node(child)?.parent?;
        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|c| *c != child);
        }
        if let Some(c) = self.node_mut(child) {
            c.parent = None;
        }
        Some(parent)
    }

    fn record(&mut self, mutation: RawMutation) {
        let target = mutation.target();
        let mut relevant = Vec::with_capacity(self.subscribers.len());
        for (idx, sub) in self.subscribers.iter().enumerate() {
            let in_scope = if sub.options.subtree {
                self.contains(sub.root, target)
            } else {
                sub.root == target
            };
            let wanted = match &mutation {
                RawMutation::ChildList { .. } => sub.options.child_list,
                RawMutation::Attribute { name, .. } => sub.options.wants_attribute(name),
            };
            if in_scope && wanted {
                relevant.push(idx);
            }
        }
        for idx in relevant {
            self.subscribers[idx].buffer.push(mutation.clone());
        }
        if self.batch_depth == 0 {
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.subscribers.retain_mut(|sub| {
            if sub.buffer.is_empty() {
                return !sub.tx.is_closed();
            }
            let records = std::mem::take(&mut sub.buffer);
            sub.tx.send(records).is_ok()
        });
    }
}

/// Arena-backed element tree with mutation reporting.
///
/// # Example
///
/// ```rust
/// use enliven::host::memory::MemoryDocument;
/// use enliven::host::Document;
///
/// let doc = MemoryDocument::new();
/// let price = doc
///     .append_element(doc.root(), "span", &[("data-next-display", "cart.total")])
///     .unwrap();
///
/// assert!(doc.is_connected(price));
/// assert_eq!(doc.attribute(price, "data-next-display").as_deref(), Some("cart.total"));
/// ```
#[derive(Debug)]
pub struct MemoryDocument {
    tree: Mutex<Tree>,
}

impl MemoryDocument {
    /// Create a document containing only a `body` root.
    pub fn new() -> Self {
        let mut tree = Tree {
            slots: Vec::new(),
            free: Vec::new(),
            root: ElementId::new(0, 0),
            subscribers: Vec::new(),
            batch_depth: 0,
        };
        tree.root = tree.allocate("body");
        Self {
            tree: Mutex::new(tree),
        }
    }

    /// Create a detached element.
    pub fn create_element(&self, tag: &str) -> ElementId {
        self.tree.lock().allocate(tag)
    }

    /// Create an element with attributes and append it to `parent`.
    ///
    /// Observers see a single insertion with the attributes already present.
    pub fn append_element(
        &self,
        parent: ElementId,
        tag: &str,
        attributes: &[(&str, &str)],
    ) -> DocumentResult<ElementId> {
        let element = {
            let mut tree = self.tree.lock();
            tree.require(parent)?;
            let element = tree.allocate(tag);
            if let Some(node) = tree.node_mut(element) {
                for (name, value) in attributes {
                    node.attributes.insert((*name).to_string(), (*value).to_string());
                }
            }
            element
        };
        self.append_child(parent, element)?;
        Ok(element)
    }

    pub fn append_child(&self, parent: ElementId, child: ElementId) -> DocumentResult<()> {
        self.insert_before(parent, child, None)
    }

    /// Insert `child` under `parent` before `reference`, or last when `None`.
    ///
    /// A child that already has a parent is moved, which reports a removal
    /// from the old parent followed by the insertion.
    pub fn insert_before(
        &self,
        parent: ElementId,
        child: ElementId,
        reference: Option<ElementId>,
    ) -> DocumentResult<()> {
        let mut tree = self.tree.lock();
        tree.require(parent)?;
        tree.require(child)?;
        if child == tree.root || tree.contains(child, parent) {
            return Err(DocumentError::HierarchyRequest { parent, child });
        }
        let mut reference = reference;
        if reference == Some(child) {
            reference = next_sibling_in(&tree, child);
        }
        if let Some(r) = reference {
            if tree.node(r).and_then(|n| n.parent) != Some(parent) {
                return Err(DocumentError::NotAChild {
                    parent,
                    reference: r,
                });
            }
        }

        if let Some(old_parent) = tree.detach(child) {
            tree.record(RawMutation::ChildList {
                target: old_parent,
                added: Vec::new(),
                removed: vec![child],
            });
        }

        if let Some(node) = tree.node_mut(parent) {
            let position = reference
                .and_then(|r| node.children.iter().position(|c| *c == r))
                .unwrap_or(node.children.len());
            node.children.insert(position, child);
        }
        if let Some(node) = tree.node_mut(child) {
            node.parent = Some(parent);
        }
        tree.record(RawMutation::ChildList {
            target: parent,
            added: vec![child],
            removed: Vec::new(),
        });
        Ok(())
    }

    /// Detach `element` from its parent. Detached elements stay queryable
    /// until discarded.
    pub fn remove(&self, element: ElementId) -> DocumentResult<()> {
        let mut tree = self.tree.lock();
        tree.require(element)?;
        if let Some(parent) = tree.detach(element) {
            tree.record(RawMutation::ChildList {
                target: parent,
                added: Vec::new(),
                removed: vec![element],
            });
        }
        Ok(())
    }

    /// Free a detached subtree. Handles into it become unknown.
    pub fn discard(&self, element: ElementId) -> DocumentResult<()> {
        let mut tree = self.tree.lock();
        let node = tree.require(element)?;
        if node.parent.is_some() || element == tree.root {
            return Err(DocumentError::StillAttached(element));
        }
        let mut stack = vec![element];
        while let Some(id) = stack.pop() {
            let slot = &mut tree.slots[id.index() as usize];
            if let Some(node) = slot.node.take() {
                stack.extend(node.children);
            }
            slot.generation = slot.generation.wrapping_add(1);
            tree.free.push(id.index());
        }
        Ok(())
    }

    pub fn set_attribute(&self, element: ElementId, name: &str, value: &str) -> DocumentResult<()> {
        let mut tree = self.tree.lock();
        let node = tree
            .node_mut(element)
            .ok_or(DocumentError::UnknownElement(element))?;
        let old_value = node.attributes.insert(name.to_string(), value.to_string());
        tree.record(RawMutation::Attribute {
            target: element,
            name: name.to_string(),
            old_value,
        });
        Ok(())
    }

    /// Remove an attribute. Returns whether it was present.
    pub fn remove_attribute(&self, element: ElementId, name: &str) -> DocumentResult<bool> {
        let mut tree = self.tree.lock();
        let node = tree
            .node_mut(element)
            .ok_or(DocumentError::UnknownElement(element))?;
        let Some(old_value) = node.attributes.shift_remove(name) else {
            return Ok(false);
        };
        tree.record(RawMutation::Attribute {
            target: element,
            name: name.to_string(),
            old_value: Some(old_value),
        });
        Ok(true)
    }

    /// Run `f` with notifications held back, then deliver everything it did
    /// as one batch per subscriber.
    pub fn batch<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        struct Release<'a>(&'a MemoryDocument);

        impl Drop for Release<'_> {
            fn drop(&mut self) {
                let mut tree = self.0.tree.lock();
                tree.batch_depth -= 1;
                if tree.batch_depth == 0 {
                    tree.flush();
                }
            }
        }

        self.tree.lock().batch_depth += 1;
        let _release = Release(self);
        f(self)
    }

    pub fn next_sibling(&self, element: ElementId) -> Option<ElementId> {
        next_sibling_in(&self.tree.lock(), element)
    }

    /// Number of live (not discarded) elements, attached or not.
    pub fn len(&self) -> usize {
        self.tree
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.node.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live mutation subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut tree = self.tree.lock();
        tree.subscribers.retain(|sub| !sub.tx.is_closed());
        tree.subscribers.len()
    }
}

fn next_sibling_in(tree: &Tree, element: ElementId) -> Option<ElementId> {
    let parent = tree.node(element)?.parent?;
    let siblings = &tree.node(parent)?.children;
    let position = siblings.iter().position(|c| *c == element)?;
    siblings.get(position + 1).copied()
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for MemoryDocument {
    fn root(&self) -> ElementId {
        self.tree.lock().root
    }

    fn tag_name(&self, element: ElementId) -> Option<String> {
        self.tree.lock().node(element).map(|n| n.tag.clone())
    }

    fn attribute(&self, element: ElementId, name: &str) -> Option<String> {
        self.tree
            .lock()
            .node(element)
            .and_then(|n| n.attributes.get(name).cloned())
    }

    fn parent(&self, element: ElementId) -> Option<ElementId> {
        self.tree.lock().node(element).and_then(|n| n.parent)
    }

    fn children(&self, element: ElementId) -> Vec<ElementId> {
        self.tree
            .lock()
            .node(element)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn exists(&self, element: ElementId) -> bool {
        self.tree.lock().node(element).is_some()
    }

    fn is_connected(&self, element: ElementId) -> bool {
        let tree = self.tree.lock();
        tree.node(element).is_some() && tree.contains(tree.root, element)
    }

    fn contains(&self, ancestor: ElementId, element: ElementId) -> bool {
        self.tree.lock().contains(ancestor, element)
    }
}

impl MutationSource for MemoryDocument {
    fn observe(
        &self,
        root: ElementId,
        options: ObserveOptions,
    ) -> Result<MutationSubscription, ObserverStartError> {
        let mut tree = self.tree.lock();
        if tree.node(root).is_none() {
            return Err(ObserverStartError::InvalidRoot(root));
        }
        let document_root = tree.root;
        if !tree.contains(document_root, root) {
            return Err(ObserverStartError::Detached(root));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tree.subscribers.push(Subscriber {
            root,
            options,
            tx,
            buffer: Vec::new(),
        });
        Ok(MutationSubscription::new(rx))
    }
}
