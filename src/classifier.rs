//! Element classification.
//!
//! `ElementClassifier` maps an element's current attributes to an ordered,
//! deduplicated list of capabilities. It is a pure read of the tree: calling
//! it twice on unchanged attributes yields identical output.

use crate::capability::{Capability, CapabilityTag};
use crate::error::{ClassificationError, ClassificationResult};
use crate::host::{Document, ElementId};
use crate::markers::{has_placeholder, MarkerVocabulary};

/// Result of classifying one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The element needs these capabilities, in tag order.
    Tags(Vec<Capability>),
    /// The element is structurally excluded from binding.
    Excluded(Exclusion),
}

/// Why an element was excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    /// No marker attribute is present.
    NoMarkers,
    /// A marker value still contains an unresolved template placeholder.
    UnresolvedPlaceholder { attribute: String },
    /// The element lives inside a replicated item template.
    InsideTemplate { template: ElementId },
}

/// Classifies elements against a marker vocabulary.
#[derive(Debug, Clone)]
pub struct ElementClassifier {
    vocabulary: MarkerVocabulary,
    markers: Vec<String>,
}

impl ElementClassifier {
    pub fn new(vocabulary: MarkerVocabulary) -> Self {
        let markers = vocabulary.marker_attributes();
        Self {
            vocabulary,
            markers,
        }
    }

    pub fn vocabulary(&self) -> &MarkerVocabulary {
        &self.vocabulary
    }

    /// Marker attribute names; the union selector of the initial sweep.
    pub fn marker_attributes(&self) -> &[String] {
        &self.markers
    }

    /// Whether the element carries any marker attribute.
    pub fn is_candidate<D: Document + ?Sized>(&self, doc: &D, element: ElementId) -> bool {
        self.markers.iter().any(|m| doc.has_attribute(element, m))
    }

    /// `scope` itself (if it is a candidate) followed by every candidate
    /// descendant, in document order.
    pub fn candidates<D: Document + ?Sized>(&self, doc: &D, scope: ElementId) -> Vec<ElementId> {
        let mut out = Vec::new();
        if self.is_candidate(doc, scope) {
            out.push(scope);
        }
        out.extend(doc.query_attributes(scope, &self.markers));
        out
    }

    /// Classify one element.
    pub fn classify<D: Document + ?Sized>(
        &self,
        doc: &D,
        element: ElementId,
    ) -> ClassificationResult<Classification> {
        let present: Vec<(String, String)> = self
            .markers
            .iter()
            .filter_map(|name| doc.attribute(element, name).map(|v| (name.clone(), v)))
            .collect();

        if present.is_empty() {
            return Ok(Classification::Excluded(Exclusion::NoMarkers));
        }

        if let Some((attribute, _)) = present.iter().find(|(_, v)| has_placeholder(v)) {
            return Ok(Classification::Excluded(Exclusion::UnresolvedPlaceholder {
                attribute: attribute.clone(),
            }));
        }

        if !doc.has_attribute(element, &self.vocabulary.template) {
            if let Some(template) = self.enclosing_template(doc, element) {
                return Ok(Classification::Excluded(Exclusion::InsideTemplate { template }));
            }
        }

        let vocab = &self.vocabulary;
        if present.iter().any(|(n, _)| *n == vocab.show) && present.iter().any(|(n, _)| *n == vocab.hide) {
            return Err(ClassificationError::Contradictory {
                element,
                first: vocab.show.clone(),
                second: vocab.hide.clone(),
            });
        }

        let mut capabilities: Vec<Capability> = Vec::with_capacity(present.len());
        for (name, value) in &present {
            let Some(tag) = vocab.tag_for(name) else {
                continue;
            };
            let value = value.trim();
            let capability = match tag {
                CapabilityTag::Display => {
                    require_value(element, name, value, "data path is empty")?;
                    Capability::new(tag)
                }
                CapabilityTag::Conditional => {
                    require_value(element, name, value, "condition is empty")?;
                    let which = if *name == vocab.show { "show" } else { "hide" };
                    Capability::with_discriminator(tag, which)
                }
                CapabilityTag::Action => {
                    require_value(element, name, value, "action name is empty")?;
                    Capability::with_discriminator(tag, value.to_ascii_lowercase())
                }
                CapabilityTag::Selector
                | CapabilityTag::QuantityControl
                | CapabilityTag::Toggle
                | CapabilityTag::Timer => {
                    if value.is_empty() {
                        Capability::new(tag)
                    } else {
                        Capability::with_discriminator(tag, value)
                    }
                }
            };
            capabilities.push(capability);
        }

        capabilities.sort_by_key(|c| c.tag);
        capabilities.dedup_by_key(|c| c.tag);
        Ok(Classification::Tags(capabilities))
    }

    /// Values of every tracked attribute, used to detect changes that
    /// happened while nobody was watching.
    pub fn fingerprint<D: Document + ?Sized>(
        &self,
        doc: &D,
        element: ElementId,
        tracked: &[String],
    ) -> Vec<Option<String>> {
        tracked.iter().map(|name| doc.attribute(element, name)).collect()
    }

    fn enclosing_template<D: Document + ?Sized>(&self, doc: &D, element: ElementId) -> Option<ElementId> {
        let mut current = doc.parent(element);
        while let Some(node) = current {
            if doc.has_attribute(node, &self.vocabulary.template) {
                return Some(node);
            }
            current = doc.parent(node);
        }
        None
    }
}

impl Default for ElementClassifier {
    fn default() -> Self {
        Self::new(MarkerVocabulary::default())
    }
}

fn require_value(element: ElementId, attribute: &str, value: &str, reason: &str) -> ClassificationResult<()> {
    if value.is_empty() {
        return Err(ClassificationError::Malformed {
            element,
            attribute: attribute.to_string(),
            reason: reason.to_string(),
        });
    }
    Ok(())
}
