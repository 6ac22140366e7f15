//! # Normalization Engine
//!
//! Converts a live sub-tree into its canonical stored form and back.
//!
//! `normalize` replaces every identified descendant with a placeholder
//! (inclusion-by-reference) and returns a table linking each placeholder to
//! the descendant it stands for. `denormalize` is the inverse: it expands
//! placeholders from a payload store, honouring a document's manifestation
//! (which inclusion points were deliberately left collapsed).
//!
//! ## Placeholder Vocabulary
//!
//! ```text
//! <tag [prop=".."] ref_xid="id:rev" expand="true|false" [link_xid="#link!uid:rev"]/>
//! ```
//!
//! `link_xid` and `expand` are bookkeeping: `normalize_refs` strips them and
//! `denormalize_refs` restores them, so two trees differing only in their
//! link identities still compare equal.

use crate::canonical;
use crate::identity::{Xid, read_xid};
use crate::primitives::{EXPAND_ATTR, LINK_XID_ATTR, PROPERTY_ATTR, REF_XID_ATTR};
use crate::tree::{Content, Element, ElementPath};
use crate::types::XrevError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// PLACEHOLDER TABLE
// =============================================================================

/// One inclusion point of a normalized tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefXidRecord {
    /// Path of the placeholder in the normalized tree; the same path addresses
    /// the original descendant in the source tree.
    pub handle: ElementPath,
    /// The included identity.
    pub target: Xid,
    /// `true` when this normalization pruned the descendant (auto-expand);
    /// `false` when the source already used a placeholder.
    pub expand: bool,
    /// Internal identity of this inclusion point, independent of its target.
    pub link: Option<Xid>,
}

/// A normalized tree and its placeholder table, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub tree: Element,
    pub table: Vec<RefXidRecord>,
}

/// Build the placeholder standing in for `source`.
fn placeholder(source: &Element, target: &Xid, expand: bool) -> Element {
    let mut el = Element::new(source.tag.clone());
    if let Some(name) = source.attr(PROPERTY_ATTR) {
        el.set_attr(PROPERTY_ATTR, name);
    }
    el.set_attr(REF_XID_ATTR, target.to_string());
    el.set_attr(EXPAND_ATTR, expand.to_string());
    el
}

/// Parse the target of a placeholder element.
pub fn placeholder_target(element: &Element) -> Result<Option<Xid>, XrevError> {
    element
        .attr(REF_XID_ATTR)
        .map(str::parse::<Xid>)
        .transpose()
}

fn placeholder_link(element: &Element) -> Result<Option<Xid>, XrevError> {
    element
        .attr(LINK_XID_ATTR)
        .map(str::parse::<Xid>)
        .transpose()
}

// =============================================================================
// NORMALIZE
// =============================================================================

/// Produce the canonical, unparented copy of `tree`.
///
/// The root keeps its own attributes (including its identity); identified
/// descendants become placeholders. Text and comments are copied verbatim.
pub fn normalize(tree: &Element) -> Result<Normalized, XrevError> {
    let mut table = Vec::new();
    let root = normalize_into(tree, &ElementPath::root(), &mut table)?;
    Ok(Normalized { tree: root, table })
}

fn normalize_into(
    source: &Element,
    path: &ElementPath,
    table: &mut Vec<RefXidRecord>,
) -> Result<Element, XrevError> {
    let mut out = Element {
        tag: source.tag.clone(),
        attrs: source.attrs.clone(),
        children: Vec::with_capacity(source.children.len()),
    };

    for (index, child) in source.children.iter().enumerate() {
        let Content::Element(child_el) = child else {
            out.children.push(child.clone());
            continue;
        };
        let child_path = path.child(index);

        if let Some(xid) = read_xid(child_el)? {
            out.children
                .push(Content::Element(placeholder(child_el, &xid, true)));
            table.push(RefXidRecord {
                handle: child_path,
                target: xid,
                expand: true,
                link: None,
            });
        } else if let Some(target) = placeholder_target(child_el)? {
            // Already included by reference: not pruned by this call.
            let mut kept = child_el.clone();
            kept.set_attr(EXPAND_ATTR, "false");
            let link = placeholder_link(child_el)?;
            out.children.push(Content::Element(kept));
            table.push(RefXidRecord {
                handle: child_path,
                target,
                expand: false,
                link,
            });
        } else {
            let normalized = normalize_into(child_el, &child_path, table)?;
            out.children.push(Content::Element(normalized));
        }
    }

    Ok(out)
}

/// Rebuild the placeholder table of an already-normalized tree.
///
/// Records come back in the same order `normalize` produced them.
pub fn scan_table(tree: &Element) -> Result<Vec<RefXidRecord>, XrevError> {
    let mut table = Vec::new();
    for (path, element) in tree.elements() {
        if path.is_root() {
            continue;
        }
        if let Some(target) = placeholder_target(element)? {
            table.push(RefXidRecord {
                handle: path,
                target,
                expand: element.attr(EXPAND_ATTR) != Some("false"),
                link: placeholder_link(element)?,
            });
        }
    }
    Ok(table)
}

// =============================================================================
// BOOKKEEPING ATTRIBUTES
// =============================================================================

/// Strip `link_xid` and `expand` from every placeholder of the table.
///
/// The link identity found on the tree is stored back into the table so that
/// `denormalize_refs` can restore it.
pub fn normalize_refs(tree: &mut Element, table: &mut [RefXidRecord]) -> Result<(), XrevError> {
    for record in table.iter_mut() {
        let el = tree.at_mut(&record.handle).ok_or_else(|| {
            XrevError::integrity(format!(
                "placeholder table names {} but the tree has no element there",
                record.handle
            ))
        })?;
        if let Some(link) = el.remove_attr(LINK_XID_ATTR) {
            record.link = Some(link.parse()?);
        }
        el.remove_attr(EXPAND_ATTR);
    }
    Ok(())
}

/// Restore the attributes stripped by `normalize_refs`.
pub fn denormalize_refs(tree: &mut Element, table: &[RefXidRecord]) -> Result<(), XrevError> {
    for record in table {
        let el = tree.at_mut(&record.handle).ok_or_else(|| {
            XrevError::integrity(format!(
                "placeholder table names {} but the tree has no element there",
                record.handle
            ))
        })?;
        el.set_attr(EXPAND_ATTR, record.expand.to_string());
        if let Some(link) = &record.link {
            el.set_attr(LINK_XID_ATTR, link.to_string());
        }
    }
    Ok(())
}

/// Contentual equivalence of two normalized trees, ignoring link identities.
///
/// Applies `normalize_refs` / `denormalize_refs` in a matched pair on both
/// sides. Equal content with tables of different shape is corruption.
pub fn equivalent(a: &mut Normalized, b: &mut Normalized) -> Result<bool, XrevError> {
    normalize_refs(&mut a.tree, &mut a.table)?;
    normalize_refs(&mut b.tree, &mut b.table)?;
    let same = canonical::equal(&a.tree, &b.tree);
    denormalize_refs(&mut a.tree, &a.table)?;
    denormalize_refs(&mut b.tree, &b.table)?;

    if same {
        let aligned = a.table.len() == b.table.len()
            && a.table
                .iter()
                .zip(&b.table)
                .all(|(x, y)| x.handle == y.handle && x.target == y.target);
        if !aligned {
            return Err(XrevError::integrity(
                "equivalent trees have mismatched placeholder tables",
            ));
        }
    }
    Ok(same)
}

// =============================================================================
// MANIFESTATION
// =============================================================================

/// Which inclusion points of a document instance were left collapsed.
///
/// Each stack lists link identities from the innermost inclusion point to the
/// outermost; the last element is the top of the stack and belongs to the
/// placeholder table of the element the manifestation is relative to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifestation {
    pub stacks: Vec<Vec<Xid>>,
}

impl Manifestation {
    /// Whether nothing is collapsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Whether the inclusion point `link` itself is collapsed.
    #[must_use]
    pub fn collapses(&self, link: &Xid) -> bool {
        self.stacks
            .iter()
            .any(|stack| stack.len() == 1 && stack.last() == Some(link))
    }

    /// The manifestation relative to the element included at `link`.
    #[must_use]
    pub fn descend(&self, link: &Xid) -> Manifestation {
        let stacks = self
            .stacks
            .iter()
            .filter(|stack| stack.len() > 1 && stack.last() == Some(link))
            .map(|stack| stack[..stack.len() - 1].to_vec())
            .collect();
        Manifestation { stacks }
    }
}

// =============================================================================
// DENORMALIZE
// =============================================================================

/// Source of stored payloads for placeholder expansion.
pub trait PayloadStore {
    /// The stored normalized payload of `xid`, if present.
    fn payload(&self, xid: &Xid) -> Result<Option<Element>, XrevError>;
}

impl PayloadStore for BTreeMap<Xid, Element> {
    fn payload(&self, xid: &Xid) -> Result<Option<Element>, XrevError> {
        Ok(self.get(xid).cloned())
    }
}

/// Maps stale revisions to the newest revision of their lifeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationMap {
    newest: BTreeMap<Xid, Xid>,
}

impl MigrationMap {
    /// Empty map (every identity maps to itself).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `stale` is superseded by `newest`.
    pub fn insert(&mut self, stale: Xid, newest: Xid) {
        self.newest.insert(stale, newest);
    }

    /// The newest revision for `xid`.
    #[must_use]
    pub fn resolve(&self, xid: &Xid) -> Xid {
        self.newest.get(xid).cloned().unwrap_or_else(|| xid.clone())
    }

    /// Number of stale identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.newest.len()
    }

    /// Whether no identity is stale.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.newest.is_empty()
    }
}

/// Expand placeholders of `tree` from `store`.
///
/// With a manifestation, a placeholder stays collapsed exactly when one of the
/// stacks reduces to it; without one, its `expand` attribute decides.
/// Collapsed placeholders lose their internal link identity and are marked
/// `expand="false"`.
pub fn denormalize<S: PayloadStore + ?Sized>(
    store: &S,
    tree: &Element,
    manifestation: Option<&Manifestation>,
    migration: Option<&MigrationMap>,
) -> Result<Element, XrevError> {
    let mut out = Element {
        tag: tree.tag.clone(),
        attrs: tree.attrs.clone(),
        children: Vec::with_capacity(tree.children.len()),
    };

    for child in &tree.children {
        let Content::Element(child_el) = child else {
            out.children.push(child.clone());
            continue;
        };
        let expanded = if child_el.is_placeholder() {
            expand_placeholder(store, child_el, manifestation, migration)?
        } else {
            denormalize(store, child_el, manifestation, migration)?
        };
        out.children.push(Content::Element(expanded));
    }

    Ok(out)
}

fn expand_placeholder<S: PayloadStore + ?Sized>(
    store: &S,
    placeholder_el: &Element,
    manifestation: Option<&Manifestation>,
    migration: Option<&MigrationMap>,
) -> Result<Element, XrevError> {
    let link = placeholder_link(placeholder_el)?;
    let expand = match manifestation {
        Some(m) => !link.as_ref().is_some_and(|l| m.collapses(l)),
        None => placeholder_el.attr(EXPAND_ATTR) != Some("false"),
    };

    if !expand {
        let mut kept = placeholder_el.clone();
        kept.remove_attr(LINK_XID_ATTR);
        kept.set_attr(EXPAND_ATTR, "false");
        return Ok(kept);
    }

    let target = placeholder_target(placeholder_el)?
        .ok_or_else(|| XrevError::integrity("placeholder without ref_xid"))?;
    let target = migration.map_or_else(|| target.clone(), |m| m.resolve(&target));
    let payload = store.payload(&target)?.ok_or_else(|| {
        XrevError::integrity(format!("placeholder target {} is not in the store", target))
            .at(&format!("ref_xid={}", target))
    })?;

    let nested = match (manifestation, &link) {
        (Some(m), Some(l)) => Some(m.descend(l)),
        (Some(_), None) => Some(Manifestation::default()),
        (None, _) => None,
    };
    let mut expanded = denormalize(store, &payload, nested.as_ref(), migration)?;
    if let Some(name) = placeholder_el.attr(PROPERTY_ATTR) {
        expanded.set_attr(PROPERTY_ATTR, name);
    }
    Ok(expanded)
}

// =============================================================================
// TESTS
// =============================================================================
