//! # Resolution Engine
//!
//! Resolves an `Xref` to a concrete sub-tree by following local property
//! names from its base, dereferencing inclusion placeholders on the way.
//!
//! Each path segment is searched breadth-first inside the current property
//! scope. An unidentified child without a `prop` marker is named by its tag.
//! Placeholders and identified elements open a new scope: they can be matched
//! by their `prop`, but the search never descends through them.
//!
//! "Not found" is `Ok(None)`. Only a dangling placeholder (target absent from
//! the store) is an error.

use crate::identity::{Xref, read_xid};
use crate::normalize::{PayloadStore, placeholder_target};
use crate::primitives::PROPERTY_ATTR;
use crate::tree::Element;
use crate::types::XrevError;
use std::collections::VecDeque;

/// Resolve `xref` against the stored payloads.
pub fn resolve<S: PayloadStore + ?Sized>(
    store: &S,
    xref: &Xref,
) -> Result<Option<Element>, XrevError> {
    let Some(base) = store.payload(&xref.base)? else {
        return Ok(None);
    };
    resolve_in(store, base, &xref.path)
}

/// Follow `path` from an element already in hand.
fn resolve_in<S: PayloadStore + ?Sized>(
    store: &S,
    start: Element,
    path: &[String],
) -> Result<Option<Element>, XrevError> {
    let mut current = start;
    for segment in path {
        match find_property(store, &current, segment)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// The local property name of `element`, if it has one.
///
/// Unidentified plain elements default to their tag.
pub fn property_name(element: &Element) -> Result<Option<&str>, XrevError> {
    if let Some(name) = element.attr(PROPERTY_ATTR) {
        return Ok(Some(name));
    }
    if element.is_placeholder() || read_xid(element)?.is_some() {
        return Ok(None);
    }
    Ok(Some(&element.tag))
}

fn opens_scope(element: &Element) -> Result<bool, XrevError> {
    Ok(element.is_placeholder() || read_xid(element)?.is_some())
}

fn find_property<S: PayloadStore + ?Sized>(
    store: &S,
    scope: &Element,
    name: &str,
) -> Result<Option<Element>, XrevError> {
    let mut queue: VecDeque<&Element> = scope.child_elements().map(|(_, e)| e).collect();

    while let Some(candidate) = queue.pop_front() {
        if property_name(candidate)? == Some(name) {
            return dereference(store, candidate).map(Some);
        }
        if !opens_scope(candidate)? {
            queue.extend(candidate.child_elements().map(|(_, e)| e));
        }
    }
    Ok(None)
}

fn dereference<S: PayloadStore + ?Sized>(
    store: &S,
    element: &Element,
) -> Result<Element, XrevError> {
    let Some(target) = placeholder_target(element)? else {
        return Ok(element.clone());
    };
    let mut payload = store.payload(&target)?.ok_or_else(|| {
        XrevError::integrity(format!("placeholder target {} is not in the store", target))
    })?;
    if let Some(name) = element.attr(PROPERTY_ATTR) {
        payload.set_attr(PROPERTY_ATTR, name);
    }
    Ok(payload)
}
