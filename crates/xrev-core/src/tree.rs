//! # Element Tree
//!
//! The in-memory document model the engine operates on.
//!
//! Documents are owned trees of `Element`s. Handles into a tree are
//! `ElementPath`s: the child-content indices leading from the root. A path
//! stays valid across attribute edits and across normalization (placeholders
//! occupy the same index as the sub-tree they replace).

use crate::primitives::REF_XID_ATTR;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// NODES
// =============================================================================

/// One attribute, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub name: String,
    pub value: String,
}

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Content {
    Element(Element),
    Text(String),
    Comment(String),
}

/// An element with ordered attributes and mixed content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default)]
    pub attrs: Vec<Attr>,
    #[serde(default)]
    pub children: Vec<Content>,
}

impl Element {
    /// Create an empty element.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Builder: set an attribute.
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder: append a child element.
    #[must_use]
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Content::Element(child));
        self
    }

    /// Builder: append a text node.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Content::Text(text.into()));
        self
    }

    /// Get an attribute value.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Whether the attribute is present.
    #[must_use]
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|a| a.name == name)
    }

    /// Set an attribute, keeping its position if it already exists.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attrs.push(Attr { name, value }),
        }
    }

    /// Remove an attribute, returning its value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|a| a.name == name)?;
        Some(self.attrs.remove(pos).value)
    }

    /// Whether this element stands in for an included identity.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.has_attr(REF_XID_ATTR)
    }

    /// Child elements with their content index.
    pub fn child_elements(&self) -> impl Iterator<Item = (usize, &Element)> + '_ {
        self.children.iter().enumerate().filter_map(|(i, c)| match c {
            Content::Element(e) => Some((i, e)),
            _ => None,
        })
    }

    /// Follow a path from this element.
    #[must_use]
    pub fn at(&self, path: &ElementPath) -> Option<&Element> {
        let mut current = self;
        for &index in path.indices() {
            match current.children.get(index)? {
                Content::Element(e) => current = e,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Follow a path from this element, mutably.
    pub fn at_mut(&mut self, path: &ElementPath) -> Option<&mut Element> {
        let mut current = self;
        for &index in path.indices() {
            match current.children.get_mut(index)? {
                Content::Element(e) => current = e,
                _ => return None,
            }
        }
        Some(current)
    }

    /// All elements of the tree in pre-order, root first.
    #[must_use]
    pub fn elements(&self) -> Vec<(ElementPath, &Element)> {
        let mut out = Vec::new();
        let mut stack = vec![(ElementPath::root(), self)];
        while let Some((path, element)) = stack.pop() {
            // Reverse so the stack pops children in document order
            for (i, child) in element.child_elements().collect::<Vec<_>>().into_iter().rev() {
                stack.push((path.child(i), child));
            }
            out.push((path, element));
        }
        out
    }

    /// Human-readable location of the element at `path`, e.g. `/book/chapter[3]`.
    #[must_use]
    pub fn location_of(&self, path: &ElementPath) -> String {
        let mut out = format!("/{}", self.tag);
        let mut current = self;
        for &index in path.indices() {
            match current.children.get(index) {
                Some(Content::Element(e)) => {
                    out.push_str(&format!("/{}[{}]", e.tag, index));
                    current = e;
                }
                _ => {
                    out.push_str(&format!("/?[{}]", index));
                    break;
                }
            }
        }
        out
    }
}

/// A tracked document: a layout path and its root element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub root: Element,
}

impl Document {
    #[must_use]
    pub fn new(path: impl Into<String>, root: Element) -> Self {
        Self {
            path: path.into(),
            root,
        }
    }

    /// Location string of the element at `path`, prefixed with the document path.
    #[must_use]
    pub fn location_of(&self, path: &ElementPath) -> String {
        format!("{}:{}", self.path, self.root.location_of(path))
    }
}

// =============================================================================
// PATHS
// =============================================================================

/// Handle of an element inside a tree: child-content indices from the root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ElementPath(Vec<usize>);

impl ElementPath {
    /// The root itself.
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of the child at content index `index`.
    #[must_use]
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    /// The raw indices.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<usize>> for ElementPath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for index in &self.0 {
            write!(f, "/{}", index)?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Element {
        Element::new("book")
            .with_text("intro")
            .with_child(Element::new("chapter").with_child(Element::new("para")))
            .with_child(Element::new("chapter"))
    }

    #[test]
    fn set_attr_keeps_position() {
        let mut el = Element::new("a").with_attr("x", "1").with_attr("y", "2");
        el.set_attr("x", "3");
        assert_eq!(el.attrs[0].name, "x");
        assert_eq!(el.attr("x"), Some("3"));
        assert_eq!(el.remove_attr("y"), Some("2".to_string()));
        assert!(!el.has_attr("y"));
    }

    #[test]
    fn paths_skip_text_indices() {
        let book = sample();
        let para = book.at(&ElementPath::from(vec![1, 0])).expect("para");
        assert_eq!(para.tag, "para");
        assert!(book.at(&ElementPath::from(vec![0])).is_none());
    }

    #[test]
    fn elements_are_preorder() {
        let book = sample();
        let tags: Vec<_> = book.elements().iter().map(|(_, e)| e.tag.clone()).collect();
        assert_eq!(tags, vec!["book", "chapter", "para", "chapter"]);
    }

    #[test]
    fn location_names_tags() {
        let book = sample();
        assert_eq!(
            book.location_of(&ElementPath::from(vec![1, 0])),
            "/book/chapter[1]/para[0]"
        );
        assert_eq!(ElementPath::from(vec![1, 0]).to_string(), "/1/0");
        assert_eq!(ElementPath::root().to_string(), "/");

        let doc = Document::new("books/a.json", sample());
        assert_eq!(
            doc.location_of(&ElementPath::from(vec![2])),
            "books/a.json:/book/chapter[2]"
        );
    }
}
