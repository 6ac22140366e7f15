//! # Contentual Equivalence
//!
//! Two trees are "the same content" exactly when their canonical
//! serializations are byte-identical. This is the engine's only notion of
//! sameness and must be used everywhere dedup is decided.
//!
//! ## Canonical Form
//!
//! - Single encoding (UTF-8), no indentation, no declaration
//! - Attributes sorted by name; values escaped but otherwise verbatim
//! - Adjacent text nodes merged, internal whitespace collapsed to one space,
//!   leading/trailing whitespace trimmed, empty text dropped
//! - Comments kept as `<!--...-->`, their text escaped like element text
//! - Childless elements self-closed

use crate::tree::{Content, Element};

/// Serialize an element to its canonical byte form.
#[must_use]
pub fn canonical_bytes(element: &Element) -> Vec<u8> {
    canonical_string(element).into_bytes()
}

/// Serialize an element to its canonical text form.
#[must_use]
pub fn canonical_string(element: &Element) -> String {
    let mut out = String::new();
    write_element(&mut out, element);
    out
}

/// Contentual equivalence of two trees.
#[must_use]
pub fn equal(a: &Element, b: &Element) -> bool {
    canonical_bytes(a) == canonical_bytes(b)
}

/// BLAKE3 digest of the canonical form, as lowercase hex.
///
/// Used as the change-detection digest of tracked documents.
#[must_use]
pub fn content_digest(element: &Element) -> String {
    blake3::hash(&canonical_bytes(element)).to_hex().to_string()
}

fn write_element(out: &mut String, element: &Element) {
    out.push('<');
    out.push_str(&element.tag);

    let mut attrs: Vec<_> = element.attrs.iter().collect();
    attrs.sort_by(|a, b| a.name.cmp(&b.name));
    for attr in attrs {
        out.push(' ');
        out.push_str(&attr.name);
        out.push_str("=\"");
        escape_into(out, &attr.value, true);
        out.push('"');
    }

    let mut body = String::new();
    let mut pending_text = String::new();
    for child in &element.children {
        match child {
            Content::Text(text) => pending_text.push_str(text),
            Content::Element(e) => {
                flush_text(&mut body, &mut pending_text);
                write_element(&mut body, e);
            }
            Content::Comment(comment) => {
                flush_text(&mut body, &mut pending_text);
                body.push_str("<!--");
                escape_into(&mut body, comment, false);
                body.push_str("-->");
            }
        }
    }
    flush_text(&mut body, &mut pending_text);

    if body.is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        out.push_str(&body);
        out.push_str("</");
        out.push_str(&element.tag);
        out.push('>');
    }
}

fn flush_text(out: &mut String, pending: &mut String) {
    let collapsed = pending.split_whitespace().collect::<Vec<_>>().join(" ");
    escape_into(out, &collapsed, false);
    pending.clear();
}

fn escape_into(out: &mut String, text: &str, in_attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if in_attribute => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_normalized() {
        let a = Element::new("p").with_text("  hello \n\t world  ");
        let b = Element::new("p").with_text("hello world");
        assert!(equal(&a, &b));
        assert_eq!(canonical_string(&a), "<p>hello world</p>");
    }

    #[test]
    fn attribute_order_is_irrelevant() {
        let a = Element::new("p").with_attr("b", "2").with_attr("a", "1");
        let b = Element::new("p").with_attr("a", "1").with_attr("b", "2");
        assert!(equal(&a, &b));
    }

    #[test]
    fn attribute_values_matter() {
        let a = Element::new("p").with_attr("a", "1");
        let b = Element::new("p").with_attr("a", "2");
        assert!(!equal(&a, &b));
    }

    #[test]
    fn empty_text_self_closes() {
        let a = Element::new("p").with_text("   ");
        assert_eq!(canonical_string(&a), "<p/>");
    }

    #[test]
    fn escapes_markup() {
        let a = Element::new("p").with_attr("q", "\"<&>").with_text("a<b");
        assert_eq!(
            canonical_string(&a),
            "<p q=\"&quot;&lt;&amp;&gt;\">a&lt;b</p>"
        );
    }

    #[test]
    fn comment_text_cannot_forge_markup() {
        let forged = Element {
            children: vec![Content::Comment("a--><q/><!--b".to_string())],
            ..Element::new("p")
        };
        let real = Element {
            children: vec![
                Content::Comment("a".to_string()),
                Content::Element(Element::new("q")),
                Content::Comment("b".to_string()),
            ],
            ..Element::new("p")
        };
        assert_eq!(
            canonical_string(&forged),
            "<p><!--a--&gt;&lt;q/&gt;&lt;!--b--></p>"
        );
        assert!(!equal(&forged, &real));
        assert_ne!(content_digest(&forged), content_digest(&real));
    }

    #[test]
    fn adjacent_text_merges() {
        let a = Element::new("p").with_text("a ").with_text(" b");
        let b = Element::new("p").with_text("a b");
        assert!(equal(&a, &b));
    }

    #[test]
    fn digest_follows_equivalence() {
        let a = Element::new("p").with_text(" x ");
        let b = Element::new("p").with_text("x");
        assert_eq!(content_digest(&a), content_digest(&b));
        assert_eq!(content_digest(&a).len(), 64);
    }
}
