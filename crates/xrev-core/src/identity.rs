//! # Identity Model
//!
//! `Xid` names one revision of an identified sub-tree; `Xref` names a sub-tree
//! reachable from an `Xid` by following local property names.
//!
//! ## Canonical Text Forms
//!
//! ```text
//! xid  := id ':' rev | id            (bare id = revision missing)
//! rev  := digit+ | '#'               ('#' = unassigned)
//! xref := xid ('/' segment)*
//! ```
//!
//! `id` and `segment` are non-empty runs of printable ASCII excluding `:`,
//! `/` and whitespace. Both forms are parsed by a small deterministic
//! automaton; every rejection is a `Syntax` error.

use crate::primitives::{
    ID_ATTR, MAX_NAME_LENGTH, MAX_XREF_SEGMENTS, REV_ATTR, UNASSIGNED_TOKEN, VERSION_ATTR,
    XID_ATTR,
};
use crate::tree::Element;
use crate::types::XrevError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

// =============================================================================
// REVISION
// =============================================================================

/// Revision component of an `Xid`.
///
/// Ordered `Missing < Unassigned < Assigned(n)` so that leaser selection can
/// maximize over revisions directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rev {
    /// No revision given; syntactically incomplete.
    Missing,
    /// Fresh identity, revision assigned at commit time.
    Unassigned,
    /// Assigned revision.
    Assigned(u64),
}

impl Rev {
    /// The assigned revision number, if any.
    #[must_use]
    pub fn number(self) -> Option<u64> {
        match self {
            Self::Assigned(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => Ok(()),
            Self::Unassigned => f.write_str(UNASSIGNED_TOKEN),
            Self::Assigned(n) => write!(f, "{}", n),
        }
    }
}

/// Informational version payload; never part of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = XrevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| XrevError::syntax(format!("version '{}' is not major.minor", s)))?;
        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(XrevError::syntax(format!("version '{}' is not major.minor", s)));
            }
            part.parse::<u32>()
                .map_err(|_| XrevError::syntax(format!("version '{}' out of range", s)))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

// =============================================================================
// XID
// =============================================================================

/// Identity of one revision of an identified sub-tree.
///
/// Equality, ordering and hashing use `(id, rev)` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xid {
    pub id: String,
    pub rev: Rev,
    pub version: Option<Version>,
}

impl Xid {
    /// Identity with an assigned revision.
    #[must_use]
    pub fn new(id: impl Into<String>, rev: u64) -> Self {
        Self::with_rev(id, Rev::Assigned(rev))
    }

    /// Identity pending revision assignment.
    #[must_use]
    pub fn unassigned(id: impl Into<String>) -> Self {
        Self::with_rev(id, Rev::Unassigned)
    }

    /// Identity with an explicit revision class.
    #[must_use]
    pub fn with_rev(id: impl Into<String>, rev: Rev) -> Self {
        Self {
            id: id.into(),
            rev,
            version: None,
        }
    }

    /// Same lifeline id, different revision.
    #[must_use]
    pub fn at_rev(&self, rev: Rev) -> Self {
        Self {
            id: self.id.clone(),
            rev,
            version: self.version,
        }
    }

    /// Whether this is an internal (administrative) identity.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.id.starts_with('#')
    }

    /// The uid of an internal identity `#<type>!<8 hex digits>`.
    #[must_use]
    pub fn internal_uid(&self) -> Option<u32> {
        let rest = self.id.strip_prefix('#')?;
        let (_, hex) = rest.split_once('!')?;
        if hex.len() != 8 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok()
    }
}

impl PartialEq for Xid {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.rev == other.rev
    }
}

impl Eq for Xid {}

impl Hash for Xid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.rev.hash(state);
    }
}

impl PartialOrd for Xid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Xid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.rev.cmp(&other.rev))
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rev {
            Rev::Missing => f.write_str(&self.id),
            rev => write!(f, "{}:{}", self.id, rev),
        }
    }
}

impl FromStr for Xid {
    type Err = XrevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (xid, path) = scan(s, false)?;
        debug_assert!(path.is_empty());
        Ok(xid)
    }
}

// =============================================================================
// XREF
// =============================================================================

/// A sub-tree reachable from `base` by following local property names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xref {
    pub base: Xid,
    pub path: Vec<String>,
}

impl Xref {
    /// Reference with a path.
    #[must_use]
    pub fn new(base: Xid, path: Vec<String>) -> Self {
        Self { base, path }
    }

    /// The same path rooted at another base.
    #[must_use]
    pub fn rebased(&self, base: Xid) -> Self {
        Self {
            base,
            path: self.path.clone(),
        }
    }
}

impl fmt::Display for Xref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for segment in &self.path {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Xref {
    type Err = XrevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, path) = scan(s, true)?;
        Ok(Self { base, path })
    }
}

// =============================================================================
// AUTOMATON
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Id,
    RevStart,
    Digits,
    Hash,
    SegmentStart,
    Segment,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_graphic() && c != ':' && c != '/'
}

/// Single pass over `text`; `allow_path` enables the `Xref` tail.
fn scan(text: &str, allow_path: bool) -> Result<(Xid, Vec<String>), XrevError> {
    let fail = |message: String| XrevError::syntax(format!("'{}': {}", text, message));

    let mut state = State::Start;
    let mut id = String::new();
    let mut rev = Rev::Missing;
    let mut digits: u64 = 0;
    let mut path: Vec<String> = Vec::new();
    let mut segment = String::new();

    for (pos, c) in text.chars().enumerate() {
        state = match (state, c) {
            (State::Start | State::Id, c) if is_name_char(c) => {
                id.push(c);
                State::Id
            }
            (State::Start, ':') => return Err(fail("empty id".to_string())),
            (State::Id, ':') => State::RevStart,
            (State::Id, '/') if allow_path => State::SegmentStart,
            (State::RevStart, '#') => {
                rev = Rev::Unassigned;
                State::Hash
            }
            (State::RevStart | State::Digits, c) if c.is_ascii_digit() => {
                let digit = u64::from(c as u8 - b'0');
                digits = digits
                    .checked_mul(10)
                    .and_then(|d| d.checked_add(digit))
                    .ok_or_else(|| fail("revision out of range".to_string()))?;
                rev = Rev::Assigned(digits);
                State::Digits
            }
            (State::RevStart, c) => {
                return Err(fail(format!("non-digit revision character '{}' at {}", c, pos)));
            }
            (State::Digits | State::Hash, '/') if allow_path => State::SegmentStart,
            (State::SegmentStart | State::Segment, c) if is_name_char(c) => {
                segment.push(c);
                State::Segment
            }
            (State::SegmentStart, '/') => {
                return Err(fail(format!("empty path segment at {}", pos)));
            }
            (State::Segment, '/') => {
                path.push(std::mem::take(&mut segment));
                State::SegmentStart
            }
            (_, c) => return Err(fail(format!("unexpected character '{}' at {}", c, pos))),
        };

        if id.len() > MAX_NAME_LENGTH || segment.len() > MAX_NAME_LENGTH {
            return Err(fail("name too long".to_string()));
        }
        if path.len() > MAX_XREF_SEGMENTS {
            return Err(fail("too many path segments".to_string()));
        }
    }

    match state {
        State::Start => return Err(fail("empty id".to_string())),
        State::RevStart => return Err(fail("trailing ':'".to_string())),
        State::SegmentStart => return Err(fail("trailing '/'".to_string())),
        State::Segment => path.push(segment),
        State::Id | State::Digits | State::Hash => {}
    }

    Ok((Xid::with_rev(id, rev), path))
}

// =============================================================================
// ELEMENT IDENTITY
// =============================================================================

/// Read the identity an element carries.
///
/// Exactly one of `xid` or the pair `id` + `rev` may be present. Carrying
/// both forms, or only one half of the pair, is a `Syntax` error. Carrying
/// neither means the element is not tracked.
pub fn read_xid(element: &Element) -> Result<Option<Xid>, XrevError> {
    let xid_attr = element.attr(XID_ATTR);
    let id_attr = element.attr(ID_ATTR);
    let rev_attr = element.attr(REV_ATTR);

    let mut xid = match (xid_attr, id_attr, rev_attr) {
        (None, None, None) => return Ok(None),
        (Some(text), None, None) => text.parse::<Xid>()?,
        (Some(_), _, _) => {
            return Err(XrevError::syntax(
                "element carries both 'xid' and 'id'/'rev'",
            ));
        }
        (None, Some(id), Some(rev)) => {
            let bare = id.parse::<Xid>()?;
            if bare.rev != Rev::Missing {
                return Err(XrevError::syntax(format!("'id' attribute '{}' contains ':'", id)));
            }
            if rev.is_empty() {
                bare
            } else {
                format!("{}:{}", bare.id, rev).parse::<Xid>()?
            }
        }
        (None, Some(_), None) => {
            return Err(XrevError::syntax("'id' without 'rev'"));
        }
        (None, None, Some(_)) => {
            return Err(XrevError::syntax("'rev' without 'id'"));
        }
    };

    if let Some(version) = element.attr(VERSION_ATTR) {
        xid.version = Some(version.parse()?);
    }
    Ok(Some(xid))
}

/// Write an identity back onto an element, keeping the form it already uses.
pub fn write_xid(element: &mut Element, xid: &Xid) {
    if element.has_attr(XID_ATTR) {
        element.set_attr(XID_ATTR, xid.to_string());
    } else {
        element.set_attr(ID_ATTR, xid.id.clone());
        element.set_attr(REV_ATTR, xid.rev.to_string());
    }
    if let Some(version) = xid.version {
        element.set_attr(VERSION_ATTR, version.to_string());
    }
}

/// Remove every identity attribute from an element.
pub fn strip_xid(element: &mut Element) {
    for name in [XID_ATTR, ID_ATTR, REV_ATTR, VERSION_ATTR] {
        element.remove_attr(name);
    }
}

// =============================================================================
// TESTS
// =============================================================================
