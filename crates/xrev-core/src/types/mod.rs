//! # Core Type Definitions
//!
//! This module contains the cross-cutting types of the xrev engine:
//! - Error types (`XrevError`, `PolicyViolation`)
//! - The attribute-role seam (`ReferenceRole`, `PrefixRole`)
//!
//! ## Error Taxonomy
//!
//! - **Syntax**: malformed `Xid`/`Xref` text or identity attribute combination
//! - **Integrity**: the repository contradicts itself (missing target, duplicate identity)
//! - **Policy**: user content conflicts with the lifeline rules
//!
//! All three are fatal to the operation that raised them. Unresolvable
//! migration targets are reported, not raised (see `migrate::Unresolvable`).

use crate::identity::Xid;
use crate::primitives::{LINK_XID_ATTR, REF_XID_ATTR};
use crate::tree::Element;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

// =============================================================================
// POLICY VIOLATIONS
// =============================================================================

/// A commit-time rule broken by user content.
///
/// These are expected in normal operation (conflicting edits) and abort the
/// whole commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    /// The identity is not in the repository and no override permits creating it.
    #[error("unknown identity {0}")]
    UnknownIdentity(Xid),

    /// The modified node already has a successor.
    #[error("{base} already has successor {successor}; modifying it would branch the lifeline")]
    Branch { base: Xid, successor: Xid },

    /// Another lifeline holds the id in the current tree.
    #[error("id '{id}' is leased by {leaser}; {candidate} would steal it")]
    LeaseConflict {
        id: String,
        leaser: Xid,
        candidate: Xid,
    },

    /// The new revision already exists with different content.
    #[error("{0} was already written with different content in this commit")]
    ConcurrentRevision(Xid),

    /// A local property name appears twice in one identified scope.
    #[error("property '{name}' is already defined in scope {scope}")]
    DuplicateProperty { name: String, scope: String },

    /// A tracked document's root element carries no identity.
    #[error("document root carries no identity")]
    UnidentifiedRoot,

    /// A deletion names a path the head layout does not track.
    #[error("path '{0}' is not tracked")]
    UntrackedPath(String),
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the xrev engine.
///
/// - No silent failures
/// - Every fatal condition carries the location of the offending element
/// - The engine never panics; callers decide whether to abort
#[derive(Debug, Error)]
pub enum XrevError {
    /// Malformed identity text or identity attribute combination.
    #[error("syntax error at {location}: {message}")]
    Syntax { location: String, message: String },

    /// The repository contradicts itself.
    #[error("integrity violation at {location}: {message}")]
    Integrity { location: String, message: String },

    /// User content breaks a commit rule.
    #[error("policy violation at {location}: {violation}")]
    Policy {
        location: String,
        violation: PolicyViolation,
    },

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Configuration could not be loaded.
    #[error("Config error: {0}")]
    ConfigError(String),
}

impl XrevError {
    /// Syntax error without a location yet.
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            location: String::new(),
            message: message.into(),
        }
    }

    /// Integrity violation without a location yet.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            location: String::new(),
            message: message.into(),
        }
    }

    /// Policy violation at a known location.
    pub fn policy(location: impl Into<String>, violation: PolicyViolation) -> Self {
        Self::Policy {
            location: location.into(),
            violation,
        }
    }

    /// Tag the error with a location unless it already has one.
    #[must_use]
    pub fn at(self, at: &str) -> Self {
        match self {
            Self::Syntax { location, message } if location.is_empty() => Self::Syntax {
                location: at.to_string(),
                message,
            },
            Self::Integrity { location, message } if location.is_empty() => Self::Integrity {
                location: at.to_string(),
                message,
            },
            Self::Policy {
                location,
                violation,
            } if location.is_empty() => Self::Policy {
                location: at.to_string(),
                violation,
            },
            other => other,
        }
    }

    /// The policy violation carried by this error, if any.
    #[must_use]
    pub fn violation(&self) -> Option<&PolicyViolation> {
        match self {
            Self::Policy { violation, .. } => Some(violation),
            _ => None,
        }
    }

    /// The location string, empty for ambient errors.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::Syntax { location, .. }
            | Self::Integrity { location, .. }
            | Self::Policy { location, .. } => location,
            _ => "",
        }
    }
}

// =============================================================================
// REFERENCE ROLE
// =============================================================================

/// Decides which attributes hold `Xref` cross-references.
///
/// The engine never hard-codes the naming convention; callers inject it.
/// Implementations must never classify the placeholder vocabulary
/// (`ref_xid`, `link_xid`).
pub trait ReferenceRole {
    /// Whether attribute `name` on `element` holds an `Xref`.
    fn is_reference(&self, element: &Element, name: &str) -> bool;
}

/// Name-based reference role: a prefix plus an explicit list of names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRole {
    /// Attributes whose name starts with this are references. Empty disables the rule.
    #[serde(default)]
    pub prefix: String,
    /// Attributes listed here are references regardless of prefix.
    #[serde(default)]
    pub attributes: BTreeSet<String>,
}

impl PrefixRole {
    /// Role matching every attribute that starts with `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            attributes: BTreeSet::new(),
        }
    }

    /// Also treat `name` as a reference attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.insert(name.into());
        self
    }
}

impl Default for PrefixRole {
    fn default() -> Self {
        Self::new("ref")
    }
}

impl ReferenceRole for PrefixRole {
    fn is_reference(&self, _element: &Element, name: &str) -> bool {
        if name == REF_XID_ATTR || name == LINK_XID_ATTR {
            return false;
        }
        self.attributes.contains(name) || (!self.prefix.is_empty() && name.starts_with(&self.prefix))
    }
}

// =============================================================================
// TESTS
// =============================================================================
