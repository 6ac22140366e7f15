//! # Vocabulary and Limits
//!
//! Fixed attribute names and runtime constants of the xrev engine.
//!
//! The placeholder vocabulary (`ref_xid`, `link_xid`, `expand`) and the two
//! canonical text encodings are the only bit-exact contracts the engine
//! imposes on persisted documents.

/// Element attribute carrying the lifeline id.
pub const ID_ATTR: &str = "id";

/// Element attribute carrying the revision (`#` = unassigned).
pub const REV_ATTR: &str = "rev";

/// Combined identity attribute (`id:rev`), exclusive with `id`/`rev`.
pub const XID_ATTR: &str = "xid";

/// Optional informational version (`major.minor`).
pub const VERSION_ATTR: &str = "version";

/// Local property marker, scoped to the nearest identified ancestor.
pub const PROPERTY_ATTR: &str = "prop";

/// Placeholder attribute naming the included identity.
pub const REF_XID_ATTR: &str = "ref_xid";

/// Placeholder attribute naming the internal link identity of one inclusion point.
pub const LINK_XID_ATTR: &str = "link_xid";

/// Placeholder attribute recording the expansion policy.
pub const EXPAND_ATTR: &str = "expand";

/// Textual form of an unassigned revision.
pub const UNASSIGNED_TOKEN: &str = "#";

/// Internal identity type for inclusion points.
pub const LINK_TYPE: &str = "link";

/// Internal identity type for stored nodes.
pub const NODE_TYPE: &str = "node";

/// Magic bytes for the xrev repository snapshot format.
pub const MAGIC_BYTES: &[u8; 4] = b"XREV";

/// Current serialization format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Revision given to the first commit of a fresh repository.
pub const FIRST_REVISION: u64 = 1;

/// Seed of the internal uid generator when none is configured.
pub const DEFAULT_UID_SEED: u64 = 0x7872_6576;

/// Maximum attempts at drawing an unused internal uid.
///
/// The uid space is 32 bits; hitting this limit means the index is
/// effectively full.
pub const MAX_UID_ATTEMPTS: usize = 1024;

/// Maximum length for an identity or property name.
///
/// Longer names are rejected by the identity parser.
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum number of path segments in an `Xref`.
pub const MAX_XREF_SEGMENTS: usize = 64;
