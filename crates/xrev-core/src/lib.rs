//! # xrev-core
//!
//! Revision tracking for identified sub-trees of structured documents.
//!
//! Elements carrying an identity (`id`+`rev` or `xid`) are stored as
//! individual, deduplicated nodes; their parents keep only lightweight
//! placeholders. Every commit decides, per identified element, whether it is
//! unchanged, new, or a legal next revision of its lifeline, and refuses
//! branches and stolen identities.
//!
//! ## Layers
//!
//! - `identity`, `tree`, `canonical`: value types and the single notion of sameness
//! - `normalize`: placeholders, manifestations, round-trip to stored form
//! - `ingest`, `migrate`, `resolve`: the commit, repair and lookup algorithms
//! - `repository`: the storage contract and the in-memory arena behind it
//! - `session`, `formats`: commit orchestration and snapshot bytes
//!
//! ## Constraints
//!
//! - Synchronous, single writer, no network
//! - Deterministic: `BTreeMap` only, seeded uid generator
//! - No panics in library code; every failure is an `XrevError`

// =============================================================================
// MODULES
// =============================================================================

pub mod canonical;
pub mod formats;
pub mod identity;
pub mod ingest;
pub mod migrate;
pub mod normalize;
pub mod primitives;
pub mod repository;
pub mod resolve;
pub mod session;
pub mod tree;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use identity::{Rev, Version, Xid, Xref, read_xid, write_xid};
pub use tree::{Attr, Content, Document, Element, ElementPath};
pub use types::{PolicyViolation, PrefixRole, ReferenceRole, XrevError};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use canonical::{canonical_string, content_digest, equal};
pub use ingest::{DanglingReference, IngestOutcome, IngestPolicy, Ingestor};
pub use migrate::{
    EdgeKind, MigrationGraph, MigrationReport, Rewrite, Unresolvable, UnresolvableReason,
    build_graph,
};
pub use normalize::{
    Manifestation, MigrationMap, Normalized, PayloadStore, RefXidRecord, denormalize, normalize,
};
pub use repository::{Commit, File, FileChange, MemoryRepository, Node, Repository};
pub use resolve::resolve;
pub use session::{CommitSummary, FileState, FileStatus, Session};

// =============================================================================
// RE-EXPORTS: Formats
// =============================================================================

pub use formats::{PersistenceHeader, repository_from_bytes, repository_to_bytes};
