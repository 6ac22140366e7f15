//! # Formats
//!
//! Byte-level encodings of repository state. File I/O lives in the app layer.

pub mod persistence;

pub use persistence::{
    MAX_PERSISTENCE_PAYLOAD_SIZE, PersistenceHeader, repository_from_bytes, repository_to_bytes,
};
