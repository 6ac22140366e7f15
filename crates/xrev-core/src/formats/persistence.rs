//! # Persistence Format
//!
//! Binary snapshot of a whole repository.
//!
//! Format: Header (5 bytes) + postcard-serialized `SerializableRepository`.
//! - 4 bytes: Magic ("XREV")
//! - 1 byte: Version
//!
//! Only committed state is written. Size and header are validated before the
//! payload is decoded, and the decoded snapshot is checked for duplicate
//! identities and branching successor links while the indices are rebuilt.

use crate::primitives;
use crate::repository::{MemoryRepository, SerializableRepository};
use crate::types::XrevError;

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum accepted snapshot size.
///
/// Checked before decoding so a corrupted length never drives an allocation.
pub const MAX_PERSISTENCE_PAYLOAD_SIZE: usize = 500 * 1024 * 1024; // 500 MB

/// Header only.
const HEADER_SIZE: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

/// The persistence header precedes all repository data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl PersistenceHeader {
    /// Header for the current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), XrevError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(XrevError::DeserializationError(
                "not an xrev repository (bad magic bytes)".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(XrevError::DeserializationError(format!(
                "unsupported format version {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, XrevError> {
        if bytes.len() < HEADER_SIZE {
            return Err(XrevError::DeserializationError(
                "header too short".to_string(),
            ));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: bytes[4],
        })
    }
}

impl Default for PersistenceHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Serialize the committed state of a repository (header + payload).
pub fn repository_to_bytes(repo: &MemoryRepository) -> Result<Vec<u8>, XrevError> {
    let header = PersistenceHeader::new();
    let snapshot = SerializableRepository::from(repo);

    let payload = postcard::to_stdvec(&snapshot)
        .map_err(|e| XrevError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&header.to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Decode a repository snapshot.
pub fn repository_from_bytes(bytes: &[u8]) -> Result<MemoryRepository, XrevError> {
    if bytes.len() < HEADER_SIZE {
        return Err(XrevError::DeserializationError(format!(
            "data too short: minimum {} bytes required",
            HEADER_SIZE
        )));
    }
    if bytes.len() > MAX_PERSISTENCE_PAYLOAD_SIZE {
        return Err(XrevError::DeserializationError(format!(
            "data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_PERSISTENCE_PAYLOAD_SIZE
        )));
    }

    let header = PersistenceHeader::from_bytes(bytes)?;
    header.validate()?;

    let snapshot: SerializableRepository = postcard::from_bytes(&bytes[HEADER_SIZE..])
        .map_err(|e| XrevError::DeserializationError(format!("corrupt repository data: {}", e)))?;

    MemoryRepository::try_from(snapshot)
}

// =============================================================================
// TESTS
// =============================================================================
