//! Error types for the slot store.

use thiserror::Error;

use crate::ids::{InstanceId, ParticipantId, StructureId};
use crate::money::Currency;
use canopy_structure::Position;

/// Result type for slot store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in slot store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Optimistic concurrency failure; the caller may rescan and retry.
    #[error("conflict: {0}")]
    Conflict(#[from] Conflict),

    /// Referenced record or node does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient backend failure
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Arithmetic across two currencies
    #[error("currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Invalid currency code
    #[error("invalid currency code: {0:?}")]
    InvalidCurrency(String),

    /// A write would break a store invariant
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Optimistic concurrency failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    /// A concurrent insert already filled the slot.
    #[error("slot {position:?} under {parent} in {structure} already taken")]
    SlotTaken {
        structure: StructureId,
        parent: ParticipantId,
        position: Position,
    },

    /// A record with the same key already exists.
    #[error("record already exists for {0}")]
    RecordExists(ParticipantId),

    /// The structure's root was claimed by someone else.
    #[error("root of {0} already claimed")]
    RootClaimed(StructureId),

    /// Reserve version moved since it was read.
    #[error("reserve version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// The matrix instance is archived or full.
    #[error("instance {0} is closed")]
    InstanceClosed(InstanceId),
}
