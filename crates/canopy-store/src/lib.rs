//! Canopy Slot Store
//!
//! The persistent relation behind placement: who sits where, which reserve
//! balances exist, and which matrix instances are open or archived.
//!
//! # Contract
//!
//! - Placement inserts fail with a conflict when a concurrent insert already
//!   filled the slot, so placers can rescan instead of double-booking.
//! - Reserve writes are compare-and-swap on a version field and append to an
//!   audit journal in the same step.
//! - Promotion writes (reserve debit, surplus carry, activation record) are
//!   committed together or not at all.
//!
//! [`MemoryStore`] is the reference implementation used by the engine's
//! tests and the scenario replayer.

mod error;
mod ids;
mod memory;
mod money;
mod record;
mod reserve;
mod store;

pub use error::{Conflict, Error, Result};
pub use ids::{InstanceId, ParticipantId, RecordId, RootKey, StructureId};
pub use memory::{MemoryStore, StoreState};
pub use money::{Currency, Money};
pub use record::{Funding, PlacementDraft, PlacementRecord, RecordKey};
pub use reserve::{EntryKind, EntryReason, LedgerEntry, ReserveAccount, ReserveSnapshot, ReserveWrite};
pub use store::{MatrixInstance, SlotStore};
