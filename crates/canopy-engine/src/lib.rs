//! Canopy Engine - Placement and Value Flow for Tiered Incentive Programs
//!
//! This crate decides where each activation sits in its program's tree and
//! carries out everything that follows from it.
//!
//! # Overview
//!
//! ## Placement
//!
//! The [`PlacementEngine`] finds the first open slot in level order below
//! the anchor (the referrer, an eligible ancestor, or the root) and commits
//! the record. A slot taken by a racing placer is detected by the store and
//! the scan is repeated, so concurrent joins never share a slot.
//!
//! ## Value Flow
//!
//! - [`ReserveLedger`] credits fee shares to the reserve of the owner the
//!   placement names, one compare-and-swap and journal line per change
//! - [`Coordinator`] promotes an owner once a reserve covers the next tier,
//!   carrying any surplus into the account above
//! - [`RecycleManager`] archives a complete matrix instance and re-enters
//!   its owner under their upline
//! - [`GlobalPhases`] moves completed global nodes into phase two and then
//!   into the next tier
//!
//! ## Sweepover
//!
//! When the natural recipient of a synthetic placement does not hold the
//! tier, the [`SweepoverResolver`] walks up the placement chain to the
//! nearest ancestor that does, within a configured depth.
//!
//! # Example
//!
//! ```rust,ignore
//! use canopy_engine::{ActivationRequest, Engine, EngineConfig};
//! use canopy_store::{Currency, MemoryStore, ParticipantId};
//! use canopy_structure::{Program, Tier};
//!
//! let engine = Engine::new(Arc::new(MemoryStore::new(Currency::USD)), EngineConfig::default())?;
//! engine
//!     .activate(ActivationRequest::new(ParticipantId(1), None, Program::Binary, Tier(1)))
//!     .await?;
//! let outcome = engine
//!     .activate(ActivationRequest::new(ParticipantId(2), Some(ParticipantId(1)), Program::Binary, Tier(1)))
//!     .await?;
//! for event in outcome.events {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

mod config;
mod engine;
mod error;
mod events;
mod global;
mod ledger;
mod locks;
mod placement;
mod recycle;
mod retry;
mod shared;
mod sweepover;
#[cfg(test)]
mod testing;
mod upgrade;

pub use config::{EngineConfig, ProgramConfig};
pub use engine::{ActivationOutcome, ActivationRequest, Engine};
pub use error::{Context, Error, Result};
pub use events::{Event, PhaseEvent, PlacementResult, PromotionEvent, RecycleEvent};
pub use global::{Advance, GlobalPhases};
pub use ledger::{Attribution, ReserveLedger};
pub use locks::{ScopeGuard, ScopeKey, ScopeLocks};
pub use placement::PlacementEngine;
pub use recycle::{Recycle, RecycleManager};
pub use retry::{with_retry, RetryPolicy};
pub use sweepover::{Recipient, SweepoverResolver};
pub use upgrade::{Coordinator, Promotion, UpgradeState};
