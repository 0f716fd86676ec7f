//! Error types for canopy-engine.

use std::fmt;
use std::time::Duration;

use canopy_store::{InstanceId, Money, ParticipantId, RecordId};
use canopy_structure::{Program, Tier};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for canopy-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Who, where and at which tier an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub participant: ParticipantId,
    pub program: Program,
    pub tier: Tier,
}

impl Context {
    pub const fn new(participant: ParticipantId, program: Program, tier: Tier) -> Self {
        Self {
            participant,
            program,
            tier,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {} {}", self.participant, self.program, self.tier)
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The participant already holds this program tier.
    #[error("{context}: already placed as {existing:?}")]
    AlreadyPlaced { context: Context, existing: RecordId },

    /// The named referrer has never joined the program.
    #[error("{context}: referrer {referrer} has not joined the program")]
    NoReferrer {
        context: Context,
        referrer: ParticipantId,
    },

    /// A participant named themselves as referrer.
    #[error("{context}: a participant cannot refer themselves")]
    SelfReferral { context: Context },

    /// The referrer has not activated the requested tier.
    #[error("{context}: referrer {referrer} does not hold the tier")]
    ReferrerNotEligible {
        context: Context,
        referrer: ParticipantId,
    },

    /// Tiers must be activated in order.
    #[error("{context}: previous tier not held")]
    PreviousTierMissing { context: Context },

    /// The tier is not configured for the program.
    #[error("{context}: tier is not configured")]
    UnknownTier { context: Context },

    /// An activation without a referrer asked for a root that is taken.
    #[error("{context}: root already claimed")]
    RootAlreadyClaimed { context: Context },

    /// Conflict retries were exhausted without finding a free slot.
    #[error("{context}: placement failed after {attempts} attempts")]
    PlacementFailed { context: Context, attempts: u32 },

    /// The anchor's matrix instance is complete but not yet recycled.
    #[error("{context}: {instance} is complete and awaiting its recycle")]
    InstanceFull {
        context: Context,
        instance: InstanceId,
    },

    /// No ancestor within the depth cap holds the tier.
    #[error("{context}: no eligible ancestor within {max_depth} levels")]
    SweepoverExhausted { context: Context, max_depth: u32 },

    /// A debit larger than the balance.
    #[error("{context}: reserve underflow, balance {balance}, debit {debit}")]
    ReserveUnderflow {
        context: Context,
        balance: Money,
        debit: Money,
    },

    /// A placement parent chain revisited a participant.
    #[error("{context}: cycle detected at {at}")]
    CycleDetected { context: Context, at: ParticipantId },

    /// The store did not answer in time, even after retries.
    #[error("{context}: store timeout after {after:?}")]
    Timeout { context: Context, after: Duration },

    /// A non-transient store failure.
    #[error("{context}: store error: {source}")]
    Store {
        context: Context,
        #[source]
        source: canopy_store::Error,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The store could not list records awaiting settlement.
    #[error("listing unsettled records failed: {0}")]
    Unsettled(#[source] canopy_store::Error),
}

impl Error {
    /// The participant, program and tier involved, if any.
    pub fn context(&self) -> Option<&Context> {
        match self {
            Self::AlreadyPlaced { context, .. }
            | Self::NoReferrer { context, .. }
            | Self::SelfReferral { context }
            | Self::ReferrerNotEligible { context, .. }
            | Self::PreviousTierMissing { context }
            | Self::UnknownTier { context }
            | Self::RootAlreadyClaimed { context }
            | Self::PlacementFailed { context, .. }
            | Self::InstanceFull { context, .. }
            | Self::SweepoverExhausted { context, .. }
            | Self::ReserveUnderflow { context, .. }
            | Self::CycleDetected { context, .. }
            | Self::Timeout { context, .. }
            | Self::Store { context, .. } => Some(context),
            Self::Config(_) | Self::Unsettled(_) => None,
        }
    }

    /// Whether this is a store conflict that a rescan may resolve.
    pub(crate) fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store {
                source: canopy_store::Error::Conflict(_),
                ..
            }
        )
    }
}

/// Attach a [`Context`] to store results.
pub(crate) trait StoreResultExt<T> {
    fn in_context(self, context: Context) -> Result<T>;
}

impl<T> StoreResultExt<T> for canopy_store::Result<T> {
    fn in_context(self, context: Context) -> Result<T> {
        self.map_err(|source| Error::Store { context, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_store::Conflict;

    #[test]
    fn messages_carry_context() {
        let context = Context::new(ParticipantId(7), Program::Matrix, Tier(2));
        let err = Error::PreviousTierMissing { context };
        assert_eq!(err.to_string(), "P7 in matrix T2: previous tier not held");
        assert_eq!(err.context(), Some(&context));
        assert!(Error::Config("bad".into()).context().is_none());
    }

    #[test]
    fn only_store_conflicts_are_rescannable() {
        let context = Context::new(ParticipantId(1), Program::Binary, Tier(1));
        let conflict: canopy_store::Result<()> =
            Err(Conflict::RecordExists(ParticipantId(1)).into());
        assert!(conflict.in_context(context).unwrap_err().is_conflict());

        let missing: canopy_store::Result<()> = Err(canopy_store::Error::NotFound("x".into()));
        assert!(!missing.in_context(context).unwrap_err().is_conflict());
    }
}
