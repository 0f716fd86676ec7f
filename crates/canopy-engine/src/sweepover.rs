//! Sweepover resolution.
//!
//! When the structurally correct anchor for an entrant does not hold the
//! tier, the resolver walks the entrant's placement-parent chain upward and
//! returns the first ancestor that does. The walk is iterative, capped at a
//! configured depth and fails fast on a revisited participant.

use std::collections::HashSet;

use canopy_store::{ParticipantId, SlotStore};
use canopy_structure::{Program, Tier};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Context, Error, Result};
use crate::shared::Shared;

/// Outcome of a sweepover resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// The nearest ancestor holding the tier.
    Ancestor(ParticipantId),
    /// Nobody within the depth cap holds the tier; use the configured
    /// fallback account, or the structure root when none is configured.
    Fallback { account: Option<ParticipantId> },
}

pub struct SweepoverResolver<S> {
    shared: Shared<S>,
}

impl<S> Clone for SweepoverResolver<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: SlotStore> SweepoverResolver<S> {
    pub(crate) fn new(shared: Shared<S>) -> Self {
        Self { shared }
    }

    /// First ancestor of `participant` holding `tier`, within `max_depth` hops.
    ///
    /// The chain followed is the participant's placement chain in the
    /// highest tier they hold at or below `tier`.
    pub async fn resolve_eligible_ancestor(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
        max_depth: u32,
    ) -> Result<Option<ParticipantId>> {
        let context = Context::new(participant, program, tier);
        let Some(chain_tier) = self
            .shared
            .highest_held(context, participant, program, tier)
            .await?
        else {
            debug!("{}: holds no tier to walk from", context);
            return Ok(None);
        };

        let mut visited = HashSet::from([participant]);
        let mut current = participant;
        for hop in 0..max_depth {
            let Some(record) = self
                .shared
                .latest_record(context, current, program, chain_tier)
                .await?
            else {
                return Ok(None);
            };
            let Some(parent) = record.placement_parent else {
                debug!("{}: reached the {} root after {} hops", context, chain_tier, hop);
                return Ok(None);
            };
            if !visited.insert(parent) {
                return Err(Error::CycleDetected {
                    context,
                    at: parent,
                });
            }
            if self.shared.holds(context, parent, program, tier).await? {
                debug!("{}: eligible ancestor {} found {} hops up", context, parent, hop + 1);
                return Ok(Some(parent));
            }
            current = parent;
        }
        Ok(None)
    }

    /// Like [`resolve_eligible_ancestor`](Self::resolve_eligible_ancestor)
    /// with the configured depth cap, failing with `SweepoverExhausted`.
    pub async fn require_eligible_ancestor(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Result<ParticipantId> {
        let max_depth = self.shared.config.sweepover_max_depth;
        self.resolve_eligible_ancestor(participant, program, tier, max_depth)
            .await?
            .ok_or(Error::SweepoverExhausted {
                context: Context::new(participant, program, tier),
                max_depth,
            })
    }

    /// Resolve a recipient, routing exhaustion to the fallback account.
    pub async fn resolve(
        &self,
        participant: ParticipantId,
        program: Program,
        tier: Tier,
    ) -> Result<Recipient> {
        match self.require_eligible_ancestor(participant, program, tier).await {
            Ok(ancestor) => Ok(Recipient::Ancestor(ancestor)),
            Err(Error::SweepoverExhausted { context, max_depth }) => {
                let account = self.shared.config.fallback_account;
                warn!(
                    "{}: no eligible ancestor within {} levels, falling back to {:?}",
                    context, max_depth, account
                );
                Ok(Recipient::Fallback { account })
            }
            Err(e) => Err(e),
        }
    }
}
