//! Auto-upgrade coordinator.
//!
//! Per (owner, program, tier) the coordinator moves through
//! `Watching -> Eligible -> Promoted`. An owner becomes eligible for tier
//! T+1 once `reserve(owner, program, T+1) >= cost(T+1)`. Promotion empties
//! that reserve, carries any surplus into the T+2 account and inserts the
//! reserve-funded T+1 record, all in one store commit.
//!
//! Running the coordinator again on a promoted owner changes nothing.

use std::fmt;

use canopy_store::{
    EntryKind, EntryReason, Funding, LedgerEntry, Money, ParticipantId, PlacementRecord,
    ReserveAccount, ReserveWrite, SlotStore,
};
use canopy_structure::{Program, Tier};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Context, Error, Result, StoreResultExt};
use crate::events::PromotionEvent;
use crate::locks::ScopeKey;
use crate::placement::{PlacementEngine, PlacementRequest};
use crate::shared::Shared;

/// Upgrade state of an owner at a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpgradeState {
    /// Reserve below the next tier's cost.
    Watching,
    /// Reserve covers the next tier's cost.
    Eligible,
    /// The next tier is held.
    Promoted,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watching => write!(f, "Watching"),
            Self::Eligible => write!(f, "Eligible"),
            Self::Promoted => write!(f, "Promoted"),
        }
    }
}

/// A committed promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub event: PromotionEvent,
    pub record: PlacementRecord,
}

pub struct Coordinator<S> {
    shared: Shared<S>,
    placement: PlacementEngine<S>,
}

impl<S> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            placement: self.placement.clone(),
        }
    }
}

impl<S: SlotStore> Coordinator<S> {
    pub(crate) fn new(shared: Shared<S>, placement: PlacementEngine<S>) -> Self {
        Self { shared, placement }
    }

    /// State of `owner` at `tier` with respect to tier + 1.
    pub async fn evaluate(&self, owner: ParticipantId, program: Program, tier: Tier) -> Result<UpgradeState> {
        let context = Context::new(owner, program, tier);
        let target = tier.next();
        if self.shared.holds(context, owner, program, target).await? {
            return Ok(UpgradeState::Promoted);
        }
        let Some(cost) = self.shared.config.cost(program, target) else {
            return Ok(UpgradeState::Watching);
        };
        let account = ReserveAccount::new(owner, program, target);
        let store = &*self.shared.store;
        let snapshot = self.shared.call(context, || store.read_reserve(account)).await?;
        if snapshot.balance.covers(&cost).in_context(context)? {
            Ok(UpgradeState::Eligible)
        } else {
            Ok(UpgradeState::Watching)
        }
    }

    /// Promote `owner` as far as their reserves allow.
    pub async fn run(&self, owner: ParticipantId, program: Program) -> Result<Vec<Promotion>> {
        let max = self.shared.config.program(program).max_tier();
        let mut promotions = Vec::new();
        loop {
            let context = Context::new(owner, program, max);
            let Some(held) = self.shared.highest_held(context, owner, program, max).await? else {
                break;
            };
            let account = ReserveAccount::new(owner, program, held.next());
            match self.promote(account).await? {
                Some(promotion) => promotions.push(promotion),
                None => break,
            }
        }
        Ok(promotions)
    }

    /// Promote the owner of `account` into `account.tier` if its reserve
    /// covers the cost. Returns `None` when not eligible or already held.
    pub async fn promote(&self, account: ReserveAccount) -> Result<Option<Promotion>> {
        let ReserveAccount {
            owner,
            program,
            tier: target,
        } = account;
        let context = Context::new(owner, program, target);
        let Some(from) = target.previous() else {
            return Ok(None);
        };
        let Some(cost) = self.shared.config.cost(program, target) else {
            return Ok(None);
        };
        let store = &*self.shared.store;

        let mut attempt = 0;
        loop {
            let outcome = {
                let _scope = self.shared.locks.acquire(ScopeKey::owner(program, owner)).await;
                if self.shared.holds(context, owner, program, target).await? {
                    debug!("{}: already promoted", context);
                    return Ok(None);
                }
                if !self.shared.holds(context, owner, program, from).await? {
                    return Ok(None);
                }
                let snapshot = self.shared.call(context, || store.read_reserve(account)).await?;
                if !snapshot.balance.covers(&cost).in_context(context)? {
                    return Ok(None);
                }

                let surplus = snapshot.balance.checked_sub(&cost).in_context(context)?;
                let mut writes = vec![ReserveWrite {
                    account,
                    expected_version: snapshot.version,
                    balance: Money::zero(cost.currency),
                    entry: LedgerEntry {
                        account,
                        kind: EntryKind::Debit,
                        amount: snapshot.balance,
                        reason: EntryReason::Promotion { to_tier: target },
                    },
                }];
                let carried = if surplus.is_zero() {
                    None
                } else {
                    let carry = account.carry_target();
                    let above = self.shared.call(context, || store.read_reserve(carry)).await?;
                    writes.push(ReserveWrite {
                        account: carry,
                        expected_version: above.version,
                        balance: above.balance.checked_add(&surplus).in_context(context)?,
                        entry: LedgerEntry {
                            account: carry,
                            kind: EntryKind::Credit,
                            amount: surplus,
                            reason: EntryReason::Carry { from_tier: target },
                        },
                    });
                    Some(surplus)
                };

                let referrer = self.shared.program_referrer(context, owner, program).await?;
                let request = PlacementRequest::synthetic(owner, referrer, program, target, Funding::Reserve);
                let anchor = self.placement.resolve_anchor(&request).await?;
                let draft = self.placement.plan(&request, anchor).await?;
                self.shared
                    .call(context, || store.commit_promotion(writes.clone(), draft.clone()))
                    .await
                    .map(|record| (record, carried))
            };

            match outcome {
                Ok((record, carried)) => {
                    info!(
                        "{}: promoted from {} with {} reserve{}",
                        context,
                        from,
                        cost,
                        carried
                            .map(|c| format!(", carried {} upward", c))
                            .unwrap_or_default()
                    );
                    return Ok(Some(Promotion {
                        event: PromotionEvent {
                            owner,
                            program,
                            from_tier: from,
                            to_tier: target,
                            funded_by: Funding::Reserve,
                            consumed: Some(cost),
                            carried,
                        },
                        record,
                    }));
                }
                Err(e) if e.is_conflict() => {
                    attempt += 1;
                    if attempt > self.shared.config.max_conflict_retries {
                        return Err(Error::PlacementFailed {
                            context,
                            attempts: attempt,
                        });
                    }
                    debug!("{}: promotion lost a race ({}), retrying", context, e);
                    self.shared.conflict_backoff(attempt - 1).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
