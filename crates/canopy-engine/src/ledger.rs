//! Reserve ledger.
//!
//! Reserves accumulate fee shares earmarked for an owner's next tier. Every
//! balance change is a compare-and-swap on the account version with a
//! journal entry written in the same step, taken under the owner's scope.
//!
//! Attribution of a fee-carrying activation:
//! - **Matrix**: a middle slot (center child of a level-1 node) sends
//!   `F(matrix, T)` of its tier-T fee to the instance owner's tier T+1
//!   reserve.
//! - **Binary**: every activation sends `F(binary, T)` of its fee to the
//!   placement parent's reserve for the parent's next tier.
//! - **Global**: nothing; global advances through phase completion.
//!
//! A share whose recipient cannot use it (top tier reached, or the target
//! tier already held) is reported as a payout instead of being reserved.

use canopy_store::{
    EntryKind, EntryReason, LedgerEntry, Money, ParticipantId, PlacementRecord, ReserveAccount,
    ReserveWrite, SlotStore,
};
use canopy_structure::{Program, SlotRole, Tier};
use tracing::{debug, trace};

use crate::error::{Context, Error, Result, StoreResultExt};
use crate::events::Event;
use crate::locks::ScopeKey;
use crate::shared::Shared;

/// What crediting one activation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub events: Vec<Event>,
    /// Accounts whose balance grew and should be evaluated for promotion.
    pub credited: Vec<ReserveAccount>,
}

pub struct ReserveLedger<S> {
    shared: Shared<S>,
}

impl<S> Clone for ReserveLedger<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: SlotStore> ReserveLedger<S> {
    pub(crate) fn new(shared: Shared<S>) -> Self {
        Self { shared }
    }

    pub async fn balance(&self, owner: ParticipantId, program: Program, tier: Tier) -> Result<Money> {
        let account = ReserveAccount::new(owner, program, tier);
        let store = &*self.shared.store;
        let snapshot = self
            .shared
            .call(context_of(&account), || store.read_reserve(account))
            .await?;
        Ok(snapshot.balance)
    }

    /// Add `amount` to an account; returns the new balance.
    pub async fn credit(
        &self,
        owner: ParticipantId,
        program: Program,
        tier: Tier,
        amount: Money,
        reason: EntryReason,
    ) -> Result<Money> {
        let account = ReserveAccount::new(owner, program, tier);
        let context = context_of(&account);
        if amount.is_negative() {
            return Err(canopy_store::Error::Invariant(format!("negative credit {}", amount)))
                .in_context(context);
        }
        self.update(account, EntryKind::Credit, amount, reason, |balance| {
            balance.checked_add(&amount).in_context(context)
        })
        .await
    }

    /// Remove `amount` from an account; a debit larger than the balance is
    /// refused, never clamped.
    pub async fn debit(
        &self,
        owner: ParticipantId,
        program: Program,
        tier: Tier,
        amount: Money,
        reason: EntryReason,
    ) -> Result<Money> {
        let account = ReserveAccount::new(owner, program, tier);
        let context = context_of(&account);
        self.update(account, EntryKind::Debit, amount, reason, |balance| {
            if !balance.covers(&amount).in_context(context)? {
                return Err(Error::ReserveUnderflow {
                    context,
                    balance,
                    debit: amount,
                });
            }
            balance.checked_sub(&amount).in_context(context)
        })
        .await
    }

    /// Empty an account; returns what it held.
    pub async fn debit_to_zero(&self, owner: ParticipantId, program: Program, tier: Tier) -> Result<Money> {
        let account = ReserveAccount::new(owner, program, tier);
        let context = context_of(&account);
        let store = &*self.shared.store;
        let _scope = self.shared.locks.acquire(ScopeKey::owner(program, owner)).await;

        let mut attempt = 0;
        loop {
            let snapshot = self.shared.call(context, || store.read_reserve(account)).await?;
            if snapshot.balance.is_negative() {
                return Err(Error::ReserveUnderflow {
                    context,
                    balance: snapshot.balance,
                    debit: snapshot.balance,
                });
            }
            if snapshot.balance.is_zero() {
                return Ok(snapshot.balance);
            }
            let write = ReserveWrite {
                account,
                expected_version: snapshot.version,
                balance: Money::zero(snapshot.balance.currency),
                entry: LedgerEntry {
                    account,
                    kind: EntryKind::Debit,
                    amount: snapshot.balance,
                    reason: EntryReason::Manual,
                },
            };
            match self.shared.call(context, || store.write_reserve(write.clone())).await {
                Ok(_) => {
                    debug!("{}: reserve emptied, {} consumed", context, snapshot.balance);
                    return Ok(snapshot.balance);
                }
                Err(e) if e.is_conflict() && attempt < self.shared.config.max_conflict_retries => {
                    attempt += 1;
                    self.shared.conflict_backoff(attempt - 1).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compare-and-swap loop under the owner's scope.
    async fn update<F>(
        &self,
        account: ReserveAccount,
        kind: EntryKind,
        amount: Money,
        reason: EntryReason,
        next: F,
    ) -> Result<Money>
    where
        F: Fn(Money) -> Result<Money>,
    {
        let context = context_of(&account);
        let store = &*self.shared.store;
        let _scope = self
            .shared
            .locks
            .acquire(ScopeKey::owner(account.program, account.owner))
            .await;

        let mut attempt = 0;
        loop {
            let snapshot = self.shared.call(context, || store.read_reserve(account)).await?;
            let balance = next(snapshot.balance)?;
            let write = ReserveWrite {
                account,
                expected_version: snapshot.version,
                balance,
                entry: LedgerEntry {
                    account,
                    kind,
                    amount,
                    reason: reason.clone(),
                },
            };
            match self.shared.call(context, || store.write_reserve(write.clone())).await {
                Ok(version) => {
                    trace!("{}: reserve {} (v{})", context, balance, version);
                    return Ok(balance);
                }
                Err(e) if e.is_conflict() && attempt < self.shared.config.max_conflict_retries => {
                    attempt += 1;
                    self.shared.conflict_backoff(attempt - 1).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Credit a share unless the account's journal already holds `reason`.
    /// Returns the new balance, or `None` for a share credited before.
    async fn credit_share(
        &self,
        account: ReserveAccount,
        amount: Money,
        reason: EntryReason,
    ) -> Result<Option<Money>> {
        let context = context_of(&account);
        let store = &*self.shared.store;
        let _scope = self
            .shared
            .locks
            .acquire(ScopeKey::owner(account.program, account.owner))
            .await;

        let mut attempt = 0;
        loop {
            // The CAS below fails if an entry lands after this snapshot.
            let snapshot = self.shared.call(context, || store.read_reserve(account)).await?;
            let journal = self
                .shared
                .call(context, || store.journal_entries(account))
                .await?;
            if journal.iter().any(|entry| entry.reason == reason) {
                return Ok(None);
            }
            let write = ReserveWrite {
                account,
                expected_version: snapshot.version,
                balance: snapshot.balance.checked_add(&amount).in_context(context)?,
                entry: LedgerEntry {
                    account,
                    kind: EntryKind::Credit,
                    amount,
                    reason: reason.clone(),
                },
            };
            match self.shared.call(context, || store.write_reserve(write.clone())).await {
                Ok(version) => {
                    trace!("{}: reserve {} (v{})", context, write.balance, version);
                    return Ok(Some(write.balance));
                }
                Err(e) if e.is_conflict() && attempt < self.shared.config.max_conflict_retries => {
                    attempt += 1;
                    self.shared.conflict_backoff(attempt - 1).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Credit the fee share of a new activation to the account its
    /// structural position names. Attributing the same record again credits
    /// nothing but still names the account.
    pub async fn attribute(&self, record: &PlacementRecord) -> Result<Attribution> {
        let mut attribution = Attribution::default();
        if !record.funded_by.carries_fee() {
            return Ok(attribution);
        }
        let context = Context::new(record.participant, record.program, record.tier);
        let config = &self.shared.config;
        let Some(fee) = config.cost(record.program, record.tier) else {
            return Ok(attribution);
        };
        let fraction = config.fraction(record.program, record.tier);
        if fraction.is_zero() {
            return Ok(attribution);
        }
        let share = fee.scale(fraction).in_context(context)?;

        let (recipient, target) = match record.program {
            Program::Matrix => {
                let Some(instance) = record.structure.instance() else {
                    return Ok(attribution);
                };
                if record.slot_role != SlotRole::Middle {
                    return Ok(attribution);
                }
                let target = record.tier.next();
                let held = self
                    .shared
                    .holds(context, instance.owner, record.program, target)
                    .await?;
                (instance.owner, (!held).then_some(target))
            }
            Program::Binary => {
                let Some(parent) = record.placement_parent else {
                    return Ok(attribution);
                };
                let max = config.program(record.program).max_tier();
                let held = self
                    .shared
                    .highest_held(context, parent, record.program, max)
                    .await?
                    .unwrap_or(record.tier);
                (parent, Some(held.next()))
            }
            Program::Global => return Ok(attribution),
        };

        match target.filter(|t| config.has_tier(record.program, *t)) {
            Some(target) => {
                let account = ReserveAccount::new(recipient, record.program, target);
                let reason = EntryReason::ActivationShare {
                    from: record.participant,
                    tier: record.tier,
                    record: record.id,
                };
                match self.credit_share(account, share, reason).await? {
                    Some(balance) => {
                        debug!(
                            "{}: credited {} to {} {} reserve, balance {}",
                            context, share, recipient, target, balance
                        );
                        attribution.events.push(Event::ReserveCredited {
                            account,
                            amount: share,
                            balance,
                            from: record.participant,
                        });
                    }
                    None => debug!("{}: share already in {} {} reserve", context, recipient, target),
                }
                attribution.credited.push(account);
            }
            None => {
                debug!("{}: {} share paid out to {}", context, share, recipient);
                attribution.events.push(Event::Payout {
                    recipient,
                    program: record.program,
                    tier: record.tier,
                    amount: share,
                    from: record.participant,
                });
            }
        }
        Ok(attribution)
    }
}

fn context_of(account: &ReserveAccount) -> Context {
    Context::new(account.owner, account.program, account.tier)
}
