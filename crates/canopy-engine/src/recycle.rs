//! Matrix recycling.
//!
//! An instance completes at exactly 39 occupied slots. The manager then
//! archives it, opens the owner's next instance and re-enters the owner as
//! a fee-free entrant in their upline's current instance, in one commit.
//!
//! A participant occupies at most one slot per instance. When the upline's
//! current instance already holds the owner, the re-entry moves up to the
//! next upline whose current instance does not. The tier's root, and an
//! owner with no such upline, only get the fresh instance.

use std::collections::HashSet;

use canopy_store::{Funding, InstanceId, ParticipantId, PlacementRecord, SlotStore, StructureId};
use canopy_structure::{Program, Tier, MATRIX_CAPACITY};
use tracing::{debug, info};

use crate::error::{Context, Error, Result};
use crate::events::RecycleEvent;
use crate::locks::ScopeKey;
use crate::placement::{Anchor, AnchorMode, PlacementEngine, PlacementRequest};
use crate::shared::Shared;

/// A committed recycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recycle {
    pub event: RecycleEvent,
    pub reentry: Option<PlacementRecord>,
}

pub struct RecycleManager<S> {
    shared: Shared<S>,
    placement: PlacementEngine<S>,
}

impl<S> Clone for RecycleManager<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            placement: self.placement.clone(),
        }
    }
}

impl<S: SlotStore> RecycleManager<S> {
    pub(crate) fn new(shared: Shared<S>, placement: PlacementEngine<S>) -> Self {
        Self { shared, placement }
    }

    /// Recycle `instance` if it is current and complete; otherwise `None`.
    pub async fn recycle_if_complete(&self, instance: InstanceId) -> Result<Option<Recycle>> {
        let owner = instance.owner;
        let tier = instance.tier;
        let context = Context::new(owner, Program::Matrix, tier);
        let store = &*self.shared.store;

        let mut attempt = 0;
        loop {
            let outcome = {
                let _scope = self
                    .shared
                    .locks
                    .acquire(ScopeKey::owner(Program::Matrix, owner))
                    .await;
                let state = self.shared.call(context, || store.instance(instance)).await?;
                let current = self
                    .shared
                    .call(context, || store.current_instance(owner, tier))
                    .await?;
                if state.archived || current != instance || state.population < MATRIX_CAPACITY {
                    return Ok(None);
                }

                let host = self.reentry_host(context, owner, tier).await?;
                let draft = match host {
                    Some(host) => {
                        let cycle = self
                            .shared
                            .call(context, || store.records_for(owner, Program::Matrix, tier))
                            .await?
                            .len() as u32;
                        let request = PlacementRequest::synthetic(
                            owner,
                            Some(host),
                            Program::Matrix,
                            tier,
                            Funding::Recycle,
                        )
                        .with_cycle(cycle)
                        .with_mode(AnchorMode::Fixed(Anchor::Instance(host)));
                        Some(self.placement.plan(&request, Anchor::Instance(host)).await?)
                    }
                    None => None,
                };
                self.shared
                    .call(context, || store.commit_recycle(instance, draft.clone()))
                    .await
                    .map(|(next, record)| (next, record, host))
            };

            match outcome {
                Ok((next, reentry, host)) => {
                    info!(
                        "{}: {} complete, reopened as {}, re-entered under {:?}",
                        context, instance, next, host
                    );
                    return Ok(Some(Recycle {
                        event: RecycleEvent {
                            owner,
                            program: Program::Matrix,
                            tier,
                            old_instance_id: instance,
                            new_instance_id: next,
                            reentered_under: host,
                        },
                        reentry,
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
                    debug!("{}: recycle lost a race ({}), retrying", context, e);
                    self.shared.conflict_backoff(attempt - 1).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The upline whose current instance receives the owner's re-entry.
    async fn reentry_host(
        &self,
        context: Context,
        owner: ParticipantId,
        tier: Tier,
    ) -> Result<Option<ParticipantId>> {
        let store = &*self.shared.store;
        let memberships = self
            .shared
            .call(context, || store.records_for(owner, Program::Matrix, tier))
            .await?;
        let occupied: HashSet<StructureId> = memberships.iter().map(|r| r.structure).collect();

        let mut visited = HashSet::from([owner]);
        let mut member = memberships.last().cloned();
        for _ in 0..self.shared.config.sweepover_max_depth {
            let Some(record) = member else {
                return Ok(None);
            };
            let Some(upline) = record
                .placement_parent
                .and(record.structure.instance())
                .map(|i| i.owner)
            else {
                return Ok(None);
            };
            if !visited.insert(upline) {
                return Err(Error::CycleDetected { context, at: upline });
            }
            let current = self
                .shared
                .call(context, || store.current_instance(upline, tier))
                .await?;
            if !occupied.contains(&StructureId::Matrix { instance: current }) {
                return Ok(Some(upline));
            }
            debug!("{}: already in {}, moving up from {}", context, current, upline);
            member = self
                .shared
                .latest_record(context, upline, Program::Matrix, tier)
                .await?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sweepover::SweepoverResolver;
    use canopy_store::{Currency, MemoryStore};
    use canopy_structure::Position;
    use std::sync::Arc;

    fn components() -> (PlacementEngine<MemoryStore>, RecycleManager<MemoryStore>) {
        let shared = Shared::new(Arc::new(MemoryStore::new(Currency::USD)), EngineConfig::default());
        let placement = PlacementEngine::new(shared.clone(), SweepoverResolver::new(shared.clone()));
        let recycler = RecycleManager::new(shared, placement.clone());
        (placement, recycler)
    }

    async fn join_all(placement: &PlacementEngine<MemoryStore>, referrer: u64, ids: impl Iterator<Item = u64>) {
        for id in ids {
            placement
                .place(ParticipantId(id), Some(ParticipantId(referrer)), Program::Matrix, Tier(1))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn nothing_happens_before_the_39th_member() {
        let (placement, recycler) = components();
        placement.place(ParticipantId(1), None, Program::Matrix, Tier(1)).await.unwrap();
        join_all(&placement, 1, 2..=39).await;

        let instance = InstanceId::first(ParticipantId(1), Tier(1));
        assert!(recycler.recycle_if_complete(instance).await.unwrap().is_none());

        join_all(&placement, 1, 40..=40).await;
        let recycle = recycler.recycle_if_complete(instance).await.unwrap().unwrap();
        assert_eq!(recycle.event.old_instance_id, instance);
        assert_eq!(recycle.event.new_instance_id, instance.successor());
        // The root has no upline to re-enter under.
        assert_eq!(recycle.reentry, None);
        assert!(recycler.recycle_if_complete(instance).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn owner_reenters_the_uplines_current_instance() {
        let (placement, recycler) = components();
        let owner = ParticipantId(1);
        let member = ParticipantId(2);
        placement.place(owner, None, Program::Matrix, Tier(1)).await.unwrap();
        join_all(&placement, 1, 2..=40).await;
        recycler
            .recycle_if_complete(InstanceId::first(owner, Tier(1)))
            .await
            .unwrap()
            .unwrap();

        join_all(&placement, 2, 100..=138).await;
        let recycle = recycler
            .recycle_if_complete(InstanceId::first(member, Tier(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recycle.event.reentered_under, Some(owner));

        let reentry = recycle.reentry.unwrap();
        assert_eq!(reentry.structure_instance_no(), 2);
        assert_eq!(reentry.placement_parent, Some(owner));
        assert_eq!(reentry.position, Some(Position::LEFT));
        assert_eq!(reentry.cycle, 1);
        assert_eq!(reentry.referrer, Some(owner));
        assert_eq!(reentry.funded_by, Funding::Recycle);
    }

    #[tokio::test]
    async fn no_second_seat_in_the_same_instance() {
        let (placement, recycler) = components();
        placement.place(ParticipantId(1), None, Program::Matrix, Tier(1)).await.unwrap();
        join_all(&placement, 1, 2..=2).await;
        join_all(&placement, 2, 100..=138).await;

        // P2 still sits in P1's open instance and P1 is the root.
        let recycle = recycler
            .recycle_if_complete(InstanceId::first(ParticipantId(2), Tier(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recycle.event.reentered_under, None);
        assert_eq!(recycle.reentry, None);
    }
}
