//! Global phase transitions.
//!
//! A node in a tier's phase-one tree completes with four children and its
//! owner moves into the same tier's phase-two tree. A phase-two node
//! completes with eight children and its owner is promoted into the next
//! tier's phase-one tree. Completion at the top tier is terminal.
//!
//! Both moves are keyed by (participant, tier, phase, cycle), so a node
//! that completes twice, or two racing settlements of the same completion,
//! produce a single record.

use canopy_store::{Funding, ParticipantId, PlacementRecord, SlotStore, StructureId};
use canopy_structure::{Phase, Program};
use tracing::{debug, info};

use crate::error::{Context, Error, Result};
use crate::events::{Event, PhaseEvent, PromotionEvent};
use crate::placement::{PlacementEngine, PlacementRequest};
use crate::shared::Shared;

/// A committed phase move and the record it created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub event: Event,
    pub record: PlacementRecord,
}

pub struct GlobalPhases<S> {
    shared: Shared<S>,
    placement: PlacementEngine<S>,
}

impl<S> Clone for GlobalPhases<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            placement: self.placement.clone(),
        }
    }
}

impl<S: SlotStore> GlobalPhases<S> {
    pub(crate) fn new(shared: Shared<S>, placement: PlacementEngine<S>) -> Self {
        Self { shared, placement }
    }

    /// Move `node` on if it has filled its slots in `structure`.
    pub async fn advance_if_complete(
        &self,
        node: ParticipantId,
        structure: StructureId,
    ) -> Result<Option<Advance>> {
        let StructureId::Global { tier, phase } = structure else {
            return Ok(None);
        };
        let context = Context::new(node, Program::Global, tier);
        let store = &*self.shared.store;

        let children = self
            .shared
            .call(context, || store.children(structure, node))
            .await?;
        let branching = usize::from(structure.shape().branching());
        if children.len() < branching {
            return Ok(None);
        }
        let records = self
            .shared
            .call(context, || store.records_for(node, Program::Global, tier))
            .await?;
        let Some(own) = records.iter().find(|r| r.structure == structure) else {
            return Ok(None);
        };
        let cycle = own.cycle;

        match phase {
            Phase::One => {
                let next = StructureId::Global {
                    tier,
                    phase: Phase::Two,
                };
                if records.iter().any(|r| r.structure == next && r.cycle == cycle) {
                    return Ok(None);
                }
                let request = PlacementRequest::synthetic(
                    node,
                    own.referrer,
                    Program::Global,
                    tier,
                    Funding::PhaseCompletion,
                )
                .with_phase(Phase::Two)
                .with_cycle(cycle);
                let Some(record) = self.commit_once(request).await? else {
                    return Ok(None);
                };
                info!("{}: phase one complete, moved to {}", context, record.structure);
                Ok(Some(Advance {
                    event: Event::PhaseAdvanced(PhaseEvent {
                        owner: node,
                        tier,
                        from: Phase::One,
                        to: Phase::Two,
                        cycle,
                    }),
                    record,
                }))
            }
            Phase::Two => {
                let target = tier.next();
                if !self.shared.config.has_tier(Program::Global, target) {
                    info!("{}: phase two complete at the top tier", context);
                    return Ok(None);
                }
                if self.shared.holds(context, node, Program::Global, target).await? {
                    debug!("{}: already holds {}", context, target);
                    return Ok(None);
                }
                let request = PlacementRequest::synthetic(
                    node,
                    own.referrer,
                    Program::Global,
                    target,
                    Funding::PhaseCompletion,
                );
                let Some(record) = self.commit_once(request).await? else {
                    return Ok(None);
                };
                info!("{}: phase two complete, promoted to {}", context, target);
                Ok(Some(Advance {
                    event: Event::Promoted(PromotionEvent {
                        owner: node,
                        program: Program::Global,
                        from_tier: tier,
                        to_tier: target,
                        funded_by: Funding::PhaseCompletion,
                        consumed: None,
                        carried: None,
                    }),
                    record,
                }))
            }
        }
    }

    /// Commit a phase move; a racing duplicate counts as already done.
    async fn commit_once(&self, request: PlacementRequest) -> Result<Option<PlacementRecord>> {
        match self.placement.commit(request).await {
            Ok(record) => Ok(Some(record)),
            Err(Error::AlreadyPlaced { context, .. }) => {
                debug!("{}: phase move already committed", context);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ProgramConfig};
    use crate::sweepover::SweepoverResolver;
    use canopy_store::{Currency, MemoryStore};
    use canopy_structure::Tier;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn components(config: EngineConfig) -> (PlacementEngine<MemoryStore>, GlobalPhases<MemoryStore>) {
        let shared = Shared::new(Arc::new(MemoryStore::new(Currency::USD)), config);
        let placement = PlacementEngine::new(shared.clone(), SweepoverResolver::new(shared.clone()));
        let phases = GlobalPhases::new(shared, placement.clone());
        (placement, phases)
    }

    fn p(id: u64) -> ParticipantId {
        ParticipantId(id)
    }

    const PHASE_ONE: StructureId = StructureId::Global {
        tier: Tier(1),
        phase: Phase::One,
    };
    const PHASE_TWO: StructureId = StructureId::Global {
        tier: Tier(1),
        phase: Phase::Two,
    };

    async fn join(placement: &PlacementEngine<MemoryStore>, ids: std::ops::RangeInclusive<u64>) {
        for id in ids {
            placement.place(p(id), None, Program::Global, Tier(1)).await.unwrap();
        }
    }

    /// Serial entries into tier 1 phase two; the first claims the root.
    async fn join_phase_two(placement: &PlacementEngine<MemoryStore>, ids: std::ops::RangeInclusive<u64>) {
        for id in ids {
            let request = PlacementRequest::synthetic(
                p(id),
                None,
                Program::Global,
                Tier(1),
                Funding::PhaseCompletion,
            )
            .with_phase(Phase::Two);
            placement.commit(request).await.unwrap();
        }
    }

    #[tokio::test]
    async fn fourth_child_moves_the_node_to_phase_two() {
        let (placement, phases) = components(EngineConfig::default());
        join(&placement, 1..=4).await;
        assert!(phases.advance_if_complete(p(1), PHASE_ONE).await.unwrap().is_none());

        join(&placement, 5..=5).await;
        let advance = phases.advance_if_complete(p(1), PHASE_ONE).await.unwrap().unwrap();
        assert_eq!(
            advance.event,
            Event::PhaseAdvanced(PhaseEvent {
                owner: p(1),
                tier: Tier(1),
                from: Phase::One,
                to: Phase::Two,
                cycle: 0,
            })
        );
        assert_eq!(advance.record.structure, PHASE_TWO);
        assert_eq!(advance.record.placement_parent, None);
        assert_eq!(advance.record.funded_by, Funding::PhaseCompletion);

        // Settling the same completion again does nothing.
        assert!(phases.advance_if_complete(p(1), PHASE_ONE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sixth_joiner_goes_below_the_full_node() {
        let (placement, _) = components(EngineConfig::default());
        join(&placement, 1..=5).await;
        let sixth = placement.place(p(6), None, Program::Global, Tier(1)).await.unwrap();
        assert_eq!(sixth.placement_parent, Some(p(2)));
        assert_eq!(sixth.depth, 2);
    }

    #[tokio::test]
    async fn eighth_phase_two_child_promotes_to_the_next_tier() {
        let (placement, phases) = components(EngineConfig::default());
        join_phase_two(&placement, 1..=8).await;
        assert!(phases.advance_if_complete(p(1), PHASE_TWO).await.unwrap().is_none());

        join_phase_two(&placement, 9..=9).await;
        let advance = phases.advance_if_complete(p(1), PHASE_TWO).await.unwrap().unwrap();
        assert!(matches!(
            advance.event,
            Event::Promoted(PromotionEvent {
                from_tier: Tier(1),
                to_tier: Tier(2),
                funded_by: Funding::PhaseCompletion,
                ..
            })
        ));
        assert_eq!(
            advance.record.structure,
            StructureId::Global {
                tier: Tier(2),
                phase: Phase::One
            }
        );
        assert!(phases.advance_if_complete(p(1), PHASE_TWO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_at_the_top_tier_is_terminal() {
        let single = ProgramConfig {
            tier_costs: vec![dec!(5)],
            reserve_fractions: Vec::new(),
        };
        let (placement, phases) =
            components(EngineConfig::default().with_program(Program::Global, single));
        join_phase_two(&placement, 1..=9).await;
        assert!(phases.advance_if_complete(p(1), PHASE_TWO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_structures_are_ignored() {
        let (placement, phases) = components(EngineConfig::default());
        placement.place(p(1), None, Program::Binary, Tier(1)).await.unwrap();
        let binary = StructureId::Binary { tier: Tier(1) };
        assert!(phases.advance_if_complete(p(1), binary).await.unwrap().is_none());
    }
}
