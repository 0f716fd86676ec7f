//! Events emitted by the engine for downstream consumers.
//!
//! Events describe committed state changes only. They serialize with a
//! `type` tag so the scenario replayer can print them as JSON lines.

use canopy_store::{
    Funding, InstanceId, Money, ParticipantId, PlacementRecord, ReserveAccount, StructureId,
};
use canopy_structure::{Phase, Position, Program, SlotRole, Tier};
use serde::{Deserialize, Serialize};

/// Where a participant was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementResult {
    pub participant: ParticipantId,
    pub program: Program,
    pub tier: Tier,
    pub structure: StructureId,
    pub cycle: u32,
    pub referrer: Option<ParticipantId>,
    pub placement_parent: Option<ParticipantId>,
    pub position: Option<Position>,
    pub depth: u32,
    pub is_spillover: bool,
    /// Matrix instance number; 0 outside the matrix.
    pub structure_instance_no: u32,
    pub slot_role: SlotRole,
    pub funded_by: Funding,
}

impl From<&PlacementRecord> for PlacementResult {
    fn from(record: &PlacementRecord) -> Self {
        Self {
            participant: record.participant,
            program: record.program,
            tier: record.tier,
            structure: record.structure,
            cycle: record.cycle,
            referrer: record.referrer,
            placement_parent: record.placement_parent,
            position: record.position,
            depth: record.depth,
            is_spillover: record.is_spillover,
            structure_instance_no: record.structure_instance_no(),
            slot_role: record.slot_role,
            funded_by: record.funded_by,
        }
    }
}

/// A participant moved to the next tier without paying a fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionEvent {
    pub owner: ParticipantId,
    pub program: Program,
    pub from_tier: Tier,
    pub to_tier: Tier,
    pub funded_by: Funding,
    /// Reserve consumed, for reserve-funded promotions.
    pub consumed: Option<Money>,
    /// Surplus carried into the account above, if any.
    pub carried: Option<Money>,
}

/// A completed matrix instance was archived and its owner re-entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecycleEvent {
    pub owner: ParticipantId,
    pub program: Program,
    pub tier: Tier,
    pub old_instance_id: InstanceId,
    pub new_instance_id: InstanceId,
    /// The upline hosting the re-entry; `None` for the tier's root.
    pub reentered_under: Option<ParticipantId>,
}

/// A global node completed its phase and moved on within the tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub owner: ParticipantId,
    pub tier: Tier,
    pub from: Phase,
    pub to: Phase,
    pub cycle: u32,
}

/// Engine event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Placed(PlacementResult),
    ReserveCredited {
        account: ReserveAccount,
        amount: Money,
        balance: Money,
        from: ParticipantId,
    },
    /// A fee share that could not be reserved, for the wallet service.
    Payout {
        recipient: ParticipantId,
        program: Program,
        tier: Tier,
        amount: Money,
        from: ParticipantId,
    },
    Promoted(PromotionEvent),
    Recycled(RecycleEvent),
    PhaseAdvanced(PhaseEvent),
}

impl Event {
    pub fn placed(record: &PlacementRecord) -> Self {
        Self::Placed(PlacementResult::from(record))
    }

    /// Short name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Placed(_) => "placed",
            Self::ReserveCredited { .. } => "reserve_credited",
            Self::Payout { .. } => "payout",
            Self::Promoted(_) => "promoted",
            Self::Recycled(_) => "recycled",
            Self::PhaseAdvanced(_) => "phase_advanced",
        }
    }
}
