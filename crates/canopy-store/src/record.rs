//! Placement records.
//!
//! A record answers two different questions about a participant:
//! - who invited them (`referrer`, immutable once set)
//! - where they physically sit (`placement_parent`, `position`, `depth`)
//!
//! The two differ whenever the referrer's own slots were already full.

use canopy_structure::{Phase, Position, Program, SlotRole, Tier};
use serde::{Deserialize, Serialize};

use crate::ids::{ParticipantId, RecordId, StructureId};

/// What paid for an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Funding {
    /// Paid by the participant.
    Fee,
    /// Paid from the participant's accumulated reserve.
    Reserve,
    /// Matrix re-entry after the owner's instance completed; no fee.
    Recycle,
    /// Global advance after a phase-two node completed; no fee.
    PhaseCompletion,
}

impl Funding {
    /// Whether the activation carries a fee that can flow into reserves.
    pub const fn carries_fee(&self) -> bool {
        matches!(self, Self::Fee | Self::Reserve)
    }
}

/// Uniqueness key of a record.
///
/// Exactly one record per (participant, program, tier) except where a
/// phase or re-entry cycle distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub participant: ParticipantId,
    pub program: Program,
    pub tier: Tier,
    pub phase: Phase,
    pub cycle: u32,
}

/// A record before the store has assigned its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementDraft {
    pub participant: ParticipantId,
    pub structure: StructureId,
    /// Re-entry counter; 0 for the first entry.
    pub cycle: u32,
    pub referrer: Option<ParticipantId>,
    pub placement_parent: Option<ParticipantId>,
    pub position: Option<Position>,
    pub depth: u32,
    pub is_spillover: bool,
    pub slot_role: SlotRole,
    pub funded_by: Funding,
}

impl PlacementDraft {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            participant: self.participant,
            program: self.structure.program(),
            tier: self.structure.tier(),
            phase: self.structure.phase(),
            cycle: self.cycle,
        }
    }

    /// Whether this draft claims the structure's root.
    pub fn is_root(&self) -> bool {
        self.placement_parent.is_none()
    }
}

/// A stored placement record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub id: RecordId,
    /// Store-wide creation order.
    pub sequence: u64,
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
    pub slot_role: SlotRole,
    pub funded_by: Funding,
}

impl PlacementRecord {
    pub fn from_draft(id: RecordId, sequence: u64, draft: PlacementDraft) -> Self {
        Self {
            id,
            sequence,
            participant: draft.participant,
            program: draft.structure.program(),
            tier: draft.structure.tier(),
            structure: draft.structure,
            cycle: draft.cycle,
            referrer: draft.referrer,
            placement_parent: draft.placement_parent,
            position: draft.position,
            depth: draft.depth,
            is_spillover: draft.is_spillover,
            slot_role: draft.slot_role,
            funded_by: draft.funded_by,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            participant: self.participant,
            program: self.program,
            tier: self.tier,
            phase: self.structure.phase(),
            cycle: self.cycle,
        }
    }

    /// Matrix instance number the record sits in; 0 outside the matrix.
    pub fn structure_instance_no(&self) -> u32 {
        self.structure.instance().map(|i| i.number).unwrap_or(0)
    }

    pub fn is_upline_reserve(&self) -> bool {
        self.slot_role == SlotRole::UplineReserve
    }
}
