//! Identifiers for participants, records and structures.

use std::fmt;

use canopy_structure::{Phase, Program, Shape, Tier};
use serde::{Deserialize, Serialize};

/// A participant identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Store-assigned record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

/// One matrix instance: the owner's `number`-th structure at a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId {
    pub owner: ParticipantId,
    pub tier: Tier,
    pub number: u32,
}

impl InstanceId {
    /// First instance an owner opens at a tier.
    pub const fn first(owner: ParticipantId, tier: Tier) -> Self {
        Self {
            owner,
            tier,
            number: 1,
        }
    }

    /// The instance that replaces this one after a recycle.
    pub const fn successor(&self) -> Self {
        Self {
            owner: self.owner,
            tier: self.tier,
            number: self.number + 1,
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.tier, self.number)
    }
}

/// The tree a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "program", rename_all = "lowercase")]
pub enum StructureId {
    /// One shared binary tree per tier.
    Binary { tier: Tier },
    /// A bounded per-owner instance.
    Matrix { instance: InstanceId },
    /// One shared tree per tier and phase.
    Global { tier: Tier, phase: Phase },
}

impl StructureId {
    pub const fn program(&self) -> Program {
        match self {
            Self::Binary { .. } => Program::Binary,
            Self::Matrix { .. } => Program::Matrix,
            Self::Global { .. } => Program::Global,
        }
    }

    pub const fn tier(&self) -> Tier {
        match self {
            Self::Binary { tier } | Self::Global { tier, .. } => *tier,
            Self::Matrix { instance } => instance.tier,
        }
    }

    pub const fn phase(&self) -> Phase {
        match self {
            Self::Global { phase, .. } => *phase,
            _ => Phase::One,
        }
    }

    pub const fn shape(&self) -> Shape {
        Shape::of(self.program(), self.phase())
    }

    /// Matrix instance, if this is a matrix structure.
    pub const fn instance(&self) -> Option<InstanceId> {
        match self {
            Self::Matrix { instance } => Some(*instance),
            _ => None,
        }
    }

    /// Key under which the structure's root is claimed.
    ///
    /// Matrix instances share one root claim per tier: the participant that
    /// entered the tier without a referrer.
    pub const fn root_key(&self) -> RootKey {
        RootKey {
            program: self.program(),
            tier: self.tier(),
            phase: self.phase(),
        }
    }
}

impl fmt::Display for StructureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary { tier } => write!(f, "binary/{}", tier),
            Self::Matrix { instance } => write!(f, "matrix/{}", instance),
            Self::Global { tier, phase } => write!(f, "global/{}/{}", tier, phase),
        }
    }
}

/// The single "root of everything" claim per program, tier and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootKey {
    pub program: Program,
    pub tier: Tier,
    pub phase: Phase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_accessors() {
        let instance = InstanceId::first(ParticipantId(7), Tier(2));
        let matrix = StructureId::Matrix { instance };
        assert_eq!(matrix.program(), Program::Matrix);
        assert_eq!(matrix.tier(), Tier(2));
        assert_eq!(matrix.shape(), Shape::MATRIX);
        assert_eq!(matrix.instance(), Some(instance));

        let global = StructureId::Global {
            tier: Tier(1),
            phase: Phase::Two,
        };
        assert_eq!(global.shape(), Shape::GLOBAL_PHASE_TWO);
        assert_eq!(global.instance(), None);
    }

    #[test]
    fn matrix_instances_share_a_root_key() {
        let a = StructureId::Matrix {
            instance: InstanceId::first(ParticipantId(1), Tier(1)),
        };
        let b = StructureId::Matrix {
            instance: InstanceId::first(ParticipantId(2), Tier(1)).successor(),
        };
        assert_eq!(a.root_key(), b.root_key());
    }

    #[test]
    fn display_is_readable() {
        let instance = InstanceId::first(ParticipantId(3), Tier(1)).successor();
        assert_eq!(StructureId::Matrix { instance }.to_string(), "matrix/P3/T1#2");
    }
}
