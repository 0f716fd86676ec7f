//! Programs, tiers, phases and in-node positions.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::{SlotIndex, MATRIX_BRANCHING};

/// One of the three concurrent incentive programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Program {
    /// Two-slot tree, one shared tree per tier.
    Binary,
    /// Three-slot, three-level instances owned per participant.
    Matrix,
    /// Serially filled tree per tier, in two phases.
    Global,
}

impl Program {
    /// All programs in a fixed order.
    pub const ALL: [Self; 3] = [Self::Binary, Self::Matrix, Self::Global];

    /// Whether placement depends on the referrer's own activation.
    pub const fn requires_referrer(&self) -> bool {
        matches!(self, Self::Binary | Self::Matrix)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Matrix => f.write_str("matrix"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Unrecognised program name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown program: {0}")]
pub struct ParseProgramError(pub String);

impl FromStr for Program {
    type Err = ParseProgramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "matrix" => Ok(Self::Matrix),
            "global" => Ok(Self::Global),
            other => Err(ParseProgramError(other.to_string())),
        }
    }
}

/// A purchasable activation level. Tiers start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Tier(pub u8);

impl Tier {
    /// Entry tier.
    pub const FIRST: Self = Self(1);

    #[inline]
    pub const fn new(tier: u8) -> Self {
        Self(tier)
    }

    #[inline]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// The tier above this one.
    #[inline]
    pub const fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The tier below this one, or `None` for the entry tier.
    pub const fn previous(&self) -> Option<Self> {
        if self.0 <= 1 {
            None
        } else {
            Some(Self(self.0 - 1))
        }
    }

    /// Zero-based index into per-tier configuration tables.
    #[inline]
    pub const fn index(&self) -> usize {
        self.0.saturating_sub(1) as usize
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Global program phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Phase {
    /// 4 children per node.
    One,
    /// 8 children per node.
    Two,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One => f.write_str("phase-1"),
            Self::Two => f.write_str("phase-2"),
        }
    }
}

/// Slot index under a parent node, tried in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Position(pub u8);

impl Position {
    pub const LEFT: Self = Self(0);
    /// Matrix center slot.
    pub const CENTER: Self = Self(1);
    /// Binary right slot.
    pub const BINARY_RIGHT: Self = Self(1);
    /// Matrix right slot.
    pub const MATRIX_RIGHT: Self = Self(2);

    #[inline]
    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Human-readable name of this position for a given branching factor.
    pub fn label(&self, branching: u8) -> String {
        match (branching, self.0) {
            (2, 0) | (3, 0) => "left".to_string(),
            (2, 1) | (3, 2) => "right".to_string(),
            (3, 1) => "center".to_string(),
            (_, n) => format!("slot-{}", n),
        }
    }
}

/// Role of an occupied matrix slot in value flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SlotRole {
    /// Level-1 center slot, flagged for the owner's upline.
    UplineReserve,
    /// Level-2 center child of a level-1 node; funds the owner's next tier.
    Middle,
    /// Anything else, including every non-matrix slot.
    #[default]
    Plain,
}

impl SlotRole {
    /// Role of a matrix slot at `depth` (1-based below the owner) and `position`.
    pub const fn matrix(depth: u32, position: Position) -> Self {
        match (depth, position.0) {
            (1, 1) => Self::UplineReserve,
            (2, 1) => Self::Middle,
            _ => Self::Plain,
        }
    }

    /// Role of a level-order slot of a matrix instance; slot 0 is the owner.
    pub fn at_matrix_slot(slot: SlotIndex) -> Self {
        match slot.position(MATRIX_BRANCHING) {
            Some(position) => Self::matrix(slot.level(MATRIX_BRANCHING), position),
            None => Self::Plain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_round_trips_through_display() {
        for program in Program::ALL {
            assert_eq!(program.to_string().parse::<Program>(), Ok(program));
        }
        assert!("ternary".parse::<Program>().is_err());
    }

    #[test]
    fn tier_navigation() {
        assert_eq!(Tier::FIRST.previous(), None);
        assert_eq!(Tier(3).previous(), Some(Tier(2)));
        assert_eq!(Tier(3).next(), Tier(4));
        assert_eq!(Tier(1).index(), 0);
    }

    #[test]
    fn matrix_roles() {
        assert_eq!(SlotRole::matrix(1, Position::CENTER), SlotRole::UplineReserve);
        assert_eq!(SlotRole::matrix(1, Position::LEFT), SlotRole::Plain);
        assert_eq!(SlotRole::matrix(2, Position::CENTER), SlotRole::Middle);
        assert_eq!(SlotRole::matrix(2, Position::MATRIX_RIGHT), SlotRole::Plain);
        assert_eq!(SlotRole::matrix(3, Position::CENTER), SlotRole::Plain);
    }

    #[test]
    fn matrix_roles_by_slot_index() {
        assert_eq!(SlotRole::at_matrix_slot(SlotIndex::ROOT), SlotRole::Plain);
        assert_eq!(SlotRole::at_matrix_slot(SlotIndex(2)), SlotRole::UplineReserve);
        let middles: Vec<u64> = (0..40)
            .filter(|i| SlotRole::at_matrix_slot(SlotIndex(*i)) == SlotRole::Middle)
            .collect();
        assert_eq!(middles, vec![5, 8, 11]);
        assert_eq!(SlotRole::at_matrix_slot(SlotIndex(14)), SlotRole::Plain);
    }

    #[test]
    fn position_labels() {
        assert_eq!(Position::LEFT.label(2), "left");
        assert_eq!(Position::BINARY_RIGHT.label(2), "right");
        assert_eq!(Position::CENTER.label(3), "center");
        assert_eq!(Position(5).label(8), "slot-5");
    }
}
