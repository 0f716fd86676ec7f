//! Tree shapes: branching factor plus optional depth limit.
//!
//! The shape is the same for every node of a structure - capacity never
//! depends on how many participants a node referred.

use crate::{total_slots_through, Phase, Position, Program};

/// Branching factor and depth limit of a placement tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Shape {
    branching: u8,
    /// Deepest level (below the root) that may hold participants.
    max_depth: Option<u32>,
}

impl Shape {
    pub const BINARY: Self = Self::new(2, None);
    pub const MATRIX: Self = Self::new(3, Some(3));
    pub const GLOBAL_PHASE_ONE: Self = Self::new(4, None);
    pub const GLOBAL_PHASE_TWO: Self = Self::new(8, None);

    pub const fn new(branching: u8, max_depth: Option<u32>) -> Self {
        Self {
            branching,
            max_depth,
        }
    }

    /// Shape of the structure a program places into.
    pub const fn of(program: Program, phase: Phase) -> Self {
        match (program, phase) {
            (Program::Binary, _) => Self::BINARY,
            (Program::Matrix, _) => Self::MATRIX,
            (Program::Global, Phase::One) => Self::GLOBAL_PHASE_ONE,
            (Program::Global, Phase::Two) => Self::GLOBAL_PHASE_TWO,
        }
    }

    #[inline]
    pub const fn branching(&self) -> u8 {
        self.branching
    }

    #[inline]
    pub const fn max_depth(&self) -> Option<u32> {
        self.max_depth
    }

    /// Total participant slots below the root, if bounded.
    pub const fn capacity(&self) -> Option<u64> {
        match self.max_depth {
            Some(depth) => Some(total_slots_through(self.branching as u64, depth) - 1),
            None => None,
        }
    }

    /// Whether a node at `depth` may receive children.
    pub const fn accepts_children_at(&self, depth: u32) -> bool {
        match self.max_depth {
            Some(max) => depth < max,
            None => true,
        }
    }

    /// Positions under a node, in the order they are tried.
    pub fn positions(&self) -> impl Iterator<Item = Position> {
        (0..self.branching).map(Position)
    }

    /// Positions under a node that are not in `occupied`, in try order.
    pub fn open_positions(&self, occupied: &[Position]) -> Vec<Position> {
        self.positions().filter(|p| !occupied.contains(p)).collect()
    }
}
