//! Canopy Placement Geometry
//!
//! Fixed-branching tree geometry shared by the three incentive programs.
//!
//! # Structures
//!
//! Every program places participants into trees whose branching factor is
//! fixed, no matter how many people a participant refers:
//! - **Binary**: 2 slots per node (left, right), unbounded depth
//! - **Matrix**: 3 slots per node (left, center, right), 3 levels deep
//! - **Global**: 4 slots per node in phase one, 8 in phase two
//!
//! # Level Order
//!
//! Slots are enumerated level by level, left to right. Slot 0 is the owner
//! (or root) and the children of slot `n` in a `k`-ary tree are
//! `k·n + 1 ..= k·n + k`. Filling the first open slot in this order keeps the
//! tree complete, so every parent exists before its children are needed.

mod level;
mod program;
mod shape;

pub use level::{slots_in_level, total_slots_through, LevelOrder, SlotIndex};
pub use program::{ParseProgramError, Phase, Position, Program, SlotRole, Tier};
pub use shape::Shape;

/// Matrix branching factor.
pub const MATRIX_BRANCHING: u64 = 3;

/// Levels below the owner in a matrix instance.
pub const MATRIX_LEVELS: u32 = 3;

/// Occupied slots that complete a matrix instance (3 + 9 + 27).
pub const MATRIX_CAPACITY: u64 = 39;

/// Children that complete a global phase-one node.
pub const GLOBAL_PHASE_ONE_CAPACITY: u64 = 4;

/// Children that complete a global phase-two node.
pub const GLOBAL_PHASE_TWO_CAPACITY: u64 = 8;

// Compile-time assertion of the matrix capacity
const _: () = assert!(total_slots_through(MATRIX_BRANCHING, MATRIX_LEVELS) - 1 == MATRIX_CAPACITY);
