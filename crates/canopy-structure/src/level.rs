//! Level-order slot enumeration for k-ary trees.
//!
//! A tree of branching factor `k` is enumerated breadth first:
//!
//! - Level 0: the root (1 slot)
//! - Level n > 0: `k^n` slots
//!
//! Slot indices are stable for a given `k`, so the index alone tells which
//! level a slot sits on, which slot is its parent and which position it
//! occupies under that parent.

use crate::Position;

/// A level-order slot index. Slot 0 is the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlotIndex(pub u64);

impl SlotIndex {
    /// Root slot.
    pub const ROOT: Self = Self(0);

    /// Create from raw index.
    #[inline]
    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    /// Get the raw index value.
    #[inline]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Determine which level this index falls in for branching `k`.
    ///
    /// For k = 3:
    /// Level 0: index 0
    /// Level 1: indices 1-3
    /// Level 2: indices 4-12
    /// Level 3: indices 13-39
    pub fn level(&self, branching: u64) -> u32 {
        if branching == 0 {
            return 0;
        }
        let mut level = 0;
        loop {
            let through = total_slots_through(branching, level);
            if through > self.0 || through == u64::MAX {
                return level;
            }
            level += 1;
        }
    }

    /// Parent slot, or `None` for the root.
    pub fn parent(&self, branching: u64) -> Option<Self> {
        if self.0 == 0 || branching == 0 {
            return None;
        }
        Some(Self((self.0 - 1) / branching))
    }

    /// Position under the parent, or `None` for the root.
    pub fn position(&self, branching: u64) -> Option<Position> {
        if self.0 == 0 || branching == 0 {
            return None;
        }
        Some(Position(((self.0 - 1) % branching) as u8))
    }

    /// Child slot at `position`. Saturates instead of wrapping.
    pub fn child(&self, branching: u64, position: Position) -> Self {
        Self(
            self.0
                .saturating_mul(branching)
                .saturating_add(1 + position.0 as u64),
        )
    }
}

impl From<u64> for SlotIndex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SlotIndex> for u64 {
    fn from(value: SlotIndex) -> Self {
        value.0
    }
}

/// Number of slots on `level` of a `branching`-ary tree.
///
/// - Level 0: 1 slot (root)
/// - Level n > 0: k^n slots
#[inline]
pub const fn slots_in_level(branching: u64, level: u32) -> u64 {
    branching.saturating_pow(level)
}

/// Total slots through `level` (inclusive, root included).
///
/// Formula: 1 + k + k² + … + k^n
#[inline]
pub const fn total_slots_through(branching: u64, level: u32) -> u64 {
    let mut total = 0u64;
    let mut current = 0;
    while current <= level {
        total = total.saturating_add(slots_in_level(branching, current));
        current += 1;
    }
    total
}

/// Iterator over slot indices in level order.
pub struct LevelOrder {
    current: u64,
    end: u64,
}

impl LevelOrder {
    /// Slots of levels `start_level..=end_level` of a `branching`-ary tree.
    pub fn levels(branching: u64, start_level: u32, end_level: u32) -> Self {
        let current = if start_level == 0 {
            0
        } else {
            total_slots_through(branching, start_level - 1)
        };
        Self {
            current,
            end: total_slots_through(branching, end_level),
        }
    }
}

impl Iterator for LevelOrder {
    type Item = SlotIndex;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }
        let slot = SlotIndex(self.current);
        self.current += 1;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.current) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn slots_in_level_formula() {
        assert_eq!(slots_in_level(2, 0), 1);
        assert_eq!(slots_in_level(2, 1), 2);
        assert_eq!(slots_in_level(2, 5), 32);
        assert_eq!(slots_in_level(3, 2), 9);
        assert_eq!(slots_in_level(3, 3), 27);
        assert_eq!(slots_in_level(8, 2), 64);
    }

    #[test]
    fn total_slots_formula() {
        assert_eq!(total_slots_through(2, 0), 1);
        assert_eq!(total_slots_through(2, 1), 3);
        assert_eq!(total_slots_through(2, 2), 7);
        assert_eq!(total_slots_through(3, 3), 40); // owner + 39
        assert_eq!(total_slots_through(4, 2), 21);
    }

    #[test]
    fn matrix_levels() {
        assert_eq!(SlotIndex(0).level(3), 0);
        for i in 1..=3 {
            assert_eq!(SlotIndex(i).level(3), 1, "index {} should be level 1", i);
        }
        for i in 4..=12 {
            assert_eq!(SlotIndex(i).level(3), 2, "index {} should be level 2", i);
        }
        for i in 13..=39 {
            assert_eq!(SlotIndex(i).level(3), 3, "index {} should be level 3", i);
        }
    }

    #[test]
    fn matrix_middles_are_center_children_of_level_one() {
        let middles: Vec<u64> = (1..=3)
            .map(|i| SlotIndex(i).child(3, Position::CENTER).value())
            .collect();
        assert_eq!(middles, vec![5, 8, 11]);
        for m in middles {
            assert_eq!(SlotIndex(m).level(3), 2);
            assert_eq!(SlotIndex(m).position(3), Some(Position::CENTER));
        }
    }

    #[test]
    fn root_has_no_parent() {
        assert_eq!(SlotIndex::ROOT.parent(2), None);
        assert_eq!(SlotIndex::ROOT.position(2), None);
    }

    #[test]
    fn level_order_iterator_counts() {
        assert_eq!(LevelOrder::levels(3, 1, 3).count(), 39);
        assert_eq!(LevelOrder::levels(2, 0, 0).count(), 1);
        assert_eq!(LevelOrder::levels(4, 1, 1).count(), 4);
    }

    proptest! {
        #[test]
        fn parent_child_inverse(index in 1u64..100_000, branching in 2u64..9) {
            let slot = SlotIndex(index);
            let parent = slot.parent(branching).unwrap();
            let position = slot.position(branching).unwrap();
            prop_assert_eq!(parent.child(branching, position), slot);
            prop_assert_eq!(parent.level(branching) + 1, slot.level(branching));
        }
    }
}
