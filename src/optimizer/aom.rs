//! Absolute ordering of window variables in the dense system.

use std::collections::BTreeMap;

/// Maps each frame timestamp to its `(offset, block_size)` in the dense
/// Hessian for one linearisation pass. Pose-only blocks are 6 wide, full
/// state blocks 15; poses always precede states. The same ordering must be
/// reused between the stored marginalisation prior and the live accumulator.
#[derive(Debug, Clone, Default)]
pub struct AbsOrderMap {
    pub abs_order_map: BTreeMap<i64, (usize, usize)>,
    pub items: usize,
    pub total_size: usize,
}

impl AbsOrderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a variable block of the given size.
    pub fn push_variable(&mut self, t_ns: i64, size: usize) {
        let prev = self.abs_order_map.insert(t_ns, (self.total_size, size));
        assert!(prev.is_none(), "duplicate variable {t_ns} in ordering");
        self.total_size += size;
        self.items += 1;
    }

    pub fn offset(&self, t_ns: i64) -> usize {
        self.abs_order_map[&t_ns].0
    }

    /// Assert that every key shared with `other` has the same layout.
    pub fn assert_consistent_with(&self, other: &AbsOrderMap) {
        for (t_ns, entry) in &self.abs_order_map {
            if let Some(other_entry) = other.abs_order_map.get(t_ns) {
                assert_eq!(
                    entry, other_entry,
                    "ordering mismatch for frame {t_ns}: {entry:?} vs {other_entry:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_accumulates_offsets() {
        let mut aom = AbsOrderMap::new();
        aom.push_variable(10, 6);
        aom.push_variable(20, 6);
        aom.push_variable(30, 15);

        assert_eq!(aom.abs_order_map[&10], (0, 6));
        assert_eq!(aom.abs_order_map[&20], (6, 6));
        assert_eq!(aom.abs_order_map[&30], (12, 15));
        assert_eq!(aom.total_size, 27);
        assert_eq!(aom.items, 3);
    }

    #[test]
    fn test_consistency_on_shared_keys() {
        let mut a = AbsOrderMap::new();
        a.push_variable(10, 6);
        a.push_variable(30, 15);

        let mut b = AbsOrderMap::new();
        b.push_variable(10, 6);
        b.push_variable(20, 6);

        // Shared key 10 matches; disjoint keys are ignored.
        a.assert_consistent_with(&b);
    }

    #[test]
    #[should_panic(expected = "ordering mismatch")]
    fn test_inconsistent_layout_panics() {
        let mut a = AbsOrderMap::new();
        a.push_variable(10, 6);
        a.push_variable(20, 15);

        let mut b = AbsOrderMap::new();
        b.push_variable(20, 15);

        a.assert_consistent_with(&b);
    }
}
