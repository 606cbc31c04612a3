//! Morton keys: integer grid coordinates at a refinement level, totally
//! ordered along the space-filling curve.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Coordinate bits interleaved into the curve index. Bounds both the base
/// grid extent and the maximum refinement depth: `extent · 2^level < 2^21`
/// per axis.
pub(crate) const COORD_BITS: u32 = 21;

/// A cell address on the space-filling curve: an integer coordinate within
/// the level-`level` grid. Level 0 is the base grid; each refinement doubles
/// the coordinate space.
///
/// Keys are unique within a level. Keys at different levels compare after
/// normalizing to the finer level; ties (an ancestor against its first
/// descendant) order the coarser key first, which makes sorted key sequences
/// depth-first traversals.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Key {
    coord: [i64; 3],
    level: u8,
}

impl Key {
    pub fn new(coord: [i64; 3], level: u8) -> Self {
        Self { coord, level }
    }

    /// A key on the base grid.
    pub fn base(coord: [i64; 3]) -> Self {
        Self { coord, level: 0 }
    }

    pub fn coordinate(&self) -> [i64; 3] {
        self.coord
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// The `i`-th child key (`i = x + 2y + 4z` within the parent), one level
    /// finer.
    pub fn child(&self, i: usize) -> Key {
        debug_assert!(i < 8);
        Key {
            coord: [
                2 * self.coord[0] + (i & 1) as i64,
                2 * self.coord[1] + ((i >> 1) & 1) as i64,
                2 * self.coord[2] + ((i >> 2) & 1) as i64,
            ],
            level: self.level + 1,
        }
    }

    /// The parent key, or `None` on the base grid.
    pub fn parent(&self) -> Option<Key> {
        if self.level == 0 {
            return None;
        }
        Some(Key {
            coord: self.coord.map(|c| c.div_euclid(2)),
            level: self.level - 1,
        })
    }

    /// Which child of its parent this key is (`x + 2y + 4z` of the low
    /// coordinate bits).
    pub fn child_index(&self) -> usize {
        ((self.coord[0] & 1) + 2 * (self.coord[1] & 1) + 4 * (self.coord[2] & 1)) as usize
    }

    /// The same-level key at `coord + offset`. Undefined outside the domain
    /// bounds at level 0; callers bounds-check before use.
    pub fn neighbor(&self, offset: [i64; 3]) -> Key {
        Key {
            coord: [
                self.coord[0] + offset[0],
                self.coord[1] + offset[1],
                self.coord[2] + offset[2],
            ],
            level: self.level,
        }
    }

    /// The ancestor of this key on the base grid.
    pub fn base_ancestor(&self) -> Key {
        Key {
            coord: self.coord.map(|c| c >> self.level),
            level: 0,
        }
    }

    /// Bit-interleaved curve index at this key's own level.
    fn zindex(&self) -> u128 {
        let mut z = 0u128;
        for bit in 0..COORD_BITS {
            for (axis, &c) in self.coord.iter().enumerate() {
                z |= (((c as u128) >> bit) & 1) << (3 * bit + axis as u32);
            }
        }
        z
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        let level = self.level.max(other.level);
        let a = self.zindex() << (3 * (level - self.level) as u32);
        let b = other.zindex() << (3 * (level - other.level) as u32);
        a.cmp(&b).then_with(|| self.level.cmp(&other.level))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_parent_round_trip() {
        let key = Key::new([3, 5, 1], 2);
        for i in 0..8 {
            let child = key.child(i);
            assert_eq!(child.level(), 3);
            assert_eq!(child.parent(), Some(key));
            assert_eq!(child.child_index(), i);
        }
    }

    #[test]
    fn child_keys_are_deterministic() {
        let a = Key::new([7, 0, 2], 1);
        let b = Key::new([7, 0, 2], 1);
        for i in 0..8 {
            assert_eq!(a.child(i), b.child(i));
        }
    }

    #[test]
    fn neighbor_arithmetic() {
        let key = Key::base([4, 4, 0]);
        assert_eq!(key.neighbor([-1, 0, 0]).coordinate(), [3, 4, 0]);
        assert_eq!(key.neighbor([0, 1, 0]).coordinate(), [4, 5, 0]);
        assert_eq!(key.neighbor([0, 0, -1]).coordinate(), [4, 4, -1]);
    }

    #[test]
    fn order_preserves_curve_locality() {
        // Within one level, the z-curve visits the 2x2 block before moving
        // on in x.
        let order: Vec<[i64; 3]> = {
            let mut keys: Vec<Key> = (0..4)
                .flat_map(|y| (0..4).map(move |x| Key::base([x, y, 0])))
                .collect();
            keys.sort();
            keys.iter().map(|k| k.coordinate()).collect()
        };
        assert_eq!(
            &order[..4],
            &[[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]
        );
    }

    #[test]
    fn cross_level_order_is_depth_first() {
        let parent = Key::base([1, 0, 0]);
        let mut keys = vec![
            Key::base([2, 0, 0]),
            parent.child(1),
            parent,
            parent.child(0),
            Key::base([0, 0, 0]),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::base([0, 0, 0]),
                parent,
                parent.child(0),
                parent.child(1),
                Key::base([2, 0, 0]),
            ]
        );
    }

    #[test]
    fn base_ancestor() {
        let key = Key::base([3, 1, 0]).child(1).child(2);
        assert_eq!(key.base_ancestor(), Key::base([3, 1, 0]));
    }
}
