//! Domain decomposition: the base grid flattened along the Morton curve and
//! split into contiguous near-equal ranges, one per rank.
//!
//! The decomposition is consulted only while building the base-level
//! topology; refined cells inherit the rank of their base ancestor.

use crate::error::MeshError;
use crate::key::Key;

#[derive(Clone, Debug)]
pub struct Decomposition {
    dims: [i64; 3],
    /// Every base-grid key, sorted along the curve.
    keys: Vec<Key>,
    /// Rank `r` owns `keys[offsets[r]..offsets[r + 1]]`.
    offsets: Vec<usize>,
}

impl Decomposition {
    pub fn new(dims: [i64; 3], ranks: usize) -> Result<Self, MeshError> {
        if dims.iter().any(|&d| d < 1) {
            return Err(MeshError::Config(format!(
                "grid dimensions must be positive, got {dims:?}"
            )));
        }
        let count = (dims[0] * dims[1] * dims[2]) as usize;
        if ranks == 0 || ranks > count {
            return Err(MeshError::Config(format!(
                "cannot split {count} base cells over {ranks} ranks"
            )));
        }

        let mut keys = Vec::with_capacity(count);
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    keys.push(Key::base([x, y, z]));
                }
            }
        }
        keys.sort_unstable();

        let offsets = (0..=ranks).map(|r| r * count / ranks).collect();

        Ok(Self {
            dims,
            keys,
            offsets,
        })
    }

    pub fn dims(&self) -> [i64; 3] {
        self.dims
    }

    pub fn ranks(&self) -> usize {
        self.offsets.len() - 1
    }

    /// The sorted base-level keys owned by `rank`.
    pub fn keys_of(&self, rank: usize) -> &[Key] {
        &self.keys[self.offsets[rank]..self.offsets[rank + 1]]
    }

    /// Whether a base-grid coordinate lies inside the domain.
    pub fn is_inside(&self, coord: [i64; 3]) -> bool {
        coord
            .iter()
            .zip(self.dims.iter())
            .all(|(&c, &d)| c >= 0 && c < d)
    }

    /// The rank owning a key (of any level, via its base ancestor).
    pub fn rank_of(&self, key: &Key) -> usize {
        let base = key.base_ancestor();
        debug_assert!(self.is_inside(base.coordinate()));
        let position = match self.keys.binary_search(&base) {
            Ok(p) => p,
            Err(p) => p.min(self.keys.len() - 1),
        };
        self.offsets.partition_point(|&o| o <= position) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_grid_exactly() {
        let decomp = Decomposition::new([4, 4, 1], 3).unwrap();
        let total: usize = (0..3).map(|r| decomp.keys_of(r).len()).sum();
        assert_eq!(total, 16);
        // Ranges are contiguous on the curve.
        for r in 0..2 {
            let last = *decomp.keys_of(r).last().unwrap();
            let first = *decomp.keys_of(r + 1).first().unwrap();
            assert!(last < first);
        }
    }

    #[test]
    fn rank_of_matches_ranges() {
        let decomp = Decomposition::new([8, 8, 1], 4).unwrap();
        for rank in 0..4 {
            for key in decomp.keys_of(rank) {
                assert_eq!(decomp.rank_of(key), rank);
            }
        }
    }

    #[test]
    fn refined_keys_inherit_base_rank() {
        let decomp = Decomposition::new([4, 1, 1], 2).unwrap();
        let base = Key::base([3, 0, 0]);
        let rank = decomp.rank_of(&base);
        assert_eq!(decomp.rank_of(&base.child(1).child(0)), rank);
    }

    #[test]
    fn bounds() {
        let decomp = Decomposition::new([4, 2, 1], 1).unwrap();
        assert!(decomp.is_inside([3, 1, 0]));
        assert!(!decomp.is_inside([4, 0, 0]));
        assert!(!decomp.is_inside([0, -1, 0]));
        assert!(!decomp.is_inside([0, 0, 1]));
    }

    #[test]
    fn rejects_bad_config() {
        assert!(Decomposition::new([0, 4, 1], 1).is_err());
        assert!(Decomposition::new([2, 2, 1], 5).is_err());
    }
}
