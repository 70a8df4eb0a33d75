// ========================================================================================
//
//                                Variant id sets
//
// ========================================================================================
//
// The set of variants matching one (info column, value) pair. Rare values are kept as a
// compressed integer set; common ones as a bit array over the whole variant id space.

use crate::spec_index::VariantId;
use bitvec::prelude::*;
use roaring::RoaringBitmap;

/// Below this match ratio a set is stored sparse.
pub const DEFAULT_SPARSE_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub enum VariantIndex {
    Sparse(RoaringBitmap),
    Dense(BitVec<u64, Lsb0>),
}

impl Default for VariantIndex {
    fn default() -> Self {
        VariantIndex::empty()
    }
}

impl VariantIndex {
    pub fn empty() -> Self {
        VariantIndex::Sparse(RoaringBitmap::new())
    }

    /// Picks the representation from the ratio of matches to `total_variants`.
    pub fn from_ids(ids: RoaringBitmap, total_variants: usize, sparse_threshold: f64) -> Self {
        let ratio = if total_variants == 0 {
            0.0
        } else {
            ids.len() as f64 / total_variants as f64
        };
        if ratio < sparse_threshold {
            return VariantIndex::Sparse(ids);
        }
        let width = ids
            .max()
            .map_or(total_variants, |max| total_variants.max(max as usize + 1));
        let mut bits = BitVec::repeat(false, width);
        for id in &ids {
            bits.set(id as usize, true);
        }
        VariantIndex::Dense(bits)
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, VariantIndex::Sparse(_))
    }

    /// Number of variants in the set.
    pub fn len(&self) -> u64 {
        match self {
            VariantIndex::Sparse(ids) => ids.len(),
            VariantIndex::Dense(bits) => bits.count_ones() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            VariantIndex::Sparse(ids) => ids.is_empty(),
            VariantIndex::Dense(bits) => bits.not_any(),
        }
    }

    pub fn contains(&self, id: VariantId) -> bool {
        match self {
            VariantIndex::Sparse(ids) => ids.contains(id),
            VariantIndex::Dense(bits) => bits.get(id as usize).is_some_and(|bit| *bit),
        }
    }

    /// Cache weight: elements held for a sparse set, array length for a dense one.
    pub fn weight(&self) -> usize {
        match self {
            VariantIndex::Sparse(ids) => ids.len() as usize,
            VariantIndex::Dense(bits) => bits.len(),
        }
    }

    /// Member ids in ascending order.
    pub fn to_ids(&self) -> RoaringBitmap {
        match self {
            VariantIndex::Sparse(ids) => ids.clone(),
            VariantIndex::Dense(bits) => bits.iter_ones().map(|i| i as u32).collect(),
        }
    }

    pub fn union(&self, other: &VariantIndex) -> VariantIndex {
        match (self, other) {
            (VariantIndex::Sparse(a), VariantIndex::Sparse(b)) => VariantIndex::Sparse(a | b),
            (VariantIndex::Dense(a), VariantIndex::Dense(b)) => {
                let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
                let mut out = long.clone();
                for (dst, src) in out
                    .as_raw_mut_slice()
                    .iter_mut()
                    .zip(short.as_raw_slice())
                {
                    *dst |= *src;
                }
                VariantIndex::Dense(out)
            }
            (VariantIndex::Sparse(ids), VariantIndex::Dense(bits))
            | (VariantIndex::Dense(bits), VariantIndex::Sparse(ids)) => {
                let mut out = bits.clone();
                for id in ids {
                    let id = id as usize;
                    if id >= out.len() {
                        out.resize(id + 1, false);
                    }
                    out.set(id, true);
                }
                VariantIndex::Dense(out)
            }
        }
    }

    pub fn intersection(&self, other: &VariantIndex) -> VariantIndex {
        match (self, other) {
            (VariantIndex::Sparse(a), VariantIndex::Sparse(b)) => VariantIndex::Sparse(a & b),
            (VariantIndex::Dense(a), VariantIndex::Dense(b)) => {
                let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                let mut out = short.clone();
                for (dst, src) in out
                    .as_raw_mut_slice()
                    .iter_mut()
                    .zip(long.as_raw_slice())
                {
                    *dst &= *src;
                }
                VariantIndex::Dense(out)
            }
            (VariantIndex::Sparse(ids), VariantIndex::Dense(bits))
            | (VariantIndex::Dense(bits), VariantIndex::Sparse(ids)) => VariantIndex::Sparse(
                ids.iter()
                    .filter(|&id| bits.get(id as usize).is_some_and(|bit| *bit))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u32]) -> RoaringBitmap {
        values.iter().copied().collect()
    }

    #[test]
    fn representation_follows_match_ratio() {
        let sparse = VariantIndex::from_ids(ids(&[1, 2, 3, 4, 5]), 10_000, 0.1);
        assert!(sparse.is_sparse());
        let dense = VariantIndex::from_ids((0..6000).collect(), 10_000, 0.1);
        assert!(!dense.is_sparse());
        assert_eq!(dense.len(), 6000);
        assert_eq!(dense.weight(), 10_000);
        assert_eq!(sparse.weight(), 5);
    }

    #[test]
    fn all_pairings_agree_on_members() {
        let a = [1u32, 5, 9, 40];
        let b = [5u32, 9, 41, 63];
        let sa = VariantIndex::from_ids(ids(&a), 64, 1.1);
        let sb = VariantIndex::from_ids(ids(&b), 64, 1.1);
        let da = VariantIndex::from_ids(ids(&a), 64, 0.0);
        let db = VariantIndex::from_ids(ids(&b), 64, 0.0);
        assert!(sa.is_sparse() && !da.is_sparse());

        let expected_union = ids(&[1, 5, 9, 40, 41, 63]);
        let expected_inter = ids(&[5, 9]);
        for (x, y) in [(&sa, &sb), (&sa, &db), (&da, &sb), (&da, &db)] {
            assert_eq!(x.union(y).to_ids(), expected_union);
            assert_eq!(y.union(x).to_ids(), expected_union);
            assert_eq!(x.intersection(y).to_ids(), expected_inter);
            assert_eq!(y.intersection(x).to_ids(), expected_inter);
        }
    }

    #[test]
    fn mixed_intersection_stays_sparse() {
        let sparse = VariantIndex::from_ids(ids(&[2, 3]), 100, 0.1);
        let dense = VariantIndex::from_ids((0..50).collect(), 100, 0.1);
        assert!(sparse.intersection(&dense).is_sparse());
    }

    #[test]
    fn empty_set_behaviour() {
        let empty = VariantIndex::empty();
        assert!(empty.is_empty());
        assert!(!empty.contains(0));
        let dense = VariantIndex::from_ids(ids(&[0, 1]), 2, 0.1);
        assert_eq!(empty.union(&dense).to_ids(), ids(&[0, 1]));
        assert!(empty.intersection(&dense).is_empty());
        assert_eq!(VariantIndex::from_ids(RoaringBitmap::new(), 0, 0.1), empty);
    }
}
