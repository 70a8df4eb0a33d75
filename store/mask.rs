// ========================================================================================
//
//                              Patient bitmask algebra
//
// ========================================================================================
//
// A patient mask is a fixed-width bit-vector over a store's roster: bit i is set when
// patient i belongs to the set. The width is carried by the vector itself, so there are
// no padding bits to account for when indexing, counting, or concatenating.

use crate::roster::{PatientId, PatientRoster};
use crate::variant::MaskClass;
use bitvec::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;

pub type MaskBits = BitVec<u64, Lsb0>;

const WORD_BITS: usize = u64::BITS as usize;

/// Number of 64-bit words needed to hold `len` bits.
#[inline]
pub fn words_for(len: usize) -> usize {
    len.div_ceil(WORD_BITS)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatientMask {
    bits: MaskBits,
}

impl PatientMask {
    /// The all-zero mask over a roster of `len` patients: the identity of `union`.
    pub fn empty(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    /// The mask holding every patient of a roster of `len` patients.
    pub fn full(len: usize) -> Self {
        Self::from_bits(BitVec::repeat(true, len))
    }

    /// Word-wise operations read raw storage, so every mask starts at bit 0 of its first
    /// word and keeps the bits past its length clear.
    pub fn from_bits(mut bits: MaskBits) -> Self {
        bits.force_align();
        bits.set_uninitialized(false);
        Self { bits }
    }

    /// Builds a mask from little-endian words as written by [`PatientMask::to_words`].
    /// Bits beyond `len` in the final word are cleared.
    pub fn from_words(len: usize, mut words: Vec<u64>) -> Option<Self> {
        if words.len() != words_for(len) {
            return None;
        }
        let tail = len % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        let mut bits = MaskBits::from_vec(words);
        bits.truncate(len);
        Some(Self { bits })
    }

    pub fn to_words(&self) -> Vec<u64> {
        self.bits.as_raw_slice().to_vec()
    }

    /// Roster length this mask is defined over.
    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when no patient is set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    #[inline]
    pub fn popcount(&self) -> usize {
        self.bits.count_ones()
    }

    #[inline]
    pub fn test_bit(&self, index: usize) -> bool {
        self.bits.get(index).map(|bit| *bit).unwrap_or(false)
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn bits(&self) -> &BitSlice<u64, Lsb0> {
        &self.bits
    }

    pub fn union(&self, other: &PatientMask) -> PatientMask {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn intersection(&self, other: &PatientMask) -> PatientMask {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    pub fn union_with(&mut self, other: &PatientMask) {
        self.assert_same_width(other);
        for (dst, src) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *dst |= *src;
        }
    }

    pub fn intersect_with(&mut self, other: &PatientMask) {
        self.assert_same_width(other);
        for (dst, src) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *dst &= *src;
        }
    }

    /// True when the two masks share at least one patient.
    pub fn intersects(&self, other: &PatientMask) -> bool {
        self.assert_same_width(other);
        self.bits
            .as_raw_slice()
            .iter()
            .zip(other.bits.as_raw_slice())
            .any(|(a, b)| a & b != 0)
    }

    /// `self`'s bits followed by `other`'s, over the concatenated roster.
    pub fn concat(&self, other: &PatientMask) -> PatientMask {
        let mut bits = MaskBits::with_capacity(self.len() + other.len());
        bits.extend_from_bitslice(&self.bits);
        bits.extend_from_bitslice(&other.bits);
        Self::from_bits(bits)
    }

    /// The sub-mask covering `range` of the roster, re-based so that bit 0 of the result
    /// is the first word's lowest bit.
    pub fn slice(&self, range: Range<usize>) -> PatientMask {
        Self::from_bits(self.bits[range].iter().by_vals().collect())
    }

    /// Sets exactly the roster positions whose patient id is in `ids`. Ids outside the
    /// roster are ignored.
    pub fn build_from_subset<'a, I>(ids: I, roster: &PatientRoster) -> PatientMask
    where
        I: IntoIterator<Item = &'a PatientId>,
    {
        let mut mask = PatientMask::empty(roster.len());
        for &id in ids {
            for &position in roster.positions_of(id) {
                mask.set(position);
            }
        }
        mask
    }

    /// The patient ids whose bits are set, in roster order.
    pub fn extract_subset(&self, roster: &PatientRoster) -> Vec<PatientId> {
        debug_assert_eq!(self.len(), roster.len());
        self.bits
            .iter_ones()
            .filter_map(|index| roster.ids().get(index).copied())
            .collect()
    }

    #[inline]
    fn assert_same_width(&self, other: &PatientMask) {
        assert_eq!(
            self.len(),
            other.len(),
            "patient masks over rosters of different length cannot be combined"
        );
    }
}

// ========================================================================================
//                                Per-variant mask records
// ========================================================================================

/// Up to four masks for one variant. A missing class means no patient is in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskRecord {
    masks: [Option<PatientMask>; MaskClass::COUNT],
}

impl MaskRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: MaskClass) -> Option<&PatientMask> {
        self.masks[class.index()].as_ref()
    }

    /// Stores `mask` for `class`; an all-zero mask is dropped rather than stored.
    pub fn set(&mut self, class: MaskClass, mask: PatientMask) {
        self.masks[class.index()] = if mask.is_empty() { None } else { Some(mask) };
    }

    pub fn mask_or_empty(&self, class: MaskClass, len: usize) -> PatientMask {
        self.get(class)
            .cloned()
            .unwrap_or_else(|| PatientMask::empty(len))
    }

    pub fn is_empty(&self) -> bool {
        self.masks.iter().all(Option::is_none)
    }

    /// Patients carrying the variant: heterozygous ∪ homozygous.
    pub fn carriers(&self, len: usize) -> PatientMask {
        let mut mask = self.mask_or_empty(MaskClass::Heterozygous, len);
        if let Some(homozygous) = self.get(MaskClass::Homozygous) {
            mask.union_with(homozygous);
        }
        mask
    }

    /// True if any heterozygous, homozygous or heterozygous-no-call patient is in
    /// `patients`. Homozygous no-calls are not of interest.
    pub fn touches(&self, patients: &PatientMask) -> bool {
        [
            MaskClass::Heterozygous,
            MaskClass::Homozygous,
            MaskClass::HeterozygousNoCall,
        ]
        .into_iter()
        .filter_map(|class| self.get(class))
        .any(|mask| mask.intersects(patients))
    }

    /// Concatenates two records over disjoint rosters. A record or class missing on one
    /// side contributes an all-zero segment of that side's width.
    pub fn concat(
        left: Option<&MaskRecord>,
        right: Option<&MaskRecord>,
        left_len: usize,
        right_len: usize,
    ) -> MaskRecord {
        let mut merged = MaskRecord::new();
        for class in MaskClass::ALL {
            let l = left.and_then(|r| r.get(class));
            let r = right.and_then(|r| r.get(class));
            if l.is_none() && r.is_none() {
                continue;
            }
            let l = l.cloned().unwrap_or_else(|| PatientMask::empty(left_len));
            let r = r.cloned().unwrap_or_else(|| PatientMask::empty(right_len));
            merged.set(class, l.concat(&r));
        }
        merged
    }
}

/// The contents of one bucket: every variant stored in it with its masks.
pub type Bucket = BTreeMap<crate::variant::VariantKey, MaskRecord>;

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_of(len: usize, ones: &[usize]) -> PatientMask {
        let mut mask = PatientMask::empty(len);
        for &i in ones {
            mask.set(i);
        }
        mask
    }

    #[test]
    fn union_and_intersection_match_set_semantics() {
        let a = mask_of(70, &[0, 3, 65]);
        let b = mask_of(70, &[3, 4, 69]);
        assert_eq!(
            a.union(&b).iter_ones().collect::<Vec<_>>(),
            vec![0, 3, 4, 65, 69]
        );
        assert_eq!(a.intersection(&b).iter_ones().collect::<Vec<_>>(), vec![3]);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&mask_of(70, &[1, 2])));
    }

    #[test]
    fn empty_is_identity_and_annihilator() {
        let m = mask_of(10, &[1, 9]);
        let empty = PatientMask::empty(10);
        assert_eq!(m.union(&empty), m);
        assert_eq!(m.intersection(&empty), empty);
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 10);
        assert_eq!(empty.popcount(), 0);
    }

    #[test]
    #[should_panic(expected = "different length")]
    fn mismatched_widths_are_rejected() {
        PatientMask::empty(3).union(&PatientMask::empty(4));
    }

    #[test]
    fn subset_round_trip_over_roster() {
        let roster = PatientRoster::new(vec![10, 20, 30, 40]);
        let mask = PatientMask::build_from_subset(&[40, 10, 999], &roster);
        assert_eq!(mask.popcount(), 2);
        assert!(mask.test_bit(0));
        assert!(mask.test_bit(3));
        assert!(!mask.test_bit(4));
        assert_eq!(mask.extract_subset(&roster), vec![10, 40]);
    }

    #[test]
    fn concat_places_right_bits_after_left() {
        let a = mask_of(2, &[0, 1]);
        let b = PatientMask::empty(2);
        let merged = a.concat(&b);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged.popcount(), 2);
        assert!(!merged.test_bit(2));
        assert!(!merged.test_bit(3));
        assert_eq!(merged.slice(0..2), a);
        assert_eq!(merged.slice(2..4), b);
    }

    #[test]
    fn slices_start_at_word_bit_zero() {
        let mask = mask_of(4, &[3]);
        let tail = mask.slice(2..4);
        assert_eq!(tail.iter_ones().collect::<Vec<_>>(), vec![1]);
        assert_eq!(tail.to_words(), vec![0b10]);
        assert!(tail.intersects(&mask_of(2, &[1])));
        assert!(!tail.intersects(&mask_of(2, &[0])));

        let wide = mask_of(130, &[70, 129]);
        let cut = wide.slice(65..130);
        assert_eq!(cut.to_words(), vec![1 << 5, 1]);
        let mut both = cut.clone();
        both.intersect_with(&mask_of(65, &[5, 64]));
        assert_eq!(both.iter_ones().collect::<Vec<_>>(), vec![5, 64]);

        assert_eq!(PatientMask::full(3).to_words(), vec![0b111]);
    }

    #[test]
    fn words_round_trip_and_clear_tail_bits() {
        let mask = mask_of(67, &[0, 64, 66]);
        let words = mask.to_words();
        assert_eq!(words.len(), 2);
        assert_eq!(PatientMask::from_words(67, words).unwrap(), mask);
        let dirty = PatientMask::from_words(3, vec![u64::MAX]).unwrap();
        assert_eq!(dirty.popcount(), 3);
        assert!(PatientMask::from_words(65, vec![0]).is_none());
    }

    #[test]
    fn record_omits_empty_classes_and_reports_carriers() {
        let mut record = MaskRecord::new();
        record.set(MaskClass::Heterozygous, mask_of(4, &[0]));
        record.set(MaskClass::Homozygous, mask_of(4, &[2]));
        record.set(MaskClass::HomozygousNoCall, PatientMask::empty(4));
        assert!(record.get(MaskClass::HomozygousNoCall).is_none());
        assert_eq!(record.carriers(4).iter_ones().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn touches_ignores_homozygous_no_call() {
        let mut record = MaskRecord::new();
        record.set(MaskClass::HomozygousNoCall, mask_of(4, &[1]));
        assert!(!record.touches(&mask_of(4, &[1])));
        record.set(MaskClass::HeterozygousNoCall, mask_of(4, &[1]));
        assert!(record.touches(&mask_of(4, &[1])));
    }

    #[test]
    fn record_concat_zero_fills_missing_side() {
        let mut left = MaskRecord::new();
        left.set(MaskClass::Heterozygous, mask_of(2, &[0, 1]));
        let merged = MaskRecord::concat(Some(&left), None, 2, 2);
        let het = merged.get(MaskClass::Heterozygous).unwrap();
        assert_eq!(het.len(), 4);
        assert_eq!(het.popcount(), 2);
        assert!(!het.test_bit(2) && !het.test_bit(3));
        assert!(merged.get(MaskClass::Homozygous).is_none());
    }
}
