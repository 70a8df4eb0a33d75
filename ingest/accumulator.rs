use crate::mask::{Bucket, MaskBits, MaskRecord, PatientMask};
use crate::variant::{MaskClass, VariantKey};
use bitvec::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-patient calls of one variant, one lazily allocated bit array per persisted class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZygosityAccumulator {
    classes: [Option<MaskBits>; MaskClass::COUNT],
}

impl ZygosityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks roster position `slot` as `class` over a roster of `patient_count`.
    pub fn record(&mut self, slot: usize, class: MaskClass, patient_count: usize) {
        self.classes[class.index()]
            .get_or_insert_with(|| BitVec::repeat(false, patient_count))
            .set(slot, true);
    }

    /// True once any patient has a persisted class for this variant.
    pub fn has_calls(&self) -> bool {
        self.classes.iter().any(Option::is_some)
    }

    pub fn merge(&mut self, other: ZygosityAccumulator) {
        for (mine, theirs) in self.classes.iter_mut().zip(other.classes) {
            let Some(theirs) = theirs else { continue };
            if let Some(bits) = mine.as_mut() {
                for (dst, src) in bits
                    .as_raw_mut_slice()
                    .iter_mut()
                    .zip(theirs.as_raw_slice())
                {
                    *dst |= *src;
                }
            } else {
                *mine = Some(theirs);
            }
        }
    }

    /// Converts each class array into a mask; all-zero classes are omitted.
    pub fn into_record(self) -> MaskRecord {
        let mut record = MaskRecord::new();
        for (class, bits) in MaskClass::ALL.into_iter().zip(self.classes) {
            if let Some(bits) = bits {
                record.set(class, PatientMask::from_bits(bits));
            }
        }
        record
    }
}

/// Accumulated calls for every variant of one bucket of one contig.
#[derive(Debug, Clone)]
pub struct BucketAccumulator {
    pub contig: Arc<str>,
    pub bucket_id: u32,
    variants: BTreeMap<VariantKey, ZygosityAccumulator>,
}

impl BucketAccumulator {
    pub fn new(contig: Arc<str>, bucket_id: u32) -> Self {
        Self {
            contig,
            bucket_id,
            variants: BTreeMap::new(),
        }
    }

    pub fn holds(&self, key: &VariantKey) -> bool {
        *self.contig == *key.contig() && self.bucket_id == key.bucket()
    }

    pub fn variant(&mut self, key: &VariantKey) -> &mut ZygosityAccumulator {
        self.variants.entry(key.clone()).or_default()
    }

    /// Drops variants that gathered no persisted call.
    pub fn retain_called(&mut self) {
        self.variants.retain(|_, acc| acc.has_calls());
    }

    pub fn keys(&self) -> impl Iterator<Item = &VariantKey> {
        self.variants.keys()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// The flip: turns the per-class arrays into the bucket's mask records.
    pub fn into_bucket(self) -> Bucket {
        self.variants
            .into_iter()
            .map(|(key, acc)| (key, acc.into_record()))
            .collect()
    }
}
