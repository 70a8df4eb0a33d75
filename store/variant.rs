// ========================================================================================
//
//                          Variant identity & zygosity classes
//
// ========================================================================================
//
// A variant is identified by (contig, position, ref, alt). The key is the sort key of
// the ingestion merge and the map key of every bucket, so its ordering must be total
// and consistent with equality.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Width of a position bucket. A bucket is the unit of on-disk storage and of flushes.
pub const BUCKET_SIZE: u32 = 1000;

/// Returns the bucket that holds `position`.
#[inline]
pub fn bucket_of(position: u32) -> u32 {
    position / BUCKET_SIZE
}

/// Natural ordering for contig names (`chr2` < `chr10`), with a lexical tie-break so that
/// distinct names never compare equal.
pub fn compare_contigs(a: &str, b: &str) -> Ordering {
    natord::compare(a, b).then_with(|| a.cmp(b))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariantKeyParseError {
    #[error("variant key '{0}' must have the form contig,position,ref,alt")]
    FieldCount(String),
    #[error("variant key '{key}' has an invalid position '{position}'")]
    Position { key: String, position: String },
    #[error("variant key '{0}' has an empty contig or allele")]
    EmptyField(String),
}

/// Canonical identity of a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    contig: Arc<str>,
    position: u32,
    reference: Box<str>,
    alternate: Box<str>,
}

impl VariantKey {
    pub fn new(
        contig: impl Into<Arc<str>>,
        position: u32,
        reference: impl Into<Box<str>>,
        alternate: impl Into<Box<str>>,
    ) -> Self {
        Self {
            contig: contig.into(),
            position,
            reference: reference.into(),
            alternate: alternate.into(),
        }
    }

    #[inline]
    pub fn contig(&self) -> &str {
        &self.contig
    }

    /// Shared handle to the contig name, cheap to clone into many keys.
    #[inline]
    pub fn contig_arc(&self) -> &Arc<str> {
        &self.contig
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.position
    }

    #[inline]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    #[inline]
    pub fn alternate(&self) -> &str {
        &self.alternate
    }

    #[inline]
    pub fn bucket(&self) -> u32 {
        bucket_of(self.position)
    }
}

impl Ord for VariantKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_contigs(&self.contig, &other.contig)
            .then_with(|| self.position.cmp(&other.position))
            .then_with(|| self.reference.cmp(&other.reference))
            .then_with(|| self.alternate.cmp(&other.alternate))
    }
}

impl PartialOrd for VariantKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.contig, self.position, self.reference, self.alternate
        )
    }
}

impl FromStr for VariantKey {
    type Err = VariantKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let fields: Vec<&str> = trimmed.split(',').collect();
        if fields.len() != 4 {
            return Err(VariantKeyParseError::FieldCount(trimmed.to_string()));
        }
        if fields.iter().any(|f| f.is_empty()) {
            return Err(VariantKeyParseError::EmptyField(trimmed.to_string()));
        }
        let position = fields[1]
            .parse::<u32>()
            .map_err(|_| VariantKeyParseError::Position {
                key: trimmed.to_string(),
                position: fields[1].to_string(),
            })?;
        Ok(Self::new(fields[0], position, fields[2], fields[3]))
    }
}

// ========================================================================================
//                                   Zygosity classes
// ========================================================================================

/// The class a 3-character genotype code falls into.
///
/// The class is `(c0 + c1 + c2) mod 7` over the first three bytes of the genotype field.
/// Existing stores were built with this mapping, so it is a format requirement: the
/// discriminants below are the residues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Zygosity {
    Other = 0,
    /// `./0`, `0/.` and phased equivalents.
    HeterozygousNoCallReference = 1,
    /// `./1`, `1/.` and phased equivalents.
    HeterozygousNoCall = 2,
    HomozygousReference = 3,
    Heterozygous = 4,
    Homozygous = 5,
    HomozygousNoCall = 6,
}

impl Zygosity {
    /// Classifies a raw genotype field. Codes shorter than three bytes are `Other`.
    pub fn from_genotype(code: &[u8]) -> Self {
        if code.len() < 3 {
            return Zygosity::Other;
        }
        let sum = code[0] as u32 + code[1] as u32 + code[2] as u32;
        match sum % 7 {
            1 => Zygosity::HeterozygousNoCallReference,
            2 => Zygosity::HeterozygousNoCall,
            3 => Zygosity::HomozygousReference,
            4 => Zygosity::Heterozygous,
            5 => Zygosity::Homozygous,
            6 => Zygosity::HomozygousNoCall,
            _ => Zygosity::Other,
        }
    }

    /// The persisted mask this class contributes to, if any.
    pub fn mask_class(self) -> Option<MaskClass> {
        match self {
            Zygosity::Heterozygous => Some(MaskClass::Heterozygous),
            Zygosity::Homozygous => Some(MaskClass::Homozygous),
            Zygosity::HeterozygousNoCall => Some(MaskClass::HeterozygousNoCall),
            Zygosity::HomozygousNoCall => Some(MaskClass::HomozygousNoCall),
            Zygosity::Other
            | Zygosity::HeterozygousNoCallReference
            | Zygosity::HomozygousReference => None,
        }
    }
}

/// The four zygosity categories that are stored as patient masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MaskClass {
    Heterozygous,
    Homozygous,
    HeterozygousNoCall,
    HomozygousNoCall,
}

impl MaskClass {
    pub const COUNT: usize = 4;
    pub const ALL: [MaskClass; MaskClass::COUNT] = [
        MaskClass::Heterozygous,
        MaskClass::Homozygous,
        MaskClass::HeterozygousNoCall,
        MaskClass::HomozygousNoCall,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            MaskClass::Heterozygous => 0,
            MaskClass::Homozygous => 1,
            MaskClass::HeterozygousNoCall => 2,
            MaskClass::HomozygousNoCall => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(999), 0);
        assert_eq!(bucket_of(1000), 1);
        assert_eq!(bucket_of(1999), 1);
        assert_eq!(bucket_of(250_000), 250);
    }

    #[test]
    fn keys_order_by_contig_then_position_then_alleles() {
        let a = VariantKey::new("chr2", 500, "A", "T");
        let b = VariantKey::new("chr10", 100, "A", "T");
        let c = VariantKey::new("chr2", 500, "A", "G");
        let d = VariantKey::new("chr2", 501, "A", "C");
        let mut keys = vec![b.clone(), d.clone(), a.clone(), c.clone()];
        keys.sort();
        assert_eq!(keys, vec![c, a, d, b]);
    }

    #[test]
    fn contig_order_is_total() {
        assert_eq!(compare_contigs("chr1", "chr1"), Ordering::Equal);
        assert_ne!(compare_contigs("chr01", "chr1"), Ordering::Equal);
        assert_eq!(compare_contigs("9", "10"), Ordering::Less);
    }

    #[test]
    fn key_round_trips_through_its_string_form() {
        let key = VariantKey::new("chr4", 9_856_624, "CAAAAA", "C");
        let text = key.to_string();
        assert_eq!(text, "chr4,9856624,CAAAAA,C");
        assert_eq!(text.parse::<VariantKey>().unwrap(), key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(matches!(
            "chr1,100,A".parse::<VariantKey>(),
            Err(VariantKeyParseError::FieldCount(_))
        ));
        assert!(matches!(
            "chr1,abc,A,T".parse::<VariantKey>(),
            Err(VariantKeyParseError::Position { .. })
        ));
        assert!(matches!(
            "chr1,1,,T".parse::<VariantKey>(),
            Err(VariantKeyParseError::EmptyField(_))
        ));
    }

    #[test]
    fn standard_genotype_codes_map_to_expected_classes() {
        let cases: &[(&str, Zygosity)] = &[
            ("0/0", Zygosity::HomozygousReference),
            ("0|0", Zygosity::HomozygousReference),
            ("0/1", Zygosity::Heterozygous),
            ("1/0", Zygosity::Heterozygous),
            ("0|1", Zygosity::Heterozygous),
            ("1|0", Zygosity::Heterozygous),
            ("1/1", Zygosity::Homozygous),
            ("1|1", Zygosity::Homozygous),
            ("./.", Zygosity::HomozygousNoCall),
            (".|.", Zygosity::HomozygousNoCall),
            ("./1", Zygosity::HeterozygousNoCall),
            ("1/.", Zygosity::HeterozygousNoCall),
            (".|1", Zygosity::HeterozygousNoCall),
            ("1|.", Zygosity::HeterozygousNoCall),
            ("./0", Zygosity::HeterozygousNoCallReference),
            ("0/.", Zygosity::HeterozygousNoCallReference),
            (".|0", Zygosity::HeterozygousNoCallReference),
            ("0|.", Zygosity::HeterozygousNoCallReference),
        ];
        for (code, expected) in cases {
            assert_eq!(
                Zygosity::from_genotype(code.as_bytes()),
                *expected,
                "genotype {code}"
            );
        }
    }

    #[test]
    fn only_the_first_three_bytes_are_read() {
        assert_eq!(
            Zygosity::from_genotype(b"0/1:35:99"),
            Zygosity::Heterozygous
        );
        assert_eq!(Zygosity::from_genotype(b"1"), Zygosity::Other);
    }

    #[test]
    fn only_four_classes_are_persisted() {
        assert_eq!(
            Zygosity::Heterozygous.mask_class(),
            Some(MaskClass::Heterozygous)
        );
        assert_eq!(Zygosity::HomozygousReference.mask_class(), None);
        assert_eq!(Zygosity::HeterozygousNoCallReference.mask_class(), None);
        for (i, class) in MaskClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }
}
