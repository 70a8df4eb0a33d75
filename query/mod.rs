// ========================================================================================
//
//                                  Genomic queries
//
// ========================================================================================
//
// A query narrows an optional in-scope patient set by explicit-variant zygosity filters
// and INFO-column filters. Every filter becomes a patient mask; the masks are ANDed and
// intersected with the scope. The reverse direction lists the candidate variants that
// some matching patient actually carries.

pub mod federation;
pub mod join;

#[cfg(test)]
mod fixtures;

pub use federation::{
    ChromosomeParent, FederationNode, FederationSpec, GenomicProcessor, LeafProcessor,
    PatientMergingParent,
};

use crate::config::ConfigError;
use crate::error::StoreError;
use crate::roster::PatientId;
use crate::variant::{VariantKey, VariantKeyParseError};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid filter '{text}': {reason}")]
    InvalidFilter { text: String, reason: String },
    #[error(transparent)]
    VariantKey(#[from] VariantKeyParseError),
    #[error("invalid federation: {0}")]
    Topology(String),
    #[error("federation child {index} failed: {source}")]
    Child {
        index: usize,
        #[source]
        source: Box<QueryError>,
    },
    #[error("could not start query workers: {0}")]
    Threads(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    fn invalid(text: &str, reason: impl Into<String>) -> Self {
        QueryError::InvalidFilter {
            text: text.to_string(),
            reason: reason.into(),
        }
    }
}

/// Which of a variant's masks an explicit-variant filter selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZygosityFilter {
    Heterozygous,
    Homozygous,
    /// Heterozygous or homozygous.
    #[default]
    Either,
}

impl FromStr for ZygosityFilter {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "het" | "heterozygous" => Ok(ZygosityFilter::Heterozygous),
            "hom" | "homozygous" => Ok(ZygosityFilter::Homozygous),
            "either" | "any" => Ok(ZygosityFilter::Either),
            other => Err(QueryError::invalid(
                other,
                "zygosity must be one of het, hom, either",
            )),
        }
    }
}

impl fmt::Display for ZygosityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ZygosityFilter::Heterozygous => "het",
            ZygosityFilter::Homozygous => "hom",
            ZygosityFilter::Either => "either",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantFilter {
    pub key: VariantKey,
    pub zygosity: ZygosityFilter,
}

impl VariantFilter {
    pub fn new(key: VariantKey, zygosity: ZygosityFilter) -> Self {
        Self { key, zygosity }
    }
}

impl FromStr for VariantFilter {
    type Err = QueryError;

    /// `contig,position,ref,alt[:het|hom|either]`. A suffix that is not a zygosity word
    /// stays part of the key, so contig names may contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((key, suffix)) = s.rsplit_once(':') {
            if let Ok(zygosity) = suffix.parse::<ZygosityFilter>() {
                return Ok(Self::new(key.parse()?, zygosity));
            }
        }
        Ok(Self::new(s.parse()?, ZygosityFilter::Either))
    }
}

/// Accepted values for one INFO column.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoPredicate {
    /// Any of these exact values.
    Values(Vec<String>),
    /// Any numeric value in `min..=max`.
    Range { min: f64, max: f64 },
}

/// Columns mapped to accepted values. Values within a column union; columns intersect.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InfoFilter {
    pub columns: BTreeMap<String, InfoPredicate>,
}

impl InfoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, S>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.insert(
            column.to_string(),
            InfoPredicate::Values(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn with_range(mut self, column: &str, min: f64, max: f64) -> Self {
        self.columns
            .insert(column.to_string(), InfoPredicate::Range { min, max });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn parse_bound(text: &str, bound: &str, default: f64) -> Result<f64, QueryError> {
    let bound = bound.trim();
    if bound.is_empty() {
        return Ok(default);
    }
    bound
        .parse::<f64>()
        .map_err(|_| QueryError::invalid(text, format!("'{bound}' is not a number")))
}

impl FromStr for InfoFilter {
    type Err = QueryError;

    /// `COL=v1,v2;COL2=lo..hi`. Either range bound may be omitted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut filter = InfoFilter::new();
        for clause in s.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            let Some((column, raw)) = clause.split_once('=') else {
                return Err(QueryError::invalid(clause, "expected COLUMN=VALUES"));
            };
            let column = column.trim();
            if column.is_empty() {
                return Err(QueryError::invalid(clause, "column name is empty"));
            }
            let predicate = match raw.split_once("..") {
                Some((lo, hi)) => {
                    let min = parse_bound(clause, lo, f64::NEG_INFINITY)?;
                    let max = parse_bound(clause, hi, f64::INFINITY)?;
                    if min > max {
                        return Err(QueryError::invalid(clause, "range is empty"));
                    }
                    InfoPredicate::Range { min, max }
                }
                None => {
                    let values: Vec<String> = raw
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                        .collect();
                    if values.is_empty() {
                        return Err(QueryError::invalid(clause, "no values given"));
                    }
                    InfoPredicate::Values(values)
                }
            };
            if filter.columns.insert(column.to_string(), predicate).is_some() {
                return Err(QueryError::invalid(
                    clause,
                    format!("column '{column}' appears twice"),
                ));
            }
        }
        if filter.is_empty() {
            return Err(QueryError::invalid(s, "no columns given"));
        }
        Ok(filter)
    }
}

/// The genomic part of a cohort query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenomicQuery {
    /// Patients already in scope from other filters; `None` means the whole roster.
    pub patients: Option<Vec<PatientId>>,
    pub variant_filters: Vec<VariantFilter>,
    pub info_filters: Vec<InfoFilter>,
}

impl GenomicQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patients(mut self, patients: Vec<PatientId>) -> Self {
        self.patients = Some(patients);
        self
    }

    pub fn with_variant(mut self, filter: VariantFilter) -> Self {
        self.variant_filters.push(filter);
        self
    }

    pub fn with_info(mut self, filter: InfoFilter) -> Self {
        self.info_filters.push(filter);
        self
    }

    /// Number of filter masks the query produces: variant filters first, then info filters.
    pub fn filter_count(&self) -> usize {
        self.variant_filters.len() + self.info_filters.len()
    }

    pub fn has_genomic_filters(&self) -> bool {
        self.filter_count() > 0
    }
}
