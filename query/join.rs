// ========================================================================================
//
//                          Query evaluation against one store
//
// ========================================================================================

use super::{GenomicQuery, InfoFilter, InfoPredicate, QueryError, VariantFilter, ZygosityFilter};
use crate::layout::GenomicStore;
use crate::mask::{Bucket, PatientMask};
use crate::roster::PatientId;
use crate::value_index::VariantIndex;
use crate::variant::{MaskClass, VariantKey};
use log::debug;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// The in-scope patients as a mask; every patient when no scope is given.
pub fn scope_mask(store: &GenomicStore, patients: Option<&[PatientId]>) -> PatientMask {
    match patients {
        Some(ids) => PatientMask::build_from_subset(ids, store.roster()),
        None => PatientMask::full(store.patient_count()),
    }
}

/// ANDs every filter mask into the scope. With no filters the scope is the answer.
pub fn combine_filter_masks(scope: PatientMask, masks: &[PatientMask]) -> PatientMask {
    masks.iter().fold(scope, |mut acc, mask| {
        acc.intersect_with(mask);
        acc
    })
}

/// Patients with the requested zygosity at the filter's variant. Unknown variants match
/// nobody.
pub fn variant_filter_mask(
    store: &GenomicStore,
    filter: &VariantFilter,
) -> Result<PatientMask, QueryError> {
    let len = store.patient_count();
    let Some(record) = store.record(&filter.key)? else {
        return Ok(PatientMask::empty(len));
    };
    Ok(match filter.zygosity {
        ZygosityFilter::Heterozygous => record.mask_or_empty(MaskClass::Heterozygous, len),
        ZygosityFilter::Homozygous => record.mask_or_empty(MaskClass::Homozygous, len),
        ZygosityFilter::Either => record.carriers(len),
    })
}

/// Variant ids accepted by every column of `filter`. Columns the store does not index
/// accept nothing.
pub fn info_filter_variants(
    store: &GenomicStore,
    filter: &InfoFilter,
) -> Result<VariantIndex, QueryError> {
    let mut matched: Option<VariantIndex> = None;
    for (column, predicate) in &filter.columns {
        let ids = match predicate {
            InfoPredicate::Values(values) => store.info().lookup_any(column, values)?,
            InfoPredicate::Range { min, max } => {
                (*store.info().lookup_range(column, *min, *max)?).clone()
            }
        };
        let next = match matched {
            Some(acc) => acc.intersection(&ids),
            None => ids,
        };
        let exhausted = next.is_empty();
        matched = Some(next);
        if exhausted {
            break;
        }
    }
    Ok(matched.unwrap_or_default())
}

/// Keys for the ids in `ids`, in key order.
pub fn keys_for(store: &GenomicStore, ids: &VariantIndex) -> Vec<VariantKey> {
    let specs = store.specs();
    let mut keys: Vec<VariantKey> = ids
        .to_ids()
        .iter()
        .filter_map(|id| specs.get(id).cloned())
        .collect();
    keys.sort_unstable();
    keys
}

/// Splits sorted keys into runs that share one stored bucket.
fn bucket_groups(keys: &[VariantKey]) -> Vec<&[VariantKey]> {
    keys.chunk_by(|a, b| a.contig() == b.contig() && a.bucket() == b.bucket())
        .collect()
}

// Groups run concurrently and each reads its bucket once, so the contig's single-slot
// cache is bypassed here.
fn load_group(store: &GenomicStore, group: &[VariantKey]) -> Result<Option<Bucket>, QueryError> {
    let Some(first) = group.first() else {
        return Ok(None);
    };
    match store.chunked(first.contig()) {
        Some(chunked) => Ok(chunked.get(first.bucket())?),
        None => Ok(None),
    }
}

/// Unions the carriers (heterozygous or homozygous) of every key into a mask restricted
/// to `scope`. Scanning stops once every in-scope patient is covered.
pub fn realize_variants(
    store: &GenomicStore,
    keys: &[VariantKey],
    scope: &PatientMask,
) -> Result<PatientMask, QueryError> {
    let len = store.patient_count();
    let target = scope.popcount();
    if keys.is_empty() || target == 0 {
        return Ok(PatientMask::empty(len));
    }

    let accumulated = Mutex::new(PatientMask::empty(len));
    let saturated = AtomicBool::new(false);
    bucket_groups(keys)
        .par_iter()
        .try_for_each(|group| -> Result<(), QueryError> {
            if saturated.load(Ordering::Relaxed) {
                return Ok(());
            }
            let Some(bucket) = load_group(store, group)? else {
                return Ok(());
            };
            let mut carriers = PatientMask::empty(len);
            for record in group.iter().filter_map(|key| bucket.get(key)) {
                for class in [MaskClass::Heterozygous, MaskClass::Homozygous] {
                    if let Some(mask) = record.get(class) {
                        carriers.union_with(mask);
                    }
                }
            }
            carriers.intersect_with(scope);

            let mut acc = accumulated.lock().unwrap_or_else(PoisonError::into_inner);
            acc.union_with(&carriers);
            if acc.popcount() == target {
                saturated.store(true, Ordering::Relaxed);
            }
            Ok(())
        })?;

    if saturated.load(Ordering::Relaxed) {
        debug!("every in-scope patient matched; variant scan stopped early");
    }
    Ok(accumulated
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner))
}

enum FilterRef<'a> {
    Variant(&'a VariantFilter),
    Info(&'a InfoFilter),
}

/// One scoped mask per filter, variant filters first, then info filters.
pub fn filter_masks(
    store: &GenomicStore,
    query: &GenomicQuery,
) -> Result<Vec<PatientMask>, QueryError> {
    let scope = scope_mask(store, query.patients.as_deref());
    let filters: Vec<FilterRef<'_>> = query
        .variant_filters
        .iter()
        .map(FilterRef::Variant)
        .chain(query.info_filters.iter().map(FilterRef::Info))
        .collect();

    filters
        .par_iter()
        .map(|filter| match filter {
            FilterRef::Variant(filter) => {
                let mut mask = variant_filter_mask(store, filter)?;
                mask.intersect_with(&scope);
                Ok(mask)
            }
            FilterRef::Info(filter) => {
                let ids = info_filter_variants(store, filter)?;
                realize_variants(store, &keys_for(store, &ids), &scope)
            }
        })
        .collect()
}

/// Patients in scope that pass every filter.
pub fn patient_mask(store: &GenomicStore, query: &GenomicQuery) -> Result<PatientMask, QueryError> {
    let masks = filter_masks(store, query)?;
    let scope = scope_mask(store, query.patients.as_deref());
    Ok(combine_filter_masks(scope, &masks))
}

/// Variants a query could list: the intersection of its info filters' variant sets plus
/// its explicit variants. A query without genomic filters names no variants.
pub fn candidate_variants(
    store: &GenomicStore,
    query: &GenomicQuery,
) -> Result<Vec<VariantKey>, QueryError> {
    let sets = query
        .info_filters
        .par_iter()
        .map(|filter| info_filter_variants(store, filter))
        .collect::<Result<Vec<_>, QueryError>>()?;
    let mut keys = sets
        .into_iter()
        .reduce(|acc, set| acc.intersection(&set))
        .map(|ids| keys_for(store, &ids))
        .unwrap_or_default();
    keys.extend(query.variant_filters.iter().map(|f| f.key.clone()));
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}

/// Candidate variants carried (heterozygous, homozygous or heterozygous no-call) by at
/// least one patient of `mask`, in key order.
pub fn variant_list_for_mask(
    store: &GenomicStore,
    query: &GenomicQuery,
    mask: &PatientMask,
) -> Result<Vec<VariantKey>, QueryError> {
    if mask.is_empty() {
        return Ok(Vec::new());
    }
    let candidates = candidate_variants(store, query)?;
    let per_group = bucket_groups(&candidates)
        .par_iter()
        .map(|group| -> Result<Vec<VariantKey>, QueryError> {
            let Some(bucket) = load_group(store, group)? else {
                return Ok(Vec::new());
            };
            Ok(group
                .iter()
                .filter(|key| bucket.get(*key).is_some_and(|r| r.touches(mask)))
                .cloned()
                .collect())
        })
        .collect::<Result<Vec<_>, QueryError>>()?;
    Ok(per_group.into_iter().flatten().collect())
}

pub fn variant_list(store: &GenomicStore, query: &GenomicQuery) -> Result<Vec<VariantKey>, QueryError> {
    let mask = patient_mask(store, query)?;
    variant_list_for_mask(store, query, &mask)
}
