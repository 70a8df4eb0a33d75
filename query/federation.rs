// ========================================================================================
//
//                                  Federated stores
//
// ========================================================================================
//
// Several sealed stores behind one query interface. A chromosome parent joins stores that
// share a roster but cover different contigs; its masks are bit-aligned, so children's
// results union. A patient-merging parent joins stores over different populations; its
// roster is the concatenation of its children's, and so are its masks. Children are
// queried concurrently but always reduced in declaration order.

use super::{GenomicQuery, QueryError, join};
use crate::config::{ConfigError, StoreConfig};
use crate::info::InfoColumnMeta;
use crate::layout::GenomicStore;
use crate::mask::PatientMask;
use crate::pool::{log_and_wait, processor_pool, sized_pool};
use crate::roster::{PatientId, PatientRoster};
use crate::variant::VariantKey;
use ahash::AHashMap;
use log::{info, warn};
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Everything a caller can ask of a store or a tree of stores.
pub trait GenomicProcessor: Send + Sync {
    /// The patients whose positions define bit indices of this processor's masks.
    fn roster(&self) -> Arc<PatientRoster>;

    fn contigs(&self) -> Vec<String>;

    /// One scoped mask per filter of `query`, variant filters first, then info filters.
    fn filter_masks(&self, query: &GenomicQuery) -> Result<Vec<PatientMask>, QueryError>;

    /// Candidate variants of `query` carried by at least one patient of `mask`.
    fn variant_list_for_mask(
        &self,
        query: &GenomicQuery,
        mask: &PatientMask,
    ) -> Result<Vec<VariantKey>, QueryError>;

    fn info_columns(&self) -> Vec<InfoColumnMeta>;

    fn info_values(&self, column: &str) -> Result<Vec<String>, QueryError>;

    fn build_mask(&self, ids: &[PatientId]) -> PatientMask {
        PatientMask::build_from_subset(ids, &self.roster())
    }

    fn mask_to_ids(&self, mask: &PatientMask) -> Vec<PatientId> {
        mask.extract_subset(&self.roster())
    }

    fn patient_mask(&self, query: &GenomicQuery) -> Result<PatientMask, QueryError> {
        let masks = self.filter_masks(query)?;
        let scope = match &query.patients {
            Some(ids) => self.build_mask(ids),
            None => PatientMask::full(self.roster().len()),
        };
        Ok(join::combine_filter_masks(scope, &masks))
    }

    fn variant_list(&self, query: &GenomicQuery) -> Result<Vec<VariantKey>, QueryError> {
        let mask = self.patient_mask(query)?;
        self.variant_list_for_mask(query, &mask)
    }
}

// ========================================================================================
//                                        Leaf
// ========================================================================================

pub struct LeafProcessor {
    store: GenomicStore,
    pool: Arc<ThreadPool>,
}

impl LeafProcessor {
    pub fn new(store: GenomicStore, pool: Arc<ThreadPool>) -> Self {
        Self { store, pool }
    }

    /// Opens the store at `root` with its own query pool.
    pub fn open(root: &Path, config: &StoreConfig) -> Result<Self, QueryError> {
        let pool = sized_pool(config.threads()).map_err(|e| QueryError::Threads(e.to_string()))?;
        Ok(Self::new(GenomicStore::open(root, config)?, Arc::new(pool)))
    }

    pub fn store(&self) -> &GenomicStore {
        &self.store
    }
}

impl GenomicProcessor for LeafProcessor {
    fn roster(&self) -> Arc<PatientRoster> {
        self.store.roster().clone()
    }

    fn contigs(&self) -> Vec<String> {
        self.store.contigs().map(str::to_string).collect()
    }

    fn filter_masks(&self, query: &GenomicQuery) -> Result<Vec<PatientMask>, QueryError> {
        self.pool.install(|| join::filter_masks(&self.store, query))
    }

    fn variant_list_for_mask(
        &self,
        query: &GenomicQuery,
        mask: &PatientMask,
    ) -> Result<Vec<VariantKey>, QueryError> {
        self.pool
            .install(|| join::variant_list_for_mask(&self.store, query, mask))
    }

    fn info_columns(&self) -> Vec<InfoColumnMeta> {
        self.store.info().columns().cloned().collect()
    }

    fn info_values(&self, column: &str) -> Result<Vec<String>, QueryError> {
        Ok(self.store.info().column_values(column)?)
    }
}

// ========================================================================================
//                                   Shared fan-out
// ========================================================================================

type Children = Vec<Box<dyn GenomicProcessor>>;

/// Runs `f` on every child concurrently and returns the results in child order. The
/// first failing child fails the whole call.
fn fan_out<T, F>(children: &[Box<dyn GenomicProcessor>], f: F) -> Result<Vec<T>, QueryError>
where
    T: Send,
    F: Fn(usize, &dyn GenomicProcessor) -> Result<T, QueryError> + Sync,
{
    children
        .par_iter()
        .enumerate()
        .map(|(index, child)| {
            f(index, child.as_ref()).map_err(|source| QueryError::Child {
                index,
                source: Box::new(source),
            })
        })
        .collect()
}

fn merged_columns(children: &[Box<dyn GenomicProcessor>]) -> Vec<InfoColumnMeta> {
    let mut columns: BTreeMap<String, InfoColumnMeta> = BTreeMap::new();
    for meta in children.iter().flat_map(|c| c.info_columns()) {
        match columns.get_mut(&meta.key) {
            Some(existing) => *existing = existing.merged_with(&meta),
            None => {
                columns.insert(meta.key.clone(), meta);
            }
        }
    }
    columns.into_values().collect()
}

fn merged_values(
    children: &[Box<dyn GenomicProcessor>],
    column: &str,
) -> Result<Vec<String>, QueryError> {
    let values: BTreeSet<String> = fan_out(children, |_, child| child.info_values(column))?
        .into_iter()
        .flatten()
        .collect();
    Ok(values.into_iter().collect())
}

fn sorted_unique(lists: Vec<Vec<VariantKey>>) -> Vec<VariantKey> {
    let mut keys: Vec<VariantKey> = lists.into_iter().flatten().collect();
    keys.sort_unstable();
    keys.dedup();
    keys
}

// ========================================================================================
//                                 Chromosome parent
// ========================================================================================

pub struct ChromosomeParent {
    children: Children,
    roster: Arc<PatientRoster>,
}

impl ChromosomeParent {
    /// Children must share one roster and serve disjoint contigs.
    pub fn new(children: Children) -> Result<Self, QueryError> {
        let Some(first) = children.first() else {
            return Err(QueryError::Topology(
                "a chromosome parent needs at least one child".to_string(),
            ));
        };
        let roster = first.roster();
        let mut owners: AHashMap<String, usize> = AHashMap::new();
        for (index, child) in children.iter().enumerate() {
            if child.roster().ids() != roster.ids() {
                return Err(QueryError::Topology(format!(
                    "child {index} of a chromosome parent has a different patient roster"
                )));
            }
            for contig in child.contigs() {
                if let Some(other) = owners.insert(contig.clone(), index) {
                    return Err(QueryError::Topology(format!(
                        "contig '{contig}' is served by both child {other} and child {index}"
                    )));
                }
            }
        }
        Ok(Self { children, roster })
    }
}

impl GenomicProcessor for ChromosomeParent {
    fn roster(&self) -> Arc<PatientRoster> {
        self.roster.clone()
    }

    fn contigs(&self) -> Vec<String> {
        self.children.iter().flat_map(|c| c.contigs()).collect()
    }

    /// Each filter matches a patient if it matches on any chromosome.
    fn filter_masks(&self, query: &GenomicQuery) -> Result<Vec<PatientMask>, QueryError> {
        let mut per_child = fan_out(&self.children, |_, child| child.filter_masks(query))?.into_iter();
        let Some(mut combined) = per_child.next() else {
            return Ok(Vec::new());
        };
        for masks in per_child {
            for (acc, mask) in combined.iter_mut().zip(&masks) {
                acc.union_with(mask);
            }
        }
        Ok(combined)
    }

    fn variant_list_for_mask(
        &self,
        query: &GenomicQuery,
        mask: &PatientMask,
    ) -> Result<Vec<VariantKey>, QueryError> {
        let lists = fan_out(&self.children, |_, child| {
            child.variant_list_for_mask(query, mask)
        })?;
        Ok(sorted_unique(lists))
    }

    fn info_columns(&self) -> Vec<InfoColumnMeta> {
        merged_columns(&self.children)
    }

    fn info_values(&self, column: &str) -> Result<Vec<String>, QueryError> {
        merged_values(&self.children, column)
    }
}

// ========================================================================================
//                              Patient-merging parent
// ========================================================================================

pub struct PatientMergingParent {
    children: Children,
    roster: Arc<PatientRoster>,
    spans: Vec<Range<usize>>,
}

impl PatientMergingParent {
    pub fn new(children: Children) -> Result<Self, QueryError> {
        if children.is_empty() {
            return Err(QueryError::Topology(
                "a patient-merging parent needs at least one child".to_string(),
            ));
        }
        let mut roster = PatientRoster::new(Vec::new());
        let mut spans = Vec::with_capacity(children.len());
        for (index, child) in children.iter().enumerate() {
            let part = child.roster();
            let overlap = roster.overlap(&part);
            if !overlap.is_empty() {
                warn!(
                    "child {index} repeats {} patient ids already served by earlier children",
                    overlap.len()
                );
            }
            spans.push(roster.len()..roster.len() + part.len());
            roster = roster.concat(&part);
        }
        Ok(Self {
            children,
            roster: Arc::new(roster),
            spans,
        })
    }
}

impl GenomicProcessor for PatientMergingParent {
    fn roster(&self) -> Arc<PatientRoster> {
        self.roster.clone()
    }

    fn contigs(&self) -> Vec<String> {
        let contigs: BTreeSet<String> = self.children.iter().flat_map(|c| c.contigs()).collect();
        contigs.into_iter().collect()
    }

    /// Each filter's mask is the children's masks laid end to end.
    fn filter_masks(&self, query: &GenomicQuery) -> Result<Vec<PatientMask>, QueryError> {
        let per_child = fan_out(&self.children, |_, child| child.filter_masks(query))?;
        let mut combined: Vec<PatientMask> = (0..query.filter_count())
            .map(|_| PatientMask::empty(0))
            .collect();
        for masks in per_child {
            for (acc, mask) in combined.iter_mut().zip(&masks) {
                *acc = acc.concat(mask);
            }
        }
        Ok(combined)
    }

    fn variant_list_for_mask(
        &self,
        query: &GenomicQuery,
        mask: &PatientMask,
    ) -> Result<Vec<VariantKey>, QueryError> {
        let lists = fan_out(&self.children, |index, child| {
            child.variant_list_for_mask(query, &mask.slice(self.spans[index].clone()))
        })?;
        Ok(sorted_unique(lists))
    }

    fn info_columns(&self) -> Vec<InfoColumnMeta> {
        merged_columns(&self.children)
    }

    fn info_values(&self, column: &str) -> Result<Vec<String>, QueryError> {
        merged_values(&self.children, column)
    }
}

// ========================================================================================
//                                Federation description
// ========================================================================================

/// One node of a federation tree as written in its TOML description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FederationNode {
    Leaf { path: PathBuf },
    Chromosome { children: Vec<FederationNode> },
    Patients { children: Vec<FederationNode> },
}

impl FederationNode {
    fn leaf_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            FederationNode::Leaf { path } => out.push(path),
            FederationNode::Chromosome { children } | FederationNode::Patients { children } => {
                children.iter().for_each(|c| c.leaf_paths(out));
            }
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        match self {
            FederationNode::Leaf { path } => {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
            FederationNode::Chromosome { children } | FederationNode::Patients { children } => {
                children.iter_mut().for_each(|c| c.resolve_paths(base));
            }
        }
    }

    /// Builds the processor tree, taking opened leaves in declaration order.
    fn assemble(
        &self,
        leaves: &mut impl Iterator<Item = LeafProcessor>,
    ) -> Result<Box<dyn GenomicProcessor>, QueryError> {
        match self {
            FederationNode::Leaf { path } => match leaves.next() {
                Some(leaf) => Ok(Box::new(leaf)),
                None => Err(QueryError::Topology(format!(
                    "no opened store for leaf '{}'",
                    path.display()
                ))),
            },
            FederationNode::Chromosome { children } => {
                let children = children
                    .iter()
                    .map(|c| c.assemble(leaves))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(ChromosomeParent::new(children)?))
            }
            FederationNode::Patients { children } => {
                let children = children
                    .iter()
                    .map(|c| c.assemble(leaves))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(PatientMergingParent::new(children)?))
            }
        }
    }
}

/// A federation tree loaded from TOML:
///
/// ```toml
/// [root]
/// kind = "patients"
///
/// [[root.children]]
/// kind = "leaf"
/// path = "cohort_a"
///
/// [[root.children]]
/// kind = "leaf"
/// path = "cohort_b"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FederationSpec {
    pub root: FederationNode,
}

impl FederationSpec {
    pub fn from_toml_str(text: &str) -> Result<Self, QueryError> {
        toml::from_str(text).map_err(|e| QueryError::Config(ConfigError::TomlParseError(e)))
    }

    /// Loads a description; relative leaf paths are taken relative to the file.
    pub fn from_toml_path(path: &Path) -> Result<Self, QueryError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        let mut spec = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            spec.root.resolve_paths(base);
        }
        Ok(spec)
    }

    pub fn leaf_paths(&self) -> Vec<&Path> {
        let mut paths = Vec::new();
        self.root.leaf_paths(&mut paths);
        paths
    }

    /// Opens every leaf in parallel, then assembles the tree. Leaves share one query pool.
    pub fn build(&self, config: &StoreConfig) -> Result<Box<dyn GenomicProcessor>, QueryError> {
        let paths = self.leaf_paths();
        let startup = processor_pool().map_err(|e| QueryError::Threads(e.to_string()))?;
        let stores: Vec<Result<GenomicStore, QueryError>> =
            log_and_wait("federated stores opened", paths.len(), |completed| {
                startup.install(|| {
                    paths
                        .par_iter()
                        .map(|path| {
                            let store = GenomicStore::open(path, config).map_err(QueryError::from);
                            completed.fetch_add(1, Ordering::Relaxed);
                            store
                        })
                        .collect()
                })
            });
        let stores = stores.into_iter().collect::<Result<Vec<_>, _>>()?;

        let pool = Arc::new(
            sized_pool(config.threads()).map_err(|e| QueryError::Threads(e.to_string()))?,
        );
        let mut leaves = stores
            .into_iter()
            .map(|store| LeafProcessor::new(store, pool.clone()));
        let root = self.root.assemble(&mut leaves)?;
        info!(
            "Federation ready: {} stores, {} patients",
            paths.len(),
            root.roster().len()
        );
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fixtures::{FixtureVariant, build_store, variant};
    use tempfile::tempdir;

    fn leaf(
        root: &Path,
        patients: &[PatientId],
        variants: &[FixtureVariant],
    ) -> Box<dyn GenomicProcessor> {
        let store = build_store(root, patients, variants);
        Box::new(LeafProcessor::new(store, Arc::new(sized_pool(2).unwrap())))
    }

    fn key(text: &str) -> VariantKey {
        text.parse().unwrap()
    }

    #[test]
    fn chromosome_parent_unions_per_filter_then_ands() {
        let dir = tempdir().unwrap();
        let patients = [1, 2, 3];
        let chr1 = leaf(
            &dir.path().join("chr1"),
            &patients,
            &[variant("1,100,A,T", &[0], &[], "BRCA1", 5)],
        );
        let chr2 = leaf(
            &dir.path().join("chr2"),
            &patients,
            &[
                variant("2,100,A,T", &[1], &[], "BRCA1", 5),
                variant("2,300,C,T", &[0, 2], &[], "TP53", 5),
            ],
        );
        let parent = ChromosomeParent::new(vec![chr1, chr2]).unwrap();

        let brca = GenomicQuery::new().with_info("GENE=BRCA1".parse().unwrap());
        let mask = parent.patient_mask(&brca).unwrap();
        assert_eq!(parent.mask_to_ids(&mask), vec![1, 2]);

        // Each filter unions across chromosomes before the filters are ANDed.
        let both = brca.clone().with_variant("2,300,C,T".parse().unwrap());
        assert_eq!(parent.mask_to_ids(&parent.patient_mask(&both).unwrap()), vec![1]);

        assert_eq!(
            parent.variant_list(&brca).unwrap(),
            vec![key("1,100,A,T"), key("2,100,A,T")]
        );
        assert_eq!(parent.info_values("GENE").unwrap(), vec!["BRCA1", "TP53"]);
    }

    #[test]
    fn chromosome_parent_rejects_overlapping_contigs_and_rosters() {
        let dir = tempdir().unwrap();
        let a = leaf(&dir.path().join("a"), &[1, 2], &[variant("1,1,A,T", &[0], &[], "G", 1)]);
        let b = leaf(&dir.path().join("b"), &[1, 2], &[variant("1,9,A,T", &[1], &[], "G", 1)]);
        assert!(matches!(
            ChromosomeParent::new(vec![a, b]),
            Err(QueryError::Topology(_))
        ));

        let c = leaf(&dir.path().join("c"), &[1, 2], &[variant("1,1,A,T", &[0], &[], "G", 1)]);
        let d = leaf(&dir.path().join("d"), &[1, 3], &[variant("2,9,A,T", &[1], &[], "G", 1)]);
        assert!(ChromosomeParent::new(vec![c, d]).is_err());
    }

    #[test]
    fn patient_parent_concatenates_in_child_order() {
        let dir = tempdir().unwrap();
        let a = leaf(
            &dir.path().join("a"),
            &[1, 2],
            &[variant("1,100,A,T", &[1], &[], "BRCA1", 5)],
        );
        let b = leaf(
            &dir.path().join("b"),
            &[3, 4],
            &[
                variant("1,100,A,T", &[], &[0], "BRCA1", 5),
                variant("1,200,G,C", &[1], &[], "TP53", 5),
            ],
        );
        let parent = PatientMergingParent::new(vec![a, b]).unwrap();
        assert_eq!(parent.roster().ids(), &[1, 2, 3, 4]);

        let query = GenomicQuery::new().with_variant("1,100,A,T".parse().unwrap());
        let mask = parent.patient_mask(&query).unwrap();
        assert_eq!(mask.len(), 4);
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(parent.mask_to_ids(&mask), vec![2, 3]);

        let scoped = query.clone().with_patients(vec![3]);
        assert_eq!(parent.mask_to_ids(&parent.patient_mask(&scoped).unwrap()), vec![3]);

        let tp53 = GenomicQuery::new().with_info("GENE=TP53".parse().unwrap());
        assert_eq!(parent.variant_list(&tp53).unwrap(), vec![key("1,200,G,C")]);
        assert_eq!(parent.build_mask(&[4]).iter_ones().collect::<Vec<_>>(), vec![3]);
    }

    struct Unreachable;

    impl GenomicProcessor for Unreachable {
        fn roster(&self) -> Arc<PatientRoster> {
            Arc::new(PatientRoster::new(vec![9]))
        }

        fn contigs(&self) -> Vec<String> {
            Vec::new()
        }

        fn filter_masks(&self, _: &GenomicQuery) -> Result<Vec<PatientMask>, QueryError> {
            Err(QueryError::Threads("offline".to_string()))
        }

        fn variant_list_for_mask(
            &self,
            _: &GenomicQuery,
            _: &PatientMask,
        ) -> Result<Vec<VariantKey>, QueryError> {
            Err(QueryError::Threads("offline".to_string()))
        }

        fn info_columns(&self) -> Vec<InfoColumnMeta> {
            Vec::new()
        }

        fn info_values(&self, _: &str) -> Result<Vec<String>, QueryError> {
            Err(QueryError::Threads("offline".to_string()))
        }
    }

    #[test]
    fn failing_child_fails_the_query() {
        let dir = tempdir().unwrap();
        let a = leaf(&dir.path().join("a"), &[1], &[variant("1,100,A,T", &[0], &[], "G", 1)]);
        let parent = PatientMergingParent::new(vec![a, Box::new(Unreachable)]).unwrap();
        let query = GenomicQuery::new().with_variant("1,100,A,T".parse().unwrap());
        assert!(matches!(
            parent.patient_mask(&query),
            Err(QueryError::Child { index: 1, .. })
        ));
        assert!(parent.info_values("GENE").is_err());

        let empty = PatientMergingParent::new(Vec::new());
        assert!(matches!(empty, Err(QueryError::Topology(_))));
    }

    #[test]
    fn federation_description_opens_nested_tree() {
        let dir = tempdir().unwrap();
        build_store(&dir.path().join("a1"), &[1, 2], &[variant("1,5,A,T", &[0], &[], "G", 1)]);
        build_store(&dir.path().join("a2"), &[1, 2], &[variant("2,5,A,T", &[1], &[], "G", 1)]);
        build_store(&dir.path().join("b"), &[7], &[variant("1,5,A,T", &[0], &[], "G", 1)]);
        let description = dir.path().join("federation.toml");
        fs::write(
            &description,
            r#"
[root]
kind = "patients"

[[root.children]]
kind = "chromosome"

[[root.children.children]]
kind = "leaf"
path = "a1"

[[root.children.children]]
kind = "leaf"
path = "a2"

[[root.children]]
kind = "leaf"
path = "b"
"#,
        )
        .unwrap();

        let spec = FederationSpec::from_toml_path(&description).unwrap();
        assert_eq!(spec.leaf_paths().len(), 3);
        let root = spec.build(&StoreConfig::default()).unwrap();
        assert_eq!(root.roster().ids(), &[1, 2, 7]);
        let mut contigs = root.contigs();
        contigs.sort();
        assert_eq!(contigs, vec!["1", "2"]);

        let query = GenomicQuery::new().with_variant("1,5,A,T".parse().unwrap());
        assert_eq!(root.mask_to_ids(&root.patient_mask(&query).unwrap()), vec![1, 7]);

        assert!(FederationSpec::from_toml_str("[root]\nkind = \"forest\"").is_err());
    }
}
