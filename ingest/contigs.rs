// ========================================================================================
//
//                               Shared contig order
//
// ========================================================================================
//
// Each input lists its contigs in its own order and may skip contigs the others carry.
// The scan needs one order every file agrees with, so the per-file orders are merged
// before any record is read: consecutive contigs of a file become precedence edges, and
// a topological sort over them yields the store's order. Ties go to the contig seen
// first across the manifest.

use super::IngestError;
use ahash::AHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Rank of every contig in the merged order.
#[derive(Debug, Clone, Default)]
pub struct ContigRanks {
    order: Vec<String>,
    ranks: AHashMap<String, usize>,
}

impl ContigRanks {
    /// Merges the contig order of each input. Fails when two inputs place a pair of
    /// contigs in opposite orders.
    pub fn merge(per_file: &[Vec<String>]) -> Result<Self, IngestError> {
        let mut first_seen: AHashMap<&str, usize> = AHashMap::new();
        let mut names: Vec<&str> = Vec::new();
        for contig in per_file.iter().flatten() {
            first_seen.entry(contig.as_str()).or_insert_with(|| {
                names.push(contig.as_str());
                names.len() - 1
            });
        }

        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); names.len()];
        let mut pending = vec![0usize; names.len()];
        for order in per_file {
            for pair in order.windows(2) {
                let (before, after) = (first_seen[pair[0].as_str()], first_seen[pair[1].as_str()]);
                if !successors[before].contains(&after) {
                    successors[before].push(after);
                    pending[after] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| Reverse(node))
            .collect();
        let mut order = Vec::with_capacity(names.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(names[node].to_string());
            for &next in &successors[node] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < names.len() {
            let stuck = pending
                .iter()
                .enumerate()
                .filter(|(_, count)| **count > 0)
                .map(|(node, _)| names[node].to_string())
                .collect();
            return Err(IngestError::ContigConflict { contigs: stuck });
        }

        let ranks = order
            .iter()
            .enumerate()
            .map(|(rank, name)| (name.clone(), rank))
            .collect();
        Ok(Self { order, ranks })
    }

    /// Contigs no input declared rank after every known one.
    pub fn rank(&self, contig: &str) -> usize {
        self.ranks.get(contig).copied().unwrap_or(usize::MAX)
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders(files: &[&[&str]]) -> Vec<Vec<String>> {
        files
            .iter()
            .map(|f| f.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn files_skipping_a_contig_still_share_one_order() {
        let ranks = ContigRanks::merge(&orders(&[&["chrX", "chrM"], &["chrX", "chrY", "chrM"]]))
            .unwrap();
        assert_eq!(ranks.order(), ["chrX", "chrY", "chrM"]);
        assert!(ranks.rank("chrY") < ranks.rank("chrM"));
        assert_eq!(ranks.rank("chr9"), usize::MAX);
    }

    #[test]
    fn unrelated_contigs_follow_first_appearance() {
        let ranks = ContigRanks::merge(&orders(&[&["3"], &["1", "2"], &["2", "10"]])).unwrap();
        assert_eq!(ranks.order(), ["3", "1", "2", "10"]);
    }

    #[test]
    fn opposite_orders_are_rejected() {
        let err = ContigRanks::merge(&orders(&[&["1", "2", "3"], &["3", "1"]])).unwrap_err();
        match err {
            IngestError::ContigConflict { contigs } => {
                assert!(contigs.contains(&"1".to_string()));
                assert!(contigs.contains(&"3".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_inputs_give_an_empty_order() {
        let ranks = ContigRanks::merge(&[]).unwrap();
        assert!(ranks.order().is_empty());
    }
}
