// ========================================================================================
//
//                        PATIENT MASK & VARIANT SET BENCHMARK
//
// ========================================================================================
//
// Measures the two set algebras every query leans on: word-wise AND/OR over patient
// masks at cohort scale, and union/intersection over variant id sets in each of their
// representations.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use roaring::RoaringBitmap;
use varmask::mask::PatientMask;
use varmask::value_index::VariantIndex;

/// Deterministic pseudo-random mask with roughly one bit in `every` set.
fn spread_mask(len: usize, every: usize, seed: usize) -> PatientMask {
    let mut mask = PatientMask::empty(len);
    let mut state = seed.wrapping_mul(0x9E37_79B9) | 1;
    for i in 0..len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        if state % every == 0 {
            mask.set(i);
        }
    }
    mask
}

fn benchmark_masks(c: &mut Criterion) {
    let mut group = c.benchmark_group("patient_masks");
    for &patients in &[10_000usize, 100_000, 500_000] {
        let a = spread_mask(patients, 3, 1);
        let b = spread_mask(patients, 5, 2);
        group.throughput(Throughput::Elements(patients as u64));

        group.bench_with_input(BenchmarkId::new("intersection", patients), &patients, |bench, _| {
            bench.iter(|| black_box(black_box(&a).intersection(black_box(&b))));
        });
        group.bench_with_input(BenchmarkId::new("union", patients), &patients, |bench, _| {
            bench.iter(|| black_box(black_box(&a).union(black_box(&b))));
        });
        group.bench_with_input(BenchmarkId::new("popcount", patients), &patients, |bench, _| {
            bench.iter(|| black_box(black_box(&a).popcount()));
        });
    }
    group.finish();
}

fn benchmark_variant_sets(c: &mut Criterion) {
    const TOTAL: usize = 1_000_000;
    let rare: RoaringBitmap = (0..TOTAL as u32).step_by(997).collect();
    let common: RoaringBitmap = (0..TOTAL as u32).filter(|id| id % 3 != 0).collect();

    let sparse = VariantIndex::from_ids(rare.clone(), TOTAL, 0.1);
    let dense = VariantIndex::from_ids(common, TOTAL, 0.1);
    let dense_rare = VariantIndex::from_ids(rare, TOTAL, 0.0);

    let mut group = c.benchmark_group("variant_sets");
    let pairs = [
        ("sparse_dense", &sparse, &dense),
        ("dense_dense", &dense_rare, &dense),
        ("sparse_sparse", &sparse, &sparse),
    ];
    for (label, x, y) in pairs {
        group.bench_function(BenchmarkId::new("intersection", label), |bench| {
            bench.iter(|| black_box(black_box(x).intersection(black_box(y))));
        });
        group.bench_function(BenchmarkId::new("union", label), |bench| {
            bench.iter(|| black_box(black_box(x).union(black_box(y))));
        });
    }
    group.finish();
}

criterion_group!(mask_algebra, benchmark_masks, benchmark_variant_sets);
criterion_main!(mask_algebra);
