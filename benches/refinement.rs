//! Benchmarks for the hot selection and pruning paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use skein::{BackendKind, ConflictCache, Family, Hole, Quotient, SparseMdp};

/// A chain of hole-controlled states: state `i` has one action per option
/// of hole `i`, all leading to state `i + 1`, plus a final sink.
fn chain_quotient(num_holes: usize, options: usize) -> (Quotient, Family) {
    let mut row_groups = vec![0];
    let mut transitions = Vec::new();
    let mut labelings: Vec<Vec<(usize, usize)>> = Vec::new();
    for state in 0..num_holes {
        for option in 0..options {
            transitions.push(vec![(state + 1, 1.0)]);
            labelings.push(vec![(state, option)]);
        }
        row_groups.push(transitions.len());
    }
    transitions.push(vec![(num_holes, 1.0)]);
    labelings.push(vec![]);
    row_groups.push(transitions.len());

    let model = SparseMdp::new(row_groups, transitions, vec![0]).unwrap();
    let family = Family::new(
        (0..num_holes)
            .map(|i| Hole::new(format!("h{i}"), (0..options).map(|o| format!("o{o}")).collect()))
            .collect(),
    );
    let quotient = Quotient::new(model, labelings, &family).unwrap();
    (quotient, family)
}

fn bench_select_actions(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_actions");
    for holes in [4usize, 8, 16] {
        let (quotient, family) = chain_quotient(holes, 8);
        group.bench_with_input(BenchmarkId::from_parameter(holes), &holes, |b, _| {
            b.iter(|| black_box(quotient.select_actions(black_box(&family))));
        });
    }
    group.finish();
}

fn bench_family_enumeration(c: &mut Criterion) {
    let (_, family) = chain_quotient(6, 4);
    c.bench_function("all_combinations", |b| {
        b.iter(|| black_box(family.all_combinations().count()));
    });
}

fn bench_conflict_cache(c: &mut Criterion) {
    let (_, family) = chain_quotient(8, 4);
    c.bench_function("exclude_and_pick", |b| {
        b.iter(|| {
            let mut cache = ConflictCache::with_backend(&family, BackendKind::Sat);
            let assignment = family.pick_any();
            let conflict: Vec<usize> = (0..4).collect();
            cache.exclude_assignment(&family, &assignment, &conflict);
            black_box(cache.pick_assignment(&family))
        });
    });
}

criterion_group!(
    benches,
    bench_select_actions,
    bench_family_enumeration,
    bench_conflict_cache
);
criterion_main!(benches);
