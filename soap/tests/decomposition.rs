use proptest::prelude::*;
use soap::access::ArrayAccesses;
use soap::analysis::{IterRange, SubgraphAnalysis};
use soap::expr::SymExpr;
use std::collections::BTreeSet;

const NAMES: [&str; 4] = ["i", "j", "k", "l"];

fn nums(values: &[i64]) -> Vec<SymExpr> {
    values.iter().map(|&v| SymExpr::num(v)).collect()
}

fn decomposed(grid: &[i64], local: &[i64], global: &[i64], accesses: &[(&str, &str)]) -> SubgraphAnalysis {
    let mut array_accesses = ArrayAccesses::new();
    for (array, term) in accesses {
        array_accesses.register(array, term).unwrap();
    }
    SubgraphAnalysis {
        id: 7,
        io_bound: SymExpr::sym("Q"),
        intensity: SymExpr::sym("rho"),
        array_accesses,
        variables: NAMES[..grid.len()].iter().map(|s| s.to_string()).collect(),
        inner_tile: nums(&vec![1; grid.len()]),
        outer_tile: nums(&vec![1; grid.len()]),
        local_domain_dims: nums(local),
        processor_grid: nums(grid),
        global_dims: nums(global),
    }
}

#[test]
fn test_concrete_example_a() {
    let sg = decomposed(&[2, 2], &[4, 4], &[8, 8], &[("A", "i*j")]);
    let expected = [
        (IterRange::new(0, 4), IterRange::new(0, 4)),
        (IterRange::new(0, 4), IterRange::new(4, 8)),
        (IterRange::new(4, 8), IterRange::new(0, 4)),
        (IterRange::new(4, 8), IterRange::new(4, 8)),
    ];
    for (rank, (i, j)) in expected.iter().enumerate() {
        let dist = sg.distribute_for_rank(rank).unwrap();
        assert_eq!(dist["A"]["i"], *i, "rank {} along i", rank);
        assert_eq!(dist["A"]["j"], *j, "rank {} along j", rank);
    }
    assert!(sg.distribute_for_rank(4).unwrap().is_empty(), "rank 4 is idle");
}

#[test]
fn test_concrete_example_b() {
    // i: [0, 4) and k: [0, 8) for rank 0
    let sg = decomposed(&[2, 1, 1], &[4, 8, 8], &[8, 8, 8], &[("A", "i*k")]);
    let dist = sg.distribute_for_rank(0).unwrap();
    let entry = &dist["A"];
    assert_eq!(entry.len(), 2);
    assert_eq!(entry["i"], IterRange::new(0, 4));
    assert_eq!(entry["k"], IterRange::new(0, 8));
    assert!(!entry.contains_key("j"), "only the term's iterators are listed");
}

#[test]
fn test_boundary_clamping() {
    let sg = decomposed(&[3, 2], &[4, 5], &[10, 9], &[("A", "i*j")]);
    let last = sg.distribute_for_rank(5).unwrap();
    assert_eq!(last["A"]["i"], IterRange::new(8, 10));
    assert_eq!(last["A"]["j"], IterRange::new(5, 9));
    assert!(last["A"]["i"].len() < 4);
    assert!(last["A"]["j"].len() < 5);
}

#[test]
fn test_rank_coordinates() {
    let sg = decomposed(&[2, 3], &[1, 1], &[2, 3], &[("A", "i")]);
    assert_eq!(sg.total_ranks().unwrap(), 6);
    assert_eq!(sg.rank_coordinates(4).unwrap(), Some(vec![1, 1]));
    assert_eq!(sg.rank_coordinates(6).unwrap(), None);
}

/// `(grid, local, global)` with every block non-empty.
fn dimension() -> impl Strategy<Value = (i64, i64, i64)> {
    (1i64..=5, 1i64..=6).prop_flat_map(|(grid, local)| {
        (Just(grid), Just(local), ((grid - 1) * local + 1)..=(grid * local))
    })
}

fn split(dims: &[(i64, i64, i64)]) -> (Vec<i64>, Vec<i64>, Vec<i64>) {
    (
        dims.iter().map(|d| d.0).collect(),
        dims.iter().map(|d| d.1).collect(),
        dims.iter().map(|d| d.2).collect(),
    )
}

proptest! {
    #[test]
    fn prop_ranges_cover_and_partition(dims in prop::collection::vec(dimension(), 1..=3)) {
        let (grid, local, global) = split(&dims);
        let term = NAMES[..dims.len()].join("*");
        let sg = decomposed(&grid, &local, &global, &[("X", term.as_str())]);

        let all = sg.distribute_all_ranks().unwrap();
        prop_assert_eq!(all.len() as i64, grid.iter().product::<i64>());

        for (d, name) in NAMES[..dims.len()].iter().enumerate() {
            let blocks: BTreeSet<(i64, i64)> = all
                .iter()
                .map(|dist| {
                    let range = dist["X"][*name];
                    (range.start, range.end)
                })
                .collect();
            prop_assert_eq!(blocks.len() as i64, grid[d]);

            let mut next = 0;
            for (start, end) in &blocks {
                prop_assert_eq!(*start, next, "blocks along {} must be contiguous", name);
                prop_assert!(end > start, "block along {} is empty", name);
                next = *end;
            }
            prop_assert_eq!(next, global[d]);
        }
    }

    #[test]
    fn prop_idle_ranks_get_nothing(dims in prop::collection::vec(dimension(), 1..=3), extra in 0usize..50) {
        let (grid, local, global) = split(&dims);
        let sg = decomposed(&grid, &local, &global, &[("X", "i")]);
        let total = sg.total_ranks().unwrap();
        prop_assert!(sg.distribute_for_rank(total + extra).unwrap().is_empty());
    }

    #[test]
    fn prop_distribution_is_idempotent(dims in prop::collection::vec(dimension(), 1..=3), pick in 0usize..1000) {
        let (grid, local, global) = split(&dims);
        let sg = decomposed(&grid, &local, &global, &[("X", "i"), ("Y", "i")]);
        let rank = pick % sg.total_ranks().unwrap();
        prop_assert_eq!(sg.distribute_for_rank(rank).unwrap(), sg.distribute_for_rank(rank).unwrap());
    }
}
