//! Analysis results and per-rank data decomposition
//!
//! [`Analysis`] and [`SubgraphAnalysis`] are snapshots: they are built once by
//! an orchestrator after the optimizer session has been closed and never
//! refer back to live engine state.
//!
//! # Decomposition
//!
//! A decomposed subgraph carries three index-aligned vectors, one entry per
//! variable: `processor_grid` (ranks per dimension), `local_domain_dims`
//! (block size per rank) and `global_dims` (full extent). A rank id is
//! unranked row-major over the grid, and each dimension's block is clamped at
//! the global extent:
//!
//! ```text
//! rank 5 on grid [2, 3]          -> coordinates [1, 2]
//! coordinates [1, 2], local [4, 3], global [8, 8]
//!                                -> i: [4, 8), j: [6, 8)
//! ```
//!
//! Ranks beyond the grid are idle: they get an empty distribution and a
//! warning, never an error.
//!
//! # Example
//! ```rust
//! use soap::analysis::{IterRange, SubgraphAnalysis};
//! use soap::access::ArrayAccesses;
//! use soap::expr::SymExpr;
//!
//! let mut accesses = ArrayAccesses::new();
//! accesses.register("A", "i*j")?;
//! let subgraph = SubgraphAnalysis {
//!     id: 0,
//!     io_bound: SymExpr::num(0),
//!     intensity: SymExpr::num(1),
//!     array_accesses: accesses,
//!     variables: vec!["i".to_string(), "j".to_string()],
//!     inner_tile: vec![SymExpr::num(1); 2],
//!     outer_tile: vec![SymExpr::num(1); 2],
//!     local_domain_dims: vec![SymExpr::num(4); 2],
//!     processor_grid: vec![SymExpr::num(2); 2],
//!     global_dims: vec![SymExpr::num(8); 2],
//! };
//! let distribution = subgraph.distribute_for_rank(1)?;
//! assert_eq!(distribution["A"]["j"], IterRange::new(4, 8));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::access::ArrayAccesses;
use crate::expr::{ExprError, SymExpr};
use crate::sdg::KernelGraph;
use crate::solver::SolverError;
use log::warn;
use rayon::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecompositionError {
    #[error("subgraph {subgraph} has no decomposition (analyse with schedule generation)")]
    NotDecomposed { subgraph: usize },

    #[error(
        "subgraph {subgraph}: decomposition fields are not aligned \
         ({variables} variables, grid {grid}, local {local}, global {global})"
    )]
    Misaligned {
        subgraph: usize,
        variables: usize,
        grid: usize,
        local: usize,
        global: usize,
    },

    /// A field still contains unresolved symbols
    #[error("subgraph {subgraph}: {field} is not numeric: {source}")]
    Symbolic {
        subgraph: usize,
        field: String,
        #[source]
        source: ExprError,
    },

    #[error("subgraph {subgraph}: {field} must be positive, got {value}")]
    NonPositive {
        subgraph: usize,
        field: String,
        value: i64,
    },

    #[error("subgraph {subgraph}: integer overflow computing {quantity}")]
    Overflow { subgraph: usize, quantity: String },

    /// An access term uses an iterator outside the decomposed dimensions
    #[error(
        "subgraph {subgraph}, rank {rank}: access {array}[{term}] uses iterator \
         '{iterator}' which is not a decomposed dimension"
    )]
    RangeError {
        subgraph: usize,
        array: String,
        term: String,
        iterator: String,
        rank: usize,
    },
}

// ============================================================================
// Ranges
// ============================================================================

/// Half-open integer range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterRange {
    pub start: i64,
    pub end: i64,
}

impl IterRange {
    pub fn new(start: i64, end: i64) -> Self {
        IterRange { start, end }
    }

    pub fn len(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, index: i64) -> bool {
        self.start <= index && index < self.end
    }
}

impl fmt::Display for IterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Iterator name -> range, for one array
pub type ArrayDistribution = BTreeMap<String, IterRange>;

/// Array name -> its ranges, for one rank of one subgraph
pub type RankDistribution = BTreeMap<String, ArrayDistribution>;

// ============================================================================
// Subgraph snapshot
// ============================================================================

/// Result of one connected computational region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubgraphAnalysis {
    pub id: usize,
    /// I/O lower bound (Q)
    pub io_bound: SymExpr,
    /// Computational intensity (rho)
    pub intensity: SymExpr,
    /// Array name -> access term -> iterators
    pub array_accesses: ArrayAccesses,
    /// Dimension order of every per-dimension field
    pub variables: Vec<String>,
    pub inner_tile: Vec<SymExpr>,
    pub outer_tile: Vec<SymExpr>,
    #[serde(default)]
    pub local_domain_dims: Vec<SymExpr>,
    #[serde(default)]
    pub processor_grid: Vec<SymExpr>,
    #[serde(default)]
    pub global_dims: Vec<SymExpr>,
}

/// Numeric decomposition fields, validated
struct Grid {
    ranks: Vec<i64>,
    /// `product(ranks)`, known to fit in `i64`
    total: i64,
    local: Vec<i64>,
    global: Vec<i64>,
}

impl SubgraphAnalysis {
    pub fn is_decomposed(&self) -> bool {
        !self.processor_grid.is_empty()
    }

    fn numeric_grid(&self) -> Result<Grid, DecompositionError> {
        if !self.is_decomposed() {
            return Err(DecompositionError::NotDecomposed { subgraph: self.id });
        }
        let n = self.variables.len();
        if self.processor_grid.len() != n || self.local_domain_dims.len() != n || self.global_dims.len() != n {
            return Err(DecompositionError::Misaligned {
                subgraph: self.id,
                variables: n,
                grid: self.processor_grid.len(),
                local: self.local_domain_dims.len(),
                global: self.global_dims.len(),
            });
        }

        let evaluate = |field: &str, values: &[SymExpr]| -> Result<Vec<i64>, DecompositionError> {
            values
                .iter()
                .zip(&self.variables)
                .map(|(value, variable)| {
                    let field = format!("{}[{}]", field, variable);
                    let number = value.eval_int().map_err(|source| DecompositionError::Symbolic {
                        subgraph: self.id,
                        field: field.clone(),
                        source,
                    })?;
                    if number <= 0 {
                        return Err(DecompositionError::NonPositive {
                            subgraph: self.id,
                            field,
                            value: number,
                        });
                    }
                    Ok(number)
                })
                .collect()
        };

        let ranks = evaluate("processor_grid", &self.processor_grid)?;
        let total = ranks
            .iter()
            .try_fold(1i64, |acc, &r| acc.checked_mul(r))
            .ok_or_else(|| self.overflow("the rank count"))?;
        Ok(Grid {
            ranks,
            total,
            local: evaluate("local_domain_dims", &self.local_domain_dims)?,
            global: evaluate("global_dims", &self.global_dims)?,
        })
    }

    fn overflow(&self, quantity: impl Into<String>) -> DecompositionError {
        DecompositionError::Overflow {
            subgraph: self.id,
            quantity: quantity.into(),
        }
    }

    /// Number of ranks doing work, `product(processor_grid)`.
    pub fn total_ranks(&self) -> Result<usize, DecompositionError> {
        let grid = self.numeric_grid()?;
        usize::try_from(grid.total).map_err(|_| self.overflow("the rank count"))
    }

    /// Grid coordinates of `rank`, or `None` for an idle rank.
    pub fn rank_coordinates(&self, rank: usize) -> Result<Option<Vec<i64>>, DecompositionError> {
        let grid = self.numeric_grid()?;
        Ok(unrank(rank, &grid.ranks))
    }

    /// Local iteration ranges of `rank`, per array and iterator.
    ///
    /// # Returns
    /// * `Ok(RankDistribution)` - empty for idle ranks
    /// * `Err(DecompositionError)` - missing, symbolic or inconsistent fields,
    ///   or an access using an iterator that is not a dimension
    pub fn distribute_for_rank(&self, rank: usize) -> Result<RankDistribution, DecompositionError> {
        let grid = self.numeric_grid()?;
        let Some(coordinates) = unrank(rank, &grid.ranks) else {
            warn!(
                "Decomposition of subgraph {} uses only {} rank(s); rank {} will be idle",
                self.id,
                grid.total,
                rank
            );
            return Ok(RankDistribution::new());
        };

        let mut ranges: BTreeMap<&str, IterRange> = BTreeMap::new();
        for (i, variable) in self.variables.iter().enumerate() {
            let start = coordinates[i]
                .checked_mul(grid.local[i])
                .ok_or_else(|| self.overflow(format!("the start of {} for rank {}", variable, rank)))?;
            // Past i64::MAX the block is clamped at the global extent anyway.
            let end = start.saturating_add(grid.local[i]).min(grid.global[i]);
            ranges.insert(variable.as_str(), IterRange::new(start, end));
        }

        let mut distribution = RankDistribution::new();
        for (array, terms) in self.array_accesses.iter() {
            let mut entry = ArrayDistribution::new();
            for term in terms.values() {
                for iterator in term.iterators() {
                    let range = ranges.get(iterator.as_str()).ok_or_else(|| {
                        DecompositionError::RangeError {
                            subgraph: self.id,
                            array: array.to_string(),
                            term: term.to_string(),
                            iterator: iterator.clone(),
                            rank,
                        }
                    })?;
                    entry.insert(iterator.clone(), *range);
                }
            }
            distribution.insert(array.to_string(), entry);
        }
        Ok(distribution)
    }

    /// Distribution of every working rank, computed in parallel.
    pub fn distribute_all_ranks(&self) -> Result<Vec<RankDistribution>, DecompositionError> {
        let total = self.total_ranks()?;
        (0..total)
            .into_par_iter()
            .map(|rank| self.distribute_for_rank(rank))
            .collect()
    }
}

/// Row-major unranking; `None` when `rank` is beyond the grid.
///
/// The product of `grid` must fit in `i64`; every suffix product is bounded
/// by it.
fn unrank(rank: usize, grid: &[i64]) -> Option<Vec<i64>> {
    let mut suffixes = vec![1i64; grid.len() + 1];
    for i in (0..grid.len()).rev() {
        suffixes[i] = suffixes[i + 1] * grid[i];
    }
    let mut remaining = i64::try_from(rank).ok()?;
    if remaining >= suffixes[0] {
        return None;
    }
    let mut coordinates = Vec::with_capacity(grid.len());
    for &suffix in &suffixes[1..] {
        let coordinate = remaining / suffix;
        coordinates.push(coordinate);
        remaining -= coordinate * suffix;
    }
    Some(coordinates)
}

// ============================================================================
// Whole-graph result
// ============================================================================

fn serialize_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// A subgraph the optimizer could not solve
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegionFailure {
    pub subgraph: usize,
    /// Names of the kernel regions fused into the subgraph
    pub regions: Vec<String>,
    #[serde(serialize_with = "serialize_display")]
    pub error: SolverError,
}

/// Result of one orchestrator call
#[derive(Clone, Debug, Serialize)]
pub struct Analysis {
    pub name: String,
    /// Global I/O lower bound over all solved subgraphs
    pub io_bound: SymExpr,
    pub graph: KernelGraph,
    pub subgraphs: Vec<SubgraphAnalysis>,
    pub failed_regions: Vec<RegionFailure>,
}

impl Analysis {
    pub fn subgraph(&self, id: usize) -> Option<&SubgraphAnalysis> {
        self.subgraphs.iter().find(|s| s.id == id)
    }

    /// True when every subgraph was solved.
    pub fn is_complete(&self) -> bool {
        self.failed_regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subgraph(grid: &[i64], local: &[i64], global: &[i64], accesses: &[(&str, &str)]) -> SubgraphAnalysis {
        let names = ["i", "j", "k", "l"];
        let mut array_accesses = ArrayAccesses::new();
        for (array, term) in accesses {
            array_accesses.register(array, term).unwrap();
        }
        let nums = |v: &[i64]| v.iter().map(|&x| SymExpr::num(x)).collect::<Vec<_>>();
        SubgraphAnalysis {
            id: 0,
            io_bound: SymExpr::num(0),
            intensity: SymExpr::num(1),
            array_accesses,
            variables: names[..grid.len()].iter().map(|s| s.to_string()).collect(),
            inner_tile: nums(&vec![1; grid.len()]),
            outer_tile: nums(&vec![1; grid.len()]),
            local_domain_dims: nums(local),
            processor_grid: nums(grid),
            global_dims: nums(global),
        }
    }

    #[test]
    fn test_range_helpers() {
        let range = IterRange::new(4, 8);
        assert_eq!(range.len(), 4);
        assert!(range.contains(4) && !range.contains(8));
        assert!(IterRange::new(3, 3).is_empty());
        assert_eq!(range.to_string(), "[4, 8)");
    }

    #[test]
    fn test_unranking_is_row_major() {
        assert_eq!(unrank(5, &[2, 3]), Some(vec![1, 2]));
        assert_eq!(unrank(0, &[2, 3]), Some(vec![0, 0]));
        assert_eq!(unrank(6, &[2, 3]), None);
        assert_eq!(unrank(0, &[]), Some(vec![]));
    }

    #[test]
    fn test_last_block_is_clamped() {
        let sg = subgraph(&[3], &[4], &[10], &[("A", "i")]);
        let last = sg.distribute_for_rank(2).unwrap();
        assert_eq!(last["A"]["i"], IterRange::new(8, 10));
    }

    #[test]
    fn test_all_terms_of_an_array_are_merged() {
        let sg = subgraph(&[2, 2], &[4, 4], &[8, 8], &[("A", "i"), ("A", "j")]);
        let dist = sg.distribute_for_rank(3).unwrap();
        assert_eq!(dist["A"].len(), 2);
        assert_eq!(dist["A"]["i"], IterRange::new(4, 8));
        assert_eq!(dist["A"]["j"], IterRange::new(4, 8));
    }

    #[test]
    fn test_unknown_iterator_is_a_range_error() {
        let mut sg = subgraph(&[2], &[4], &[8], &[("A", "i")]);
        sg.array_accesses.register("B", "i*z").unwrap();
        match sg.distribute_for_rank(1) {
            Err(DecompositionError::RangeError { array, iterator, rank, .. }) => {
                assert_eq!(array, "B");
                assert_eq!(iterator, "z");
                assert_eq!(rank, 1);
            }
            other => panic!("expected RangeError, got {:?}", other),
        }
    }

    #[test]
    fn test_symbolic_fields_fail_fast() {
        let mut sg = subgraph(&[2], &[4], &[8], &[("A", "i")]);
        sg.global_dims = vec![SymExpr::sym("N")];
        assert!(matches!(
            sg.distribute_for_rank(0),
            Err(DecompositionError::Symbolic { ref field, .. }) if field == "global_dims[i]"
        ));
    }

    #[test]
    fn test_missing_and_misaligned_fields() {
        let mut sg = subgraph(&[2, 2], &[4, 4], &[8, 8], &[("A", "i")]);
        sg.global_dims.pop();
        assert!(matches!(sg.distribute_for_rank(0), Err(DecompositionError::Misaligned { .. })));

        sg.processor_grid.clear();
        assert_eq!(
            sg.distribute_for_rank(0),
            Err(DecompositionError::NotDecomposed { subgraph: 0 })
        );
    }

    #[test]
    fn test_huge_extents_do_not_overflow() {
        let half = i64::MAX / 2 + 1;
        let sg = subgraph(&[2], &[half], &[i64::MAX], &[("A", "i")]);
        let last = sg.distribute_for_rank(1).unwrap();
        assert_eq!(last["A"]["i"], IterRange::new(half, i64::MAX));

        let sg = subgraph(&[3], &[half], &[i64::MAX], &[("A", "i")]);
        assert!(matches!(
            sg.distribute_for_rank(2),
            Err(DecompositionError::Overflow { subgraph: 0, .. })
        ));

        let sg = subgraph(&[i64::MAX, 2], &[1, 1], &[i64::MAX, 2], &[("A", "i")]);
        assert!(matches!(sg.total_ranks(), Err(DecompositionError::Overflow { .. })));
        assert!(matches!(sg.distribute_for_rank(0), Err(DecompositionError::Overflow { .. })));
    }

    /// Records warnings so tests can assert on diagnostics.
    struct WarningLog;

    static WARNINGS: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

    impl log::Log for WarningLog {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                WARNINGS.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    fn capture_warnings() {
        static INSTALL: std::sync::Once = std::sync::Once::new();
        INSTALL.call_once(|| {
            log::set_logger(&WarningLog).unwrap();
            log::set_max_level(log::LevelFilter::Warn);
        });
    }

    #[test]
    fn test_idle_rank_emits_a_warning() {
        capture_warnings();
        let mut sg = subgraph(&[2, 2], &[4, 4], &[8, 8], &[("A", "i*j")]);
        sg.id = 4242;
        assert!(sg.distribute_for_rank(4).unwrap().is_empty());
        let warnings = WARNINGS.lock().unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("subgraph 4242") && w.contains("rank 4 will be idle")),
            "{:?}",
            warnings
        );
    }

    #[test]
    fn test_distribute_all_ranks() {
        let sg = subgraph(&[2, 3], &[2, 2], &[4, 5], &[("A", "i*j")]);
        let all = sg.distribute_all_ranks().unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all[5]["A"]["j"], IterRange::new(4, 5));
        assert_eq!(all[3], sg.distribute_for_rank(3).unwrap());
    }
}
