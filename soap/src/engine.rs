//! Analysis engine
//!
//! Drives the optimizer session over a kernel graph:
//!
//! 1. **Precondition**: the graph must be one weakly-connected component and
//!    acyclic; otherwise [`SoapError::PreconditionFailure`] is raised before
//!    any solve call
//! 2. **Kernel merging**: regions joined by an edge and iterating over the
//!    same loop nest (names and extents) are fused into one subgraph
//! 3. **Solving**: every subgraph becomes a [`SubProblem`]; failures of one
//!    subgraph (timeout, cache miss, unsolvable access structure) are recorded
//!    and do not affect the others
//! 4. **Composition**: the global bound is the sum of the subgraph bounds in
//!    kernel execution order
//!
//! [`init_decomposition`] then maps a solved subgraph onto a processor grid.

use crate::access::ArrayAccesses;
use crate::analysis::{DecompositionError, RegionFailure, SubgraphAnalysis};
use crate::config::{DecompositionParams, DecompositionStrategy, SoapParams};
use crate::error::SoapError;
use crate::expr::{Bindings, SymExpr};
use crate::sdg::{KernelGraph, Region, RegionId};
use crate::solver::{ProblemArray, Solver, SubProblem};
use log::{debug, info, warn};
use num_integer::Integer;
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, BTreeSet};

/// A solved subgraph, owned by the engine until snapshotted
#[derive(Clone, Debug, PartialEq)]
pub struct Subgraph {
    pub id: usize,
    /// Names of the fused kernel regions, in execution order
    pub regions: Vec<String>,
    pub variables: Vec<String>,
    pub extents: Vec<SymExpr>,
    pub phis: ArrayAccesses,
    pub io_bound: SymExpr,
    pub intensity: SymExpr,
    pub inner_tile: Vec<SymExpr>,
    pub outer_tile: Vec<SymExpr>,
    pub loc_domain_dims: Vec<SymExpr>,
    pub p_grid: Vec<SymExpr>,
    pub global_dims: Vec<SymExpr>,
}

impl Subgraph {
    /// Immutable copy; decomposition fields only when requested.
    pub fn snapshot(&self, include_decomposition: bool) -> SubgraphAnalysis {
        let (local, grid, global) = if include_decomposition {
            (
                self.loc_domain_dims.clone(),
                self.p_grid.clone(),
                self.global_dims.clone(),
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };
        SubgraphAnalysis {
            id: self.id,
            io_bound: self.io_bound.clone(),
            intensity: self.intensity.clone(),
            array_accesses: self.phis.clone(),
            variables: self.variables.clone(),
            inner_tile: self.inner_tile.clone(),
            outer_tile: self.outer_tile.clone(),
            local_domain_dims: local,
            processor_grid: grid,
            global_dims: global,
        }
    }
}

/// What [`analyze`] produces
#[derive(Clone, Debug)]
pub struct EngineOutput {
    pub io_bound: SymExpr,
    pub subgraphs: Vec<Subgraph>,
    pub failures: Vec<RegionFailure>,
}

// ============================================================================
// Kernel merging
// ============================================================================

/// Groups of fused regions, ordered by the execution position of their
/// first member; members keep execution order.
///
/// Regions fuse when an edge joins them and their loop nests agree in both
/// names and extents.
fn fuse_regions(graph: &KernelGraph, order: &[RegionId]) -> Vec<Vec<RegionId>> {
    let mut sets = UnionFind::new(graph.len());
    for (from, to, _) in graph.edges() {
        if let (Some(a), Some(b)) = (graph.region(from), graph.region(to)) {
            if a.loops == b.loops {
                sets.union(from, to);
            }
        }
    }

    let mut groups: Vec<Vec<RegionId>> = Vec::new();
    let mut slot_of_root: BTreeMap<usize, usize> = BTreeMap::new();
    for &id in order {
        let root = sets.find_mut(id);
        match slot_of_root.get(&root) {
            Some(&slot) => groups[slot].push(id),
            None => {
                slot_of_root.insert(root, groups.len());
                groups.push(vec![id]);
            }
        }
    }
    groups
}

/// The sub-problem of one fused group.
///
/// Arrays produced and consumed inside the group never leave fast memory and
/// are left out of the footprint.
fn build_sub_problem(graph: &KernelGraph, group: &[RegionId], id: usize) -> SubProblem {
    let members: Vec<&Region> = group.iter().filter_map(|&r| graph.region(r)).collect();
    let lead = members[0];
    let variables = lead.variables();

    let internal: BTreeSet<&str> = graph
        .edges()
        .filter(|(from, to, _)| group.contains(from) && group.contains(to))
        .map(|(_, _, edge)| edge.array.as_str())
        .collect();

    let mut arrays: BTreeMap<String, (BTreeSet<usize>, bool)> = BTreeMap::new();
    for region in &members {
        for (refs, output) in [(&region.reads, false), (&region.writes, true)] {
            for array_ref in refs {
                if internal.contains(array_ref.array.as_str()) {
                    continue;
                }
                let entry = arrays.entry(array_ref.array.clone()).or_default();
                entry.1 |= output;
                for iterator in array_ref.access.iterators() {
                    if let Some(position) = variables.iter().position(|v| v == iterator) {
                        entry.0.insert(position);
                    }
                }
            }
        }
    }

    let name = members
        .iter()
        .map(|r| r.name.as_str())
        .collect::<Vec<_>>()
        .join("+");

    SubProblem {
        name: format!("{}#{}", name, id),
        extents: lead.extents(),
        variables,
        arrays: arrays
            .into_iter()
            .map(|(name, (dims, output))| ProblemArray {
                name,
                dims: dims.into_iter().collect(),
                output,
            })
            .collect(),
        ops_per_iter: members.iter().map(|r| r.ops_per_iter).sum(),
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Derive the I/O bound of every maximal region of `graph`.
///
/// The session must already be started; it is left open.
///
/// # Returns
/// * `Ok(EngineOutput)` - global bound, solved subgraphs, per-subgraph failures
/// * `Err(SoapError)` - precondition failure or a session-level solver error
pub fn analyze(graph: &KernelGraph, params: &SoapParams, solver: &mut Solver) -> Result<EngineOutput, SoapError> {
    let precondition = |source| SoapError::PreconditionFailure {
        graph: graph.name.clone(),
        source,
    };
    graph.check_connected().map_err(precondition)?;
    let order = graph.topological_order().map_err(precondition)?;

    let groups = fuse_regions(graph, &order);
    info!(
        "Analysing '{}': {} region(s) in {} subgraph(s)",
        graph.name,
        graph.len(),
        groups.len()
    );
    debug!("Parameters: {:?}", params.param_values);

    let mut subgraphs = Vec::new();
    let mut failures = Vec::new();
    for (id, group) in groups.iter().enumerate() {
        let problem = build_sub_problem(graph, group, id);
        let region_names: Vec<String> = group
            .iter()
            .filter_map(|&r| graph.region(r))
            .map(|r| r.name.clone())
            .collect();
        debug!("Subgraph {} ({}): signature {}", id, problem.name, problem.signature());

        let solution = match solver.solve(&problem) {
            Ok(solution) => solution,
            Err(error) if error.is_session_fatal() => return Err(error.into()),
            Err(error) => {
                warn!("Subgraph {} ({}) not solved: {}", id, problem.name, error);
                failures.push(RegionFailure {
                    subgraph: id,
                    regions: region_names,
                    error,
                });
                continue;
            }
        };
        debug!("Subgraph {}: Q = {}, rho = {}", id, solution.io_bound, solution.intensity);

        let mut phis = ArrayAccesses::new();
        for &r in group {
            if let Some(region) = graph.region(r) {
                phis.extend(&region.accesses());
            }
        }

        subgraphs.push(Subgraph {
            id,
            regions: region_names,
            variables: problem.variables,
            extents: problem.extents,
            phis,
            io_bound: solution.io_bound,
            intensity: solution.intensity,
            inner_tile: solution.inner_tile,
            outer_tile: solution.outer_tile,
            loc_domain_dims: Vec::new(),
            p_grid: Vec::new(),
            global_dims: Vec::new(),
        });
    }

    let io_bound = SymExpr::add(subgraphs.iter().map(|s| s.io_bound.clone()));
    info!(
        "'{}': Q = {} ({} solved, {} failed)",
        graph.name,
        io_bound,
        subgraphs.len(),
        failures.len()
    );
    Ok(EngineOutput {
        io_bound,
        subgraphs,
        failures,
    })
}

// ============================================================================
// Decomposition
// ============================================================================

/// Prime factors of `n`, largest first.
fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors.reverse();
    factors
}

/// Every block of a `grid`-way split of `extent` is non-empty.
fn splits_evenly_enough(extent: i64, grid: i64) -> bool {
    grid <= extent && (grid - 1) * Integer::div_ceil(&extent, &grid) < extent
}

/// Choose `p_grid`, `loc_domain_dims` and `global_dims` for `subgraph`.
///
/// Prime factors of the rank count are handed out one at a time, largest
/// first. [`DecompositionStrategy::FollowTiling`] gives each factor to the
/// dimension furthest below its ideal rank count `N_v / outer_v`;
/// [`DecompositionStrategy::LargestDimension`] gives it to the dimension with
/// the largest local extent. A factor no dimension can absorb is dropped, so
/// the grid may use fewer ranks than requested.
///
/// Extents that do not evaluate to integers under `params` leave the subgraph
/// undivided with symbolic sizes.
pub fn init_decomposition(
    subgraph: &mut Subgraph,
    decomposition: &DecompositionParams,
    params: &SoapParams,
) -> Result<(), SoapError> {
    let mut bindings: Bindings = params.substitutions();
    bindings.insert(
        crate::bound::RANK_COUNT_SYMBOL.to_string(),
        SymExpr::num(decomposition.ranks as i64),
    );

    let global_exprs: Vec<SymExpr> = subgraph.extents.iter().map(|e| e.substitute(&bindings)).collect();
    let global: Vec<i64> = match global_exprs.iter().map(|e| e.eval_int()).collect() {
        Ok(values) => values,
        Err(error) => {
            warn!(
                "Subgraph {}: extents are not numeric ({}), leaving it undecomposed",
                subgraph.id, error
            );
            subgraph.global_dims = global_exprs.clone();
            subgraph.loc_domain_dims = global_exprs;
            subgraph.p_grid = vec![SymExpr::num(1); subgraph.variables.len()];
            return Ok(());
        }
    };
    for (value, variable) in global.iter().zip(&subgraph.variables) {
        if *value <= 0 {
            return Err(DecompositionError::NonPositive {
                subgraph: subgraph.id,
                field: format!("global_dims[{}]", variable),
                value: *value,
            }
            .into());
        }
    }

    let ideal: Option<Vec<f64>> = match decomposition.strategy {
        DecompositionStrategy::FollowTiling => subgraph
            .outer_tile
            .iter()
            .zip(&global)
            .map(|(tile, &extent)| {
                let tile = tile.substitute(&bindings).eval_f64().ok()?;
                (tile > 0.0).then(|| extent as f64 / tile)
            })
            .collect(),
        DecompositionStrategy::LargestDimension => None,
    };
    if decomposition.strategy == DecompositionStrategy::FollowTiling && ideal.is_none() {
        debug!(
            "Subgraph {}: outer tile is not numeric, splitting largest dimensions",
            subgraph.id
        );
    }

    let mut grid = vec![1i64; global.len()];
    for factor in prime_factors(decomposition.ranks.max(1)) {
        let factor = factor as i64;
        let candidates = (0..global.len()).filter(|&d| splits_evenly_enough(global[d], grid[d] * factor));
        let chosen = match &ideal {
            Some(ideal) => candidates.max_by(|&a, &b| {
                let (sa, sb) = (ideal[a] / grid[a] as f64, ideal[b] / grid[b] as f64);
                sa.total_cmp(&sb).then(b.cmp(&a))
            }),
            None => candidates.max_by(|&a, &b| {
                let (la, lb) = (
                    Integer::div_ceil(&global[a], &grid[a]),
                    Integer::div_ceil(&global[b], &grid[b]),
                );
                la.cmp(&lb).then(b.cmp(&a))
            }),
        };
        match chosen {
            Some(d) => grid[d] *= factor,
            None => debug!(
                "Subgraph {}: no dimension can absorb a factor of {}, dropping it",
                subgraph.id, factor
            ),
        }
    }

    let total: i64 = grid.iter().product();
    if total < decomposition.ranks as i64 {
        warn!(
            "Subgraph {} uses {} of {} rank(s)",
            subgraph.id, total, decomposition.ranks
        );
    }

    subgraph.loc_domain_dims = global
        .iter()
        .zip(&grid)
        .map(|(extent, g)| SymExpr::num(Integer::div_ceil(extent, g)))
        .collect();
    subgraph.p_grid = grid.into_iter().map(SymExpr::num).collect();
    subgraph.global_dims = global.into_iter().map(SymExpr::num).collect();
    debug!(
        "Subgraph {}: grid {:?}, local {:?}",
        subgraph.id,
        subgraph.p_grid.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        subgraph.loc_domain_dims.iter().map(|e| e.to_string()).collect::<Vec<_>>()
    );
    Ok(())
}
