//! SOAP: Symbolic I/O Lower Bounds for Array Programs
//!
//! This library computes, for a dataflow kernel:
//! 1. A symbolic lower bound on data movement (Q) for a fast memory of size `S`
//! 2. The tiling that attains it and the resulting computational intensity (rho)
//! 3. Optionally, a decomposition of the iteration space over a grid of ranks
//!
//! # Core Pipeline Flow
//! ```text
//! einsum / kernel graph -> connectivity check -> subgraphs -> optimizer session
//!                                                                   |
//!        per-rank ranges <- decomposition <- Analysis snapshot <- Q, rho, tiles
//! ```
//!
//! # Module Organization
//!
//! ## Symbolic Core
//! - [`rational`]: Exact fractions for exponents and coefficients
//! - [`expr`]: Symbolic expressions with deferred, exact evaluation
//! - [`access`]: Compound access terms, parsed once
//!
//! ## Kernel Representation
//! - [`sdg`]: Symbolic kernel graph and its structural checks
//! - [`einsum`]: Einsum expression to kernel graph
//!
//! ## Solving
//! - [`solver`]: Optimizer session (caching, timeout, scoped release, backends)
//! - [`bound`]: Built-in bound derivation
//! - [`engine`]: Per-subgraph analysis and decomposition setup
//!
//! ## Results and Orchestration
//! - [`analysis`]: Result snapshots and `distribute_for_rank`
//! - [`pipeline`]: Graph and einsum entry points
//! - [`config`]: Parameters and their sources
//! - [`error`]: Top-level error type

// ============================================================================
// Symbolic Core
// ============================================================================

pub mod access;
pub mod expr;
pub mod rational;

// ============================================================================
// Kernel Representation
// ============================================================================

pub mod einsum;
pub mod sdg;

// ============================================================================
// Solving
// ============================================================================

pub mod bound;
pub mod engine;
pub mod solver;

// ============================================================================
// Results and Orchestration
// ============================================================================

pub mod analysis;
pub mod config;
pub mod error;
pub mod pipeline;

pub use access::{AccessTerm, ArrayAccesses};
pub use analysis::{
    Analysis, DecompositionError, IterRange, RankDistribution, RegionFailure, SubgraphAnalysis,
};
pub use bound::{LocalBackend, CACHE_SIZE_SYMBOL, RANK_COUNT_SYMBOL};
pub use config::{parse_params, DecompositionParams, DecompositionStrategy, SoapParams};
pub use einsum::einsum_graph;
pub use engine::{analyze, init_decomposition, Subgraph};
pub use error::SoapError;
pub use expr::{ExprError, SymExpr};
pub use pipeline::{KernelSource, SoapPipeline, EINSUM_SCHEDULE_DEFAULT, GRAPH_SCHEDULE_DEFAULT};
pub use rational::Rational;
pub use sdg::{GraphError, KernelGraph, Region};
pub use solver::{
    CachingMode, RemoteBackend, SessionGuard, Solution, Solver, SolverBackend, SolverConfig,
    SolverError, SubProblem,
};
