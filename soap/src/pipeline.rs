//! SOAP Analysis Pipeline
//!
//! End-to-end entry points of the I/O lower-bound analysis:
//!
//! kernel source -> kernel graph -> connectivity check -> engine -> snapshot -> (decomposition)
//!
//! # Pipeline Stages
//!
//! ## Stage 1: Session
//! - If the caller does not pass a [`Solver`], one is built from
//!   [`SoapParams::solver`], started, and time-limited. This session belongs
//!   to the call and is released on every exit path.
//!
//! ## Stage 2: Kernel graph
//! - **Graph source**: used as given
//! - **Einsum source**: generated by [`einsum_graph`]
//! - Both must form one weakly-connected component
//!
//! ## Stage 3: Engine
//! - [`engine::analyze`] solves every subgraph and composes the global bound
//!
//! ## Stage 4: Release
//! - The owned session is closed before any result is assembled
//!
//! ## Stage 5: Snapshot and decomposition
//! - Every subgraph is frozen into a [`SubgraphAnalysis`]; with schedule
//!   generation on, [`engine::init_decomposition`] runs first and its fields
//!   are copied over
//!
//! # Schedule defaults
//!
//! The two named entry points keep different defaults for schedule
//! generation: [`GRAPH_SCHEDULE_DEFAULT`] and [`EINSUM_SCHEDULE_DEFAULT`].
//! Pass `Some(flag)` to override.
//!
//! # Usage Examples
//!
//! ## Einsum
//! ```rust
//! use soap::config::SoapParams;
//! use soap::pipeline::SoapPipeline;
//!
//! let mut params = SoapParams::default();
//! params.solver.timeout_secs = 0;
//! params.decomposition.ranks = 4;
//! for n in ["Ni", "Nj", "Nk"] {
//!     params.param_values.insert(n.to_string(), 8);
//! }
//!
//! let pipeline = SoapPipeline::new(params);
//! let analysis = pipeline.analyze_einsum("ik,kj->ij", None, None)?;
//! assert_eq!(analysis.io_bound.to_string(), "2*Ni*Nj*Nk/sqrt(S)");
//!
//! let rank0 = analysis.subgraphs[0].distribute_for_rank(0)?;
//! println!("{:?}", rank0["out"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Shared session
//! ```rust
//! use soap::config::SoapParams;
//! use soap::pipeline::SoapPipeline;
//! use soap::solver::{SessionGuard, SolverConfig};
//!
//! let pipeline = SoapPipeline::new(SoapParams::default());
//! let mut session = SessionGuard::open(&SolverConfig::default())?;
//! let first = pipeline.analyze_einsum("ij,jk->ik", Some(false), Some(&mut *session))?;
//! let second = pipeline.analyze_einsum("ij,jk,kl->il", Some(false), Some(&mut *session))?;
//! assert!(session.is_active(), "a caller-supplied session stays open");
//! session.close()?;
//! # let _ = (first, second);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::analysis::{Analysis, SubgraphAnalysis};
use crate::config::{parse_params, SoapParams};
use crate::einsum::einsum_graph;
use crate::engine::{self, EngineOutput};
use crate::error::SoapError;
use crate::sdg::KernelGraph;
use crate::solver::{SessionGuard, Solver, SolverBackend};

/// Schedule generation default of [`SoapPipeline::analyze_graph`]
pub const GRAPH_SCHEDULE_DEFAULT: bool = false;

/// Schedule generation default of [`SoapPipeline::analyze_einsum`]
pub const EINSUM_SCHEDULE_DEFAULT: bool = true;

/// What an analysis starts from
#[derive(Clone, Debug)]
pub enum KernelSource {
    /// A kernel graph built by a frontend
    Graph(KernelGraph),
    /// A tensor contraction such as `"ij,jk->ik"`
    Einsum(String),
}

impl KernelSource {
    /// Schedule generation default for this kind of source.
    pub fn default_schedule(&self) -> bool {
        match self {
            KernelSource::Graph(_) => GRAPH_SCHEDULE_DEFAULT,
            KernelSource::Einsum(_) => EINSUM_SCHEDULE_DEFAULT,
        }
    }

    fn into_graph(self) -> Result<KernelGraph, SoapError> {
        match self {
            KernelSource::Graph(graph) => Ok(graph),
            KernelSource::Einsum(expr) => Ok(einsum_graph(&expr)?),
        }
    }
}

impl fmt::Display for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSource::Graph(graph) => write!(f, "graph '{}'", graph.name),
            KernelSource::Einsum(expr) => write!(f, "einsum '{}'", expr),
        }
    }
}

/// The analysis orchestrator
pub struct SoapPipeline {
    params: SoapParams,
    backend: Option<Arc<dyn SolverBackend>>,
}

impl SoapPipeline {
    pub fn new(params: SoapParams) -> Self {
        SoapPipeline {
            params,
            backend: None,
        }
    }

    /// Parameters from `SOAP_CONFIG` and the `SOAP_*` environment.
    pub fn from_env() -> Result<Self, SoapError> {
        Ok(SoapPipeline::new(parse_params()?))
    }

    /// Solve with `backend` in the sessions this pipeline opens itself.
    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn params(&self) -> &SoapParams {
        &self.params
    }

    /// Analyse a pre-built kernel graph.
    ///
    /// # Arguments
    /// * `graph` - Kernel graph, must be weakly connected
    /// * `generate_schedule` - Decompose every subgraph (default [`GRAPH_SCHEDULE_DEFAULT`])
    /// * `session` - Caller-owned session; `None` opens and releases one
    pub fn analyze_graph(
        &self,
        graph: KernelGraph,
        generate_schedule: Option<bool>,
        session: Option<&mut Solver>,
    ) -> Result<Analysis, SoapError> {
        self.analyze_source(KernelSource::Graph(graph), generate_schedule, session)
    }

    /// Analyse a tensor contraction.
    ///
    /// # Arguments
    /// * `expr` - Einsum expression, e.g. `"ij,jk->ik"`
    /// * `generate_schedule` - Decompose every subgraph (default [`EINSUM_SCHEDULE_DEFAULT`])
    /// * `session` - Caller-owned session; `None` opens and releases one
    pub fn analyze_einsum(
        &self,
        expr: &str,
        generate_schedule: Option<bool>,
        session: Option<&mut Solver>,
    ) -> Result<Analysis, SoapError> {
        self.analyze_source(KernelSource::Einsum(expr.to_string()), generate_schedule, session)
    }

    /// Analyse any kernel source.
    ///
    /// # Returns
    /// * `Ok(Analysis)` - the result tree; the owned session, if any, is closed
    /// * `Err(SoapError)` - no partial result is returned
    pub fn analyze_source(
        &self,
        source: KernelSource,
        generate_schedule: Option<bool>,
        session: Option<&mut Solver>,
    ) -> Result<Analysis, SoapError> {
        let generate_schedule = generate_schedule.unwrap_or_else(|| source.default_schedule());
        // Einsum results always carry the decomposition fields; they are
        // empty unless a decomposition ran.
        let copy_decomposition = generate_schedule || matches!(source, KernelSource::Einsum(_));
        info!("Analysing {} (schedule: {})", source, generate_schedule);

        let (graph, output) = match session {
            Some(solver) => Self::run_engine(source, &self.params, solver)?,
            None => {
                let mut guard = self.open_session()?;
                let result = Self::run_engine(source, &self.params, &mut guard);
                let closed = guard.close();
                let output = result?;
                closed?;
                output
            }
        };

        let mut subgraphs: Vec<SubgraphAnalysis> = Vec::with_capacity(output.subgraphs.len());
        for mut subgraph in output.subgraphs {
            if generate_schedule {
                engine::init_decomposition(&mut subgraph, &self.params.decomposition, &self.params)?;
            }
            subgraphs.push(subgraph.snapshot(copy_decomposition));
        }

        Ok(Analysis {
            name: graph.name.clone(),
            io_bound: output.io_bound,
            graph,
            subgraphs,
            failed_regions: output.failures,
        })
    }

    fn open_session(&self) -> Result<SessionGuard, SoapError> {
        let config = self.params.solver.clone();
        let solver = match &self.backend {
            Some(backend) => Solver::with_backend(config, Arc::clone(backend)),
            None => Solver::new(config),
        };
        debug!("Opening an optimizer session for this analysis");
        Ok(SessionGuard::start(solver)?)
    }

    fn run_engine(
        source: KernelSource,
        params: &SoapParams,
        solver: &mut Solver,
    ) -> Result<(KernelGraph, EngineOutput), SoapError> {
        let graph = source.into_graph()?;
        let output = engine::analyze(&graph, params, solver)?;
        Ok((graph, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::SymExpr;
    use crate::sdg::Region;
    use crate::solver::SolverConfig;

    fn params() -> SoapParams {
        let mut params = SoapParams::default();
        params.solver.timeout_secs = 0;
        params
    }

    #[test]
    fn test_schedule_defaults() {
        assert!(!KernelSource::Graph(KernelGraph::new("g")).default_schedule());
        assert!(KernelSource::Einsum("ij,jk->ik".to_string()).default_schedule());
    }

    #[test]
    fn test_graph_path_gates_decomposition() {
        let mut graph = KernelGraph::new("copy");
        let region = Region::new("copy")
            .with_loop("i", SymExpr::num(16))
            .read("A", "i")
            .unwrap()
            .write("B", "i")
            .unwrap();
        graph.add_region(region).unwrap();

        let pipeline = SoapPipeline::new(params());
        let plain = pipeline.analyze_graph(graph.clone(), None, None).unwrap();
        assert!(!plain.subgraphs[0].is_decomposed());

        let scheduled = pipeline.analyze_graph(graph, Some(true), None).unwrap();
        assert!(scheduled.subgraphs[0].is_decomposed());
        assert_eq!(scheduled.subgraphs[0].global_dims, vec![SymExpr::num(16)]);
    }

    #[test]
    fn test_einsum_without_schedule_has_empty_fields() {
        let pipeline = SoapPipeline::new(params());
        let analysis = pipeline.analyze_einsum("ij,jk->ik", Some(false), None).unwrap();
        assert!(analysis.subgraphs[0].processor_grid.is_empty());
        assert_eq!(analysis.name, "ij,jk->ik");
    }

    #[test]
    fn test_caller_session_is_left_open() {
        let pipeline = SoapPipeline::new(params());
        let mut solver = Solver::new(SolverConfig {
            timeout_secs: 0,
            ..SolverConfig::default()
        });
        solver.start(false).unwrap();
        pipeline.analyze_einsum("ij,jk->ik", Some(false), Some(&mut solver)).unwrap();
        assert!(solver.is_active());
        assert_eq!(solver.backend_calls(), 1);
    }

    #[test]
    fn test_malformed_einsum_is_reported() {
        let pipeline = SoapPipeline::new(params());
        let err = pipeline.analyze_einsum("ij,->", None, None).unwrap_err();
        assert!(matches!(err, SoapError::Einsum(_)));
    }
}
