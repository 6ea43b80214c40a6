use soap::analysis::IterRange;
use soap::bound::LocalBackend;
use soap::config::SoapParams;
use soap::error::SoapError;
use soap::expr::SymExpr;
use soap::pipeline::SoapPipeline;
use soap::sdg::{KernelGraph, Region};
use soap::solver::{CachingMode, Solution, SolverBackend, SolverError, SubProblem};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Local backend that counts what the session does with it
struct CountingBackend {
    calls: AtomicUsize,
    shutdowns: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingBackend {
    fn new() -> Arc<Self> {
        Self::slow(None)
    }

    fn slow(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl SolverBackend for CountingBackend {
    fn name(&self) -> &str {
        "counting"
    }

    fn solve(&self, problem: &SubProblem) -> Result<Solution, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        LocalBackend::derive(problem)
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn params() -> SoapParams {
    let mut params = SoapParams::default();
    params.solver.timeout_secs = 0;
    params
}

fn copy_region(name: &str, from: &str, to: &str) -> Region {
    Region::new(name)
        .with_loop("i", SymExpr::sym("N"))
        .read(from, "i")
        .unwrap()
        .write(to, "i")
        .unwrap()
}

#[test]
fn test_disconnected_graph_fails_before_any_solve() {
    let mut graph = KernelGraph::new("islands");
    graph.add_region(copy_region("left", "A", "B")).unwrap();
    graph.add_region(copy_region("right", "C", "D")).unwrap();

    let backend = CountingBackend::new();
    let pipeline = SoapPipeline::new(params()).with_backend(backend.clone());
    let err = pipeline.analyze_graph(graph, None, None).unwrap_err();

    match err {
        SoapError::PreconditionFailure { graph, .. } => assert_eq!(graph, "islands"),
        other => panic!("expected PreconditionFailure, got {:?}", other),
    }
    assert_eq!(backend.calls(), 0, "no solver call before the connectivity check");
    assert_eq!(backend.shutdowns(), 1, "owned session released on failure");
}

#[test]
fn test_einsum_end_to_end() {
    let mut params = params();
    params.decomposition.ranks = 4;
    for symbol in ["Ni", "Nj", "Nk"] {
        params.param_values.insert(symbol.to_string(), 8);
    }
    let backend = CountingBackend::new();
    let pipeline = SoapPipeline::new(params).with_backend(backend.clone());

    let analysis = pipeline.analyze_einsum("ik,kj->ij", None, None).unwrap();
    assert_eq!(backend.shutdowns(), 1, "owned session released before returning");
    assert_eq!(analysis.io_bound.to_string(), "2*Ni*Nj*Nk/sqrt(S)");

    let sg = analysis.subgraph(0).unwrap();
    assert_eq!(sg.intensity.to_string(), "sqrt(S)/2");
    assert_eq!(sg.variables, vec!["i", "j", "k"]);
    assert_eq!(sg.processor_grid, vec![SymExpr::num(2), SymExpr::num(2), SymExpr::num(1)]);
    assert_eq!(sg.local_domain_dims, vec![SymExpr::num(4), SymExpr::num(4), SymExpr::num(8)]);
    assert_eq!(sg.global_dims, vec![SymExpr::num(8); 3]);

    let rank3 = sg.distribute_for_rank(3).unwrap();
    assert_eq!(rank3["out"]["i"], IterRange::new(4, 8));
    assert_eq!(rank3["out"]["j"], IterRange::new(4, 8));
    assert_eq!(rank3["inp0"]["k"], IterRange::new(0, 8));
    assert!(sg.distribute_for_rank(4).unwrap().is_empty());
}

#[test]
fn test_graph_bound_sums_subgraphs() {
    let mut graph = KernelGraph::new("pipeline");
    graph.add_region(copy_region("scale", "A", "B")).unwrap();
    let transpose = Region::new("outer")
        .with_loop("i", SymExpr::sym("N"))
        .with_loop("j", SymExpr::sym("N"))
        .read("B", "i")
        .unwrap()
        .read("B2", "j")
        .unwrap()
        .write("C", "i*j")
        .unwrap();
    graph.add_region(transpose).unwrap();
    graph.connect_by_dataflow();

    let analysis = SoapPipeline::new(params()).analyze_graph(graph, None, None).unwrap();
    assert_eq!(analysis.subgraphs.len(), 2);
    assert!(analysis.is_complete());
    assert!(analysis.subgraphs.iter().all(|s| !s.is_decomposed()));
    let sum = SymExpr::add(analysis.subgraphs.iter().map(|s| s.io_bound.clone()));
    assert_eq!(analysis.io_bound, sum);
}

#[test]
fn test_cached_only_miss_is_scoped_to_the_subgraph() {
    let mut params = params();
    params.solver.caching = CachingMode::CachedOnly;
    let backend = CountingBackend::new();
    let pipeline = SoapPipeline::new(params).with_backend(backend.clone());

    let analysis = pipeline.analyze_einsum("ij,jk->ik", Some(false), None).unwrap();
    assert_eq!(backend.calls(), 0);
    assert!(analysis.subgraphs.is_empty());
    assert_eq!(analysis.failed_regions.len(), 1);
    assert!(matches!(
        analysis.failed_regions[0].error,
        SolverError::LookupFailure { .. }
    ));
    assert_eq!(analysis.io_bound, SymExpr::num(0));
}

#[test]
fn test_cache_serves_structurally_equal_kernels() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join("solutions.json");

    let mut writer_params = params();
    writer_params.solver.caching = CachingMode::Caching;
    writer_params.solver.cache_path = Some(cache.clone());
    let writer = CountingBackend::new();
    SoapPipeline::new(writer_params)
        .with_backend(writer.clone())
        .analyze_einsum("ik,kj->ij", Some(false), None)
        .unwrap();
    assert_eq!(writer.calls(), 1);
    assert!(cache.exists(), "solutions persisted when the session closed");

    let mut reader_params = params();
    reader_params.solver.caching = CachingMode::CachedOnly;
    reader_params.solver.cache_path = Some(cache);
    let reader = CountingBackend::new();
    let analysis = SoapPipeline::new(reader_params)
        .with_backend(reader.clone())
        .analyze_einsum("ab,bc->ac", Some(false), None)
        .unwrap();
    assert_eq!(reader.calls(), 0);
    assert_eq!(analysis.io_bound.to_string(), "2*Na*Nb*Nc/sqrt(S)");
}

#[test]
fn test_timeout_is_scoped_to_the_subgraph() {
    let mut params = params();
    params.solver.timeout_secs = 1;
    let backend = CountingBackend::slow(Some(Duration::from_millis(2500)));
    let pipeline = SoapPipeline::new(params).with_backend(backend.clone());

    let analysis = pipeline.analyze_einsum("ij,jk->ik", Some(false), None).unwrap();
    assert_eq!(analysis.failed_regions.len(), 1);
    assert!(matches!(
        analysis.failed_regions[0].error,
        SolverError::Timeout { seconds: 1, .. }
    ));
    assert_eq!(backend.shutdowns(), 1);
}

#[test]
fn test_analysis_serializes_to_json() {
    let analysis = SoapPipeline::new(params())
        .analyze_einsum("ij,jk->ik", Some(false), None)
        .unwrap();
    let value = serde_json::to_value(&analysis).unwrap();
    assert_eq!(value["io_bound"], "2*Ni*Nj*Nk/sqrt(S)");
    assert_eq!(value["subgraphs"][0]["array_accesses"]["inp0"]["i*j"], "i*j");
}
