//! SOAP CLI
//!
//! Runs the I/O lower-bound analysis on an einsum expression or on a kernel
//! graph stored as JSON, and prints the result tree as JSON.
//!
//! Parameters are read from `SOAP_CONFIG` / `SOAP_*` first; command-line
//! options override them.
//!
//! # Usage
//!
//! ## Einsum, decomposed over 8 ranks
//! ```bash
//! soap einsum "ik,kj->ij" \
//!   --ranks 8 \
//!   --param Ni=1024 --param Nj=1024 --param Nk=1024 --param S=65536 \
//!   --rank 3
//! ```
//!
//! ## Kernel graph, cached solutions only
//! ```bash
//! soap graph --input kernel.json \
//!   --caching cached-only \
//!   --cache-path soap-cache.json
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand};
use log::info;
use serde_json::{json, Map, Value};
use soap::analysis::Analysis;
use soap::config::{parse_assignment, parse_params, DecompositionStrategy, SoapParams};
use soap::pipeline::{KernelSource, SoapPipeline};
use soap::sdg::KernelGraph;
use soap::solver::CachingMode;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "soap")]
#[clap(about = "SOAP - symbolic I/O lower bounds, tilings and rank decompositions")]
#[clap(version = "0.1")]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse a tensor contraction such as "ij,jk->ik"
    ///
    /// Schedule generation is on by default.
    Einsum {
        /// Einsum expression
        #[clap(value_name = "EXPR")]
        expr: String,

        #[clap(flatten)]
        options: AnalysisOptions,
    },

    /// Analyse a kernel graph stored as JSON
    ///
    /// Schedule generation is off by default.
    Graph {
        /// Kernel graph file
        #[clap(long = "input", short = 'i', value_name = "FILE")]
        input: PathBuf,

        #[clap(flatten)]
        options: AnalysisOptions,
    },
}

#[derive(ClapArgs)]
struct AnalysisOptions {
    /// Solver caching mode (off, cached-only, caching)
    #[clap(long = "caching", value_name = "MODE")]
    caching: Option<CachingMode>,

    /// Solve with the remote backend
    #[clap(long = "remote")]
    remote: bool,

    /// Remote solver command line
    #[clap(long = "remote-command", value_name = "CMD")]
    remote_command: Option<String>,

    /// Solution cache file
    #[clap(long = "cache-path", value_name = "FILE")]
    cache_path: Option<PathBuf>,

    /// Timeout per solve call in seconds (0 = no timeout)
    #[clap(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Target number of ranks
    #[clap(long = "ranks", short = 'p', value_name = "NUM")]
    ranks: Option<usize>,

    /// Decomposition strategy (follow-tiling, largest-dimension)
    #[clap(long = "strategy", value_name = "STRATEGY")]
    strategy: Option<DecompositionStrategy>,

    /// Numeric value of a symbol, e.g. N=1024 (repeatable)
    #[clap(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, i64)>,

    /// Generate the parallel decomposition
    #[clap(long = "schedule", conflicts_with = "no_schedule")]
    schedule: bool,

    /// Skip the parallel decomposition
    #[clap(long = "no-schedule")]
    no_schedule: bool,

    /// Print the distribution of this rank for every subgraph
    #[clap(long = "rank", value_name = "RANK", conflicts_with = "all_ranks")]
    rank: Option<usize>,

    /// Print the distribution of every rank
    #[clap(long = "all-ranks")]
    all_ranks: bool,
}

fn parse_param(text: &str) -> Result<(String, i64), String> {
    parse_assignment(text).map_err(|e| e.to_string())
}

impl AnalysisOptions {
    fn apply(&self, params: &mut SoapParams) {
        if let Some(caching) = self.caching {
            params.solver.caching = caching;
        }
        if self.remote {
            params.solver.remote = true;
        }
        if let Some(command) = &self.remote_command {
            params.solver.remote_command = Some(command.clone());
        }
        if let Some(path) = &self.cache_path {
            params.solver.cache_path = Some(path.clone());
        }
        if let Some(timeout) = self.timeout {
            params.solver.timeout_secs = timeout;
        }
        if let Some(ranks) = self.ranks {
            params.decomposition.ranks = ranks;
        }
        if let Some(strategy) = self.strategy {
            params.decomposition.strategy = strategy;
        }
        for (name, value) in &self.params {
            params.param_values.insert(name.clone(), *value);
        }
    }

    fn schedule(&self) -> Option<bool> {
        match (self.schedule, self.no_schedule) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (source, options) = match args.command {
        Commands::Einsum { expr, options } => (KernelSource::Einsum(expr), options),
        Commands::Graph { input, options } => {
            info!("Loading kernel graph from {}", input.display());
            (KernelSource::Graph(KernelGraph::from_file(&input)?), options)
        }
    };

    let mut params = parse_params()?;
    options.apply(&mut params);
    let pipeline = SoapPipeline::new(params);

    let analysis = pipeline.analyze_source(source, options.schedule(), None)?;
    let report = render_report(&analysis, pipeline.params(), &options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// The analysis plus numeric bounds and the requested distributions.
fn render_report(
    analysis: &Analysis,
    params: &SoapParams,
    options: &AnalysisOptions,
) -> Result<Value, Box<dyn std::error::Error>> {
    let bindings = params.substitutions();
    let numeric = |expr: &soap::expr::SymExpr| {
        expr.substitute(&bindings)
            .eval_f64()
            .map(Value::from)
            .unwrap_or(Value::Null)
    };

    let mut evaluated = Map::new();
    evaluated.insert("io_bound".to_string(), numeric(&analysis.io_bound));
    for subgraph in &analysis.subgraphs {
        evaluated.insert(
            format!("subgraph_{}", subgraph.id),
            json!({
                "io_bound": numeric(&subgraph.io_bound),
                "intensity": numeric(&subgraph.intensity),
            }),
        );
    }

    let mut distributions = Map::new();
    for subgraph in analysis.subgraphs.iter().filter(|s| s.is_decomposed()) {
        let value = if let Some(rank) = options.rank {
            serde_json::to_value(subgraph.distribute_for_rank(rank)?)?
        } else if options.all_ranks {
            serde_json::to_value(subgraph.distribute_all_ranks()?)?
        } else {
            continue;
        };
        distributions.insert(format!("subgraph_{}", subgraph.id), value);
    }

    Ok(json!({
        "analysis": analysis,
        "evaluated": evaluated,
        "distributions": distributions,
    }))
}
