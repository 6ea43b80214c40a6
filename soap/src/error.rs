//! Top-level error type of the analysis
//!
//! Each concern has its own error enum; `SoapError` is what the engine and
//! the orchestrators return. Disconnected or otherwise malformed kernel graphs
//! surface as [`SoapError::PreconditionFailure`] and abort the call before the
//! optimizer is consulted.

use crate::analysis::DecompositionError;
use crate::config::ConfigError;
use crate::einsum::EinsumError;
use crate::expr::ExprError;
use crate::sdg::GraphError;
use crate::solver::SolverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SoapError {
    /// The kernel graph cannot be analysed as one computation
    #[error("precondition failed for kernel graph '{graph}': {source}")]
    PreconditionFailure {
        graph: String,
        #[source]
        source: GraphError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("optimizer session: {0}")]
    Solver(#[from] SolverError),

    #[error("decomposition: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Einsum(#[from] EinsumError),

    #[error("symbolic evaluation: {0}")]
    Expr(#[from] ExprError),
}

pub type Result<T> = std::result::Result<T, SoapError>;
