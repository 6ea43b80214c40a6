//! Analysis parameters
//!
//! [`SoapParams`] bundles everything an analysis needs besides its input:
//! optimizer session settings, decomposition settings, and the numeric values
//! substituted for problem-size and cache-size symbols.
//!
//! # Sources
//!
//! [`parse_params`] layers, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. The JSON file named by `SOAP_CONFIG`
//! 3. Individual environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `SOAP_CACHING` | `solver.caching` (`off`, `cached-only`, `caching`) |
//! | `SOAP_REMOTE` | `solver.remote` |
//! | `SOAP_REMOTE_COMMAND` | `solver.remote_command` |
//! | `SOAP_CACHE_PATH` | `solver.cache_path` |
//! | `SOAP_TIMEOUT` | `solver.timeout_secs` |
//! | `SOAP_RANKS` | `decomposition.ranks` |
//! | `SOAP_STRATEGY` | `decomposition.strategy` |
//! | `SOAP_PARAMS` | `param_values`, as `N=1024,S=65536` |
//!
//! # Example
//!
//! ```json
//! {
//!   "solver": { "caching": "caching", "cache_path": "soap-cache.json" },
//!   "decomposition": { "ranks": 8, "strategy": "follow-tiling" },
//!   "param_values": { "N": 1024, "S": 65536 }
//! }
//! ```

use crate::bound::RANK_COUNT_SYMBOL;
use crate::expr::{Bindings, SymExpr};
use crate::solver::{CachingMode, SolverConfig};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

lazy_static! {
    static ref ASSIGNMENT: Regex =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(-?[0-9]+)\s*$").unwrap();
}

/// Environment variable naming the JSON configuration file
pub const CONFIG_ENV: &str = "SOAP_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("expected NAME=INTEGER, got '{0}'")]
    Assignment(String),
}

/// How `init_decomposition` spreads ranks over dimensions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecompositionStrategy {
    /// Follow the outer tile found by the bound derivation
    #[default]
    FollowTiling,
    /// Always split the dimension with the largest local extent
    LargestDimension,
}

impl FromStr for DecompositionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "follow-tiling" | "follow_tiling" | "tiling" => Ok(DecompositionStrategy::FollowTiling),
            "largest-dimension" | "largest_dimension" | "largest" => {
                Ok(DecompositionStrategy::LargestDimension)
            }
            other => Err(format!(
                "unknown decomposition strategy '{}' (expected follow-tiling or largest-dimension)",
                other
            )),
        }
    }
}

/// Parallel decomposition settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionParams {
    /// Target number of ranks
    pub ranks: usize,
    pub strategy: DecompositionStrategy,
}

impl Default for DecompositionParams {
    fn default() -> Self {
        DecompositionParams {
            ranks: 1,
            strategy: DecompositionStrategy::FollowTiling,
        }
    }
}

/// Everything configurable about an analysis
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapParams {
    pub solver: SolverConfig,
    pub decomposition: DecompositionParams,
    /// Numeric values of problem-size and cache-size symbols
    pub param_values: BTreeMap<String, i64>,
}

impl SoapParams {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `SOAP_*` values on top of `self`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SOAP_CACHING") {
            self.solver.caching = parse_field("SOAP_CACHING", &value, CachingMode::from_str)?;
        }
        if let Some(value) = lookup("SOAP_REMOTE") {
            self.solver.remote = parse_flag("SOAP_REMOTE", &value)?;
        }
        if let Some(value) = lookup("SOAP_REMOTE_COMMAND") {
            self.solver.remote_command = Some(value);
        }
        if let Some(value) = lookup("SOAP_CACHE_PATH") {
            self.solver.cache_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("SOAP_TIMEOUT") {
            self.solver.timeout_secs = parse_field("SOAP_TIMEOUT", &value, |v| {
                v.trim().parse::<u64>().map_err(|e| e.to_string())
            })?;
        }
        if let Some(value) = lookup("SOAP_RANKS") {
            self.decomposition.ranks = parse_field("SOAP_RANKS", &value, |v| {
                v.trim().parse::<usize>().map_err(|e| e.to_string())
            })?;
        }
        if let Some(value) = lookup("SOAP_STRATEGY") {
            self.decomposition.strategy =
                parse_field("SOAP_STRATEGY", &value, DecompositionStrategy::from_str)?;
        }
        if let Some(value) = lookup("SOAP_PARAMS") {
            for assignment in value.split(',').filter(|a| !a.trim().is_empty()) {
                let (name, number) = parse_assignment(assignment)?;
                self.param_values.insert(name, number);
            }
        }
        Ok(())
    }

    /// Symbolic bindings for every numeric parameter, plus the rank count
    /// when it is not set explicitly.
    pub fn substitutions(&self) -> Bindings {
        let mut bindings: Bindings = self
            .param_values
            .iter()
            .map(|(name, value)| (name.clone(), SymExpr::num(*value)))
            .collect();
        bindings
            .entry(RANK_COUNT_SYMBOL.to_string())
            .or_insert_with(|| SymExpr::num(self.decomposition.ranks as i64));
        bindings
    }
}

fn parse_field<T, F>(key: &str, value: &str, parse: F) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<T, String>,
{
    parse(value).map_err(|reason| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_field(key, value, |v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err("expected a boolean".to_string()),
    })
}

/// Parse `NAME=VALUE` with an integer value.
pub fn parse_assignment(text: &str) -> Result<(String, i64), ConfigError> {
    let captures = ASSIGNMENT
        .captures(text)
        .ok_or_else(|| ConfigError::Assignment(text.to_string()))?;
    let value = captures[2]
        .parse::<i64>()
        .map_err(|_| ConfigError::Assignment(text.to_string()))?;
    Ok((captures[1].to_string(), value))
}

/// Defaults, then `SOAP_CONFIG`, then `SOAP_*` environment variables.
pub fn parse_params() -> Result<SoapParams, ConfigError> {
    let mut params = match env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            debug!("Loading SOAP parameters from {}", path.display());
            SoapParams::from_json_file(&path)?
        }
        None => SoapParams::default(),
    };
    params.apply_env(|key| env::var(key).ok())?;
    Ok(params)
}
