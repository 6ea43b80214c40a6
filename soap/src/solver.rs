//! Optimizer session
//!
//! The analysis engine hands every computational region to an optimizer
//! session as a [`SubProblem`] and receives a symbolic [`Solution`] (I/O bound,
//! intensity, tile sizes). The session owns:
//!
//! 1. **The backend**: the built-in [`LocalBackend`](crate::bound::LocalBackend)
//!    or a [`RemoteBackend`] process, behind the [`SolverBackend`] trait
//! 2. **The solution cache**: keyed by the structural signature of the
//!    sub-problem, optionally persisted as JSON
//! 3. **The timeout**: bounding every single backend call
//!
//! # Caching modes
//!
//! | Mode | Reads cache | Calls backend on miss | Persists new solutions |
//! |------|-------------|-----------------------|------------------------|
//! | `off` | no | yes | no |
//! | `cached-only` | yes | no, fails with [`SolverError::LookupFailure`] | no |
//! | `caching` | yes | yes | yes, on [`Solver::end`] |
//!
//! # Lifecycle
//!
//! A session is opened with [`Solver::start`] and closed with [`Solver::end`].
//! [`SessionGuard`] ties the two together so that a session opened by an
//! orchestrator is released on every exit path, including errors.
//!
//! ```rust
//! use soap::solver::{SessionGuard, SolverConfig};
//!
//! let guard = SessionGuard::open(&SolverConfig::default())?;
//! assert!(guard.is_active());
//! guard.close()?;
//! # Ok::<(), soap::solver::SolverError>(())
//! ```

use crate::bound::LocalBackend;
use crate::expr::{Bindings, SymExpr};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Default bound on a single solve call, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Error Types
// ============================================================================

/// Optimizer session errors
///
/// `LookupFailure`, `Timeout` and `Backend` are scoped to one sub-problem: the
/// engine records them against the region and keeps going. `NotStarted` is a
/// session-level failure and aborts the analysis.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    /// Cached-only mode and no cached solution for this signature
    #[error("no cached solution for sub-problem '{signature}' (cached-only mode)")]
    LookupFailure { signature: String },

    #[error("solver timed out after {seconds}s on sub-problem '{signature}'")]
    Timeout { signature: String, seconds: u64 },

    #[error("optimizer session is not started")]
    NotStarted,

    #[error("remote solver requested but no remote command is configured")]
    NoRemoteCommand,

    #[error("solver backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    #[error("solver cache '{path}': {message}")]
    Cache { path: String, message: String },
}

impl SolverError {
    /// Errors that invalidate the whole session rather than one sub-problem.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, SolverError::NotStarted | SolverError::NoRemoteCommand)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// How the session uses its solution cache
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachingMode {
    #[default]
    Off,
    /// Only reuse previously solved problems, never call the backend
    CachedOnly,
    /// Reuse and persist solutions
    Caching,
}

impl FromStr for CachingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(CachingMode::Off),
            "cached-only" | "cached_only" => Ok(CachingMode::CachedOnly),
            "caching" | "on" => Ok(CachingMode::Caching),
            other => Err(format!(
                "unknown caching mode '{}' (expected off, cached-only or caching)",
                other
            )),
        }
    }
}

/// Optimizer session configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub caching: CachingMode,

    /// Use the remote backend instead of the built-in one
    pub remote: bool,

    /// Command line of the remote solver; it reads a sub-problem as JSON on
    /// stdin and prints a solution as JSON on stdout
    pub remote_command: Option<String>,

    /// Where solutions are loaded from and persisted to (in-memory if `None`)
    pub cache_path: Option<PathBuf>,

    /// Timeout for each solve call (seconds, 0 = no timeout)
    pub timeout_secs: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            caching: CachingMode::Off,
            remote: false,
            remote_command: None,
            cache_path: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Sub-problems and solutions
// ============================================================================

/// One array of a sub-problem, indexed by positions into `variables`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemArray {
    pub name: String,
    pub dims: Vec<usize>,
    /// Written by the region
    pub output: bool,
}

/// What the session solves: the iteration space and access structure of one
/// computational region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubProblem {
    /// Region label, for diagnostics only
    pub name: String,
    pub variables: Vec<String>,
    /// Extent of each variable, aligned with `variables`
    pub extents: Vec<SymExpr>,
    pub arrays: Vec<ProblemArray>,
    pub ops_per_iter: u32,
}

impl SubProblem {
    /// Name of the canonical extent symbol of dimension `index`.
    pub fn canonical_extent(index: usize) -> String {
        format!("_N{}", index)
    }

    /// Structural key, invariant under renaming of variables and arrays and
    /// under reordering of arrays.
    pub fn signature(&self) -> String {
        let mut arrays: Vec<String> = self
            .arrays
            .iter()
            .map(|a| {
                let dims: Vec<String> = a.dims.iter().map(|d| d.to_string()).collect();
                format!("{}{}", if a.output { "w" } else { "r" }, dims.join("."))
            })
            .collect();
        arrays.sort();
        format!(
            "d{}|ops{}|{}",
            self.variables.len(),
            self.ops_per_iter,
            arrays.join(";")
        )
    }

    /// The same problem with generic names (`v0.., _N0.., a0..`) and arrays in
    /// signature order. Backends and the cache only ever see this form.
    pub fn canonical(&self) -> SubProblem {
        let mut arrays: Vec<ProblemArray> = self
            .arrays
            .iter()
            .map(|a| ProblemArray {
                name: String::new(),
                dims: a.dims.clone(),
                output: a.output,
            })
            .collect();
        arrays.sort_by_key(|a| {
            let dims: Vec<String> = a.dims.iter().map(|d| d.to_string()).collect();
            format!("{}{}", if a.output { "w" } else { "r" }, dims.join("."))
        });
        for (index, array) in arrays.iter_mut().enumerate() {
            array.name = format!("a{}", index);
        }
        SubProblem {
            name: self.signature(),
            variables: (0..self.variables.len()).map(|i| format!("v{}", i)).collect(),
            extents: (0..self.variables.len())
                .map(|i| SymExpr::sym(Self::canonical_extent(i)))
                .collect(),
            arrays,
            ops_per_iter: self.ops_per_iter,
        }
    }

    /// Canonical extent symbols back to this problem's extents.
    pub fn canonical_bindings(&self) -> Bindings {
        self.extents
            .iter()
            .enumerate()
            .map(|(i, e)| (Self::canonical_extent(i), e.clone()))
            .collect()
    }
}

/// Symbolic result for one sub-problem
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Lower bound on data movement (Q)
    pub io_bound: SymExpr,
    /// Operations per unit of I/O at the optimal tiling (rho)
    pub intensity: SymExpr,
    /// Cache-level tile size per variable
    pub inner_tile: Vec<SymExpr>,
    /// Rank-level tile size per variable
    pub outer_tile: Vec<SymExpr>,
}

impl Solution {
    pub fn substitute(&self, bindings: &Bindings) -> Solution {
        Solution {
            io_bound: self.io_bound.substitute(bindings),
            intensity: self.intensity.substitute(bindings),
            inner_tile: self.inner_tile.iter().map(|t| t.substitute(bindings)).collect(),
            outer_tile: self.outer_tile.iter().map(|t| t.substitute(bindings)).collect(),
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

/// The pluggable procedure deriving a bound and tiling for a sub-problem
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Solve a canonical sub-problem.
    fn solve(&self, problem: &SubProblem) -> Result<Solution, SolverError>;

    /// Abandon the solves currently in flight. Called when a call times out.
    fn cancel(&self) {}

    /// Called once when the owning session ends.
    fn shutdown(&self) {}
}

/// Backend running an external solver process per sub-problem
///
/// The process receives the canonical [`SubProblem`] as JSON on stdin and
/// must print a [`Solution`] as JSON on stdout. Processes still running when
/// a call is cancelled or the session ends are killed.
pub struct RemoteBackend {
    program: String,
    args: Vec<String>,
    next_call: AtomicU64,
    running: Mutex<BTreeMap<u64, Child>>,
}

impl RemoteBackend {
    /// Build from a whitespace-separated command line.
    pub fn from_command_line(command: &str) -> Result<Self, SolverError> {
        let mut parts = command.split_whitespace().map(|s| s.to_string());
        let program = parts.next().ok_or(SolverError::NoRemoteCommand)?;
        Ok(RemoteBackend {
            program,
            args: parts.collect(),
            next_call: AtomicU64::new(0),
            running: Mutex::new(BTreeMap::new()),
        })
    }

    fn failure(&self, message: impl Into<String>) -> SolverError {
        SolverError::Backend {
            backend: format!("remote:{}", self.program),
            message: message.into(),
        }
    }

    fn running(&self) -> MutexGuard<'_, BTreeMap<u64, Child>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of solver processes currently running.
    pub fn in_flight(&self) -> usize {
        self.running().len()
    }

    fn kill_running(&self) {
        let children = std::mem::take(&mut *self.running());
        for (call, mut child) in children {
            warn!("Killing remote solver process {} (call {})", child.id(), call);
            // The process may have exited on its own meanwhile.
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Send the payload and collect stdout and stderr until the process
    /// closes them.
    fn exchange(
        &self,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        payload: &[u8],
    ) -> Result<(Vec<u8>, String), SolverError> {
        let stderr_reader = thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text);
            }
            text
        });

        if let Some(mut stdin) = stdin {
            stdin
                .write_all(payload)
                .map_err(|e| self.failure(format!("failed to send sub-problem: {}", e)))?;
        }

        let mut output = Vec::new();
        if let Some(mut stdout) = stdout {
            stdout
                .read_to_end(&mut output)
                .map_err(|e| self.failure(format!("failed to read solution: {}", e)))?;
        }
        let errors = stderr_reader.join().unwrap_or_default();
        Ok((output, errors))
    }
}

impl SolverBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    fn solve(&self, problem: &SubProblem) -> Result<Solution, SolverError> {
        let payload = serde_json::to_vec(problem)
            .map_err(|e| self.failure(format!("cannot encode sub-problem: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.failure(format!("failed to start: {}", e)))?;
        let (stdin, stdout, stderr) = (child.stdin.take(), child.stdout.take(), child.stderr.take());

        let call = self.next_call.fetch_add(1, Ordering::SeqCst);
        self.running().insert(call, child);
        let exchanged = self.exchange(stdin, stdout, stderr, &payload);

        let Some(mut child) = self.running().remove(&call) else {
            return Err(self.failure("cancelled"));
        };
        let status = child
            .wait()
            .map_err(|e| self.failure(format!("failed to wait for solver: {}", e)))?;
        let (output, errors) = exchanged?;

        if !status.success() {
            return Err(self.failure(format!("exited with {}: {}", status, errors.trim())));
        }

        serde_json::from_slice(&output).map_err(|e| self.failure(format!("malformed solution: {}", e)))
    }

    fn cancel(&self) {
        self.kill_running();
    }

    fn shutdown(&self) {
        self.kill_running();
    }
}

// ============================================================================
// Session
// ============================================================================

/// Optimizer session: backend + cache + timeout
pub struct Solver {
    config: SolverConfig,
    custom_backend: Option<Arc<dyn SolverBackend>>,
    backend: Option<Arc<dyn SolverBackend>>,
    cache: HashMap<String, Solution>,
    dirty: bool,
    timeout: Option<Duration>,
    backend_calls: usize,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Self {
        let timeout = Self::timeout_from_secs(config.timeout_secs);
        Solver {
            config,
            custom_backend: None,
            backend: None,
            cache: HashMap::new(),
            dirty: false,
            timeout,
            backend_calls: 0,
        }
    }

    /// A session that solves with `backend` regardless of the remote flag.
    pub fn with_backend(config: SolverConfig, backend: Arc<dyn SolverBackend>) -> Self {
        let mut solver = Solver::new(config);
        solver.custom_backend = Some(backend);
        solver
    }

    fn timeout_from_secs(seconds: u64) -> Option<Duration> {
        if seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(seconds))
        }
    }

    /// Open the session: select the backend and load the cache.
    pub fn start(&mut self, remote: bool) -> Result<(), SolverError> {
        let backend: Arc<dyn SolverBackend> = match (&self.custom_backend, remote) {
            (Some(custom), _) => Arc::clone(custom),
            (None, true) => {
                let command = self
                    .config
                    .remote_command
                    .as_deref()
                    .ok_or(SolverError::NoRemoteCommand)?;
                Arc::new(RemoteBackend::from_command_line(command)?)
            }
            (None, false) => Arc::new(LocalBackend::default()),
        };

        if self.config.caching != CachingMode::Off {
            if let Some(path) = self.config.cache_path.clone() {
                self.load_cache(&path)?;
            }
        }

        info!(
            "Optimizer session started (backend: {}, caching: {:?}, cached solutions: {})",
            backend.name(),
            self.config.caching,
            self.cache.len()
        );
        self.backend = Some(backend);
        Ok(())
    }

    /// Close the session and persist new solutions. Idempotent.
    pub fn end(&mut self) -> Result<(), SolverError> {
        let Some(backend) = self.backend.take() else {
            return Ok(());
        };
        backend.shutdown();
        info!(
            "Optimizer session ended ({} backend call(s), {} cached solution(s))",
            self.backend_calls,
            self.cache.len()
        );
        if self.config.caching == CachingMode::Caching && self.dirty {
            if let Some(path) = self.config.cache_path.clone() {
                self.persist_cache(&path)?;
            }
        }
        Ok(())
    }

    /// Bound every subsequent solve call (0 disables the timeout).
    pub fn set_timeout(&mut self, seconds: u64) {
        self.config.timeout_secs = seconds;
        self.timeout = Self::timeout_from_secs(seconds);
    }

    pub fn is_active(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Number of times the backend was invoked (cache hits excluded).
    pub fn backend_calls(&self) -> usize {
        self.backend_calls
    }

    pub fn cached_solutions(&self) -> usize {
        self.cache.len()
    }

    /// Solve one sub-problem according to the caching mode.
    ///
    /// The backend and the cache work on [`SubProblem::canonical`]; the
    /// returned solution is expressed in the problem's own extents.
    pub fn solve(&mut self, problem: &SubProblem) -> Result<Solution, SolverError> {
        let backend = self.backend.clone().ok_or(SolverError::NotStarted)?;
        let canonical = problem.canonical();
        let signature = problem.signature();

        let solution = match self.config.caching {
            CachingMode::Off => self.call_backend(backend, canonical, &signature)?,
            CachingMode::CachedOnly => match self.cache.get(&signature) {
                Some(hit) => {
                    debug!("Cache hit for '{}' ({})", problem.name, signature);
                    hit.clone()
                }
                None => return Err(SolverError::LookupFailure { signature }),
            },
            CachingMode::Caching => match self.cache.get(&signature) {
                Some(hit) => {
                    debug!("Cache hit for '{}' ({})", problem.name, signature);
                    hit.clone()
                }
                None => {
                    let solved = self.call_backend(backend, canonical, &signature)?;
                    self.cache.insert(signature, solved.clone());
                    self.dirty = true;
                    solved
                }
            },
        };

        Ok(solution.substitute(&problem.canonical_bindings()))
    }

    fn call_backend(
        &mut self,
        backend: Arc<dyn SolverBackend>,
        problem: SubProblem,
        signature: &str,
    ) -> Result<Solution, SolverError> {
        self.backend_calls += 1;
        debug!("Solving '{}' with backend {}", signature, backend.name());

        let Some(timeout) = self.timeout else {
            return backend.solve(&problem);
        };

        let (tx, rx) = mpsc::channel();
        let worker_backend = Arc::clone(&backend);
        thread::Builder::new()
            .name("soap-solver".to_string())
            .spawn(move || {
                // The receiver is gone once the call timed out.
                let _ = tx.send(worker_backend.solve(&problem));
            })
            .map_err(|e| SolverError::Backend {
                backend: backend.name().to_string(),
                message: format!("cannot spawn solver thread: {}", e),
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Solver timed out after {}s on '{}', abandoning the call",
                    timeout.as_secs(),
                    signature
                );
                backend.cancel();
                Err(SolverError::Timeout {
                    signature: signature.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SolverError::Backend {
                backend: backend.name().to_string(),
                message: "solver thread terminated without a result".to_string(),
            }),
        }
    }

    fn load_cache(&mut self, path: &Path) -> Result<(), SolverError> {
        if !path.exists() {
            debug!("No solver cache at {}", path.display());
            return Ok(());
        }
        let cache_error = |message: String| SolverError::Cache {
            path: path.display().to_string(),
            message,
        };
        let text = fs::read_to_string(path).map_err(|e| cache_error(e.to_string()))?;
        let entries: BTreeMap<String, Solution> =
            serde_json::from_str(&text).map_err(|e| cache_error(e.to_string()))?;
        debug!("Loaded {} cached solution(s) from {}", entries.len(), path.display());
        self.cache.extend(entries);
        Ok(())
    }

    fn persist_cache(&mut self, path: &Path) -> Result<(), SolverError> {
        let cache_error = |message: String| SolverError::Cache {
            path: path.display().to_string(),
            message,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| cache_error(e.to_string()))?;
        }
        let ordered: BTreeMap<&String, &Solution> = self.cache.iter().collect();
        let text = serde_json::to_string_pretty(&ordered).map_err(|e| cache_error(e.to_string()))?;
        fs::write(path, text).map_err(|e| cache_error(e.to_string()))?;
        self.dirty = false;
        info!("Persisted {} solution(s) to {}", self.cache.len(), path.display());
        Ok(())
    }
}

/// A started session that is ended when dropped
pub struct SessionGuard {
    solver: Solver,
}

impl SessionGuard {
    /// Create, start and time-limit a session from configuration.
    pub fn open(config: &SolverConfig) -> Result<Self, SolverError> {
        Self::start(Solver::new(config.clone()))
    }

    /// Start `solver` with its configured remote flag and timeout.
    pub fn start(mut solver: Solver) -> Result<Self, SolverError> {
        let remote = solver.config.remote;
        let timeout = solver.config.timeout_secs;
        solver.start(remote)?;
        solver.set_timeout(timeout);
        Ok(SessionGuard { solver })
    }

    /// End the session, reporting persistence errors.
    pub fn close(mut self) -> Result<(), SolverError> {
        self.solver.end()
    }
}

impl Deref for SessionGuard {
    type Target = Solver;

    fn deref(&self) -> &Solver {
        &self.solver
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Solver {
        &mut self.solver
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.solver.end() {
            warn!("Failed to end optimizer session cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct CountingBackend {
        calls: AtomicUsize,
        shutdowns: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CountingBackend {
        fn new(delay: Option<Duration>) -> Arc<Self> {
            Arc::new(CountingBackend {
                calls: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                delay,
            })
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
            Ok(Solution {
                io_bound: SymExpr::mul(problem.extents.iter().cloned()),
                intensity: SymExpr::num(1),
                inner_tile: vec![SymExpr::num(1); problem.variables.len()],
                outer_tile: problem.extents.clone(),
            })
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn problem(vars: &[&str], extent: &str, arrays: &[(&str, &[usize], bool)]) -> SubProblem {
        SubProblem {
            name: "test".to_string(),
            variables: vars.iter().map(|v| v.to_string()).collect(),
            extents: vars.iter().map(|_| SymExpr::sym(extent)).collect(),
            arrays: arrays
                .iter()
                .map(|(name, dims, output)| ProblemArray {
                    name: name.to_string(),
                    dims: dims.to_vec(),
                    output: *output,
                })
                .collect(),
            ops_per_iter: 1,
        }
    }

    fn matmul(extent: &str) -> SubProblem {
        problem(
            &["i", "j", "k"],
            extent,
            &[("A", &[0, 2], false), ("B", &[2, 1], false), ("C", &[0, 1], true)],
        )
    }

    fn config(caching: CachingMode, cache_path: Option<PathBuf>) -> SolverConfig {
        SolverConfig {
            caching,
            cache_path,
            timeout_secs: 0,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn test_signature_ignores_names_and_array_order() {
        let a = matmul("N");
        let mut b = problem(
            &["x", "y", "z"],
            "M",
            &[("Out", &[0, 1], true), ("R", &[2, 1], false), ("L", &[0, 2], false)],
        );
        assert_eq!(a.signature(), b.signature());
        b.ops_per_iter = 2;
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_solve_requires_started_session() {
        let mut solver = Solver::new(SolverConfig::default());
        assert_eq!(solver.solve(&matmul("N")), Err(SolverError::NotStarted));
    }

    #[test]
    fn test_solution_is_renamed_to_problem_extents() {
        let backend = CountingBackend::new(None);
        let mut solver = Solver::with_backend(config(CachingMode::Off, None), backend.clone());
        solver.start(false).unwrap();
        let solution = solver.solve(&matmul("N")).unwrap();
        assert_eq!(solution.io_bound.to_string(), "N^3");
        assert_eq!(solution.outer_tile[2], SymExpr::sym("N"));
    }

    #[test]
    fn test_cached_only_never_calls_backend() {
        let backend = CountingBackend::new(None);
        let mut solver =
            Solver::with_backend(config(CachingMode::CachedOnly, None), backend.clone());
        solver.start(false).unwrap();
        let err = solver.solve(&matmul("N")).unwrap_err();
        assert!(matches!(err, SolverError::LookupFailure { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(solver.backend_calls(), 0);
    }

    #[test]
    fn test_caching_reuses_structurally_equal_problems() {
        let backend = CountingBackend::new(None);
        let mut solver = Solver::with_backend(config(CachingMode::Caching, None), backend.clone());
        solver.start(false).unwrap();

        let first = solver.solve(&matmul("N")).unwrap();
        let second = solver.solve(&matmul("M")).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.io_bound.to_string(), "N^3");
        assert_eq!(second.io_bound.to_string(), "M^3");
    }

    #[test]
    fn test_cache_persists_across_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("solutions.json");

        let backend = CountingBackend::new(None);
        let mut writer = Solver::with_backend(
            config(CachingMode::Caching, Some(path.clone())),
            backend.clone(),
        );
        writer.start(false).unwrap();
        writer.solve(&matmul("N")).unwrap();
        writer.end().unwrap();
        assert!(path.exists());
        assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 1);

        let reader_backend = CountingBackend::new(None);
        let mut reader = Solver::with_backend(
            config(CachingMode::CachedOnly, Some(path.clone())),
            reader_backend.clone(),
        );
        reader.start(false).unwrap();
        let solution = reader.solve(&matmul("K")).unwrap();
        assert_eq!(solution.io_bound.to_string(), "K^3");
        assert_eq!(reader_backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timeout_is_reported() {
        let backend = CountingBackend::new(Some(Duration::from_millis(2500)));
        let mut solver = Solver::with_backend(config(CachingMode::Off, None), backend);
        solver.start(false).unwrap();
        solver.set_timeout(1);
        let err = solver.solve(&matmul("N")).unwrap_err();
        assert_eq!(
            err,
            SolverError::Timeout {
                signature: matmul("N").signature(),
                seconds: 1
            }
        );
        assert!(!err.is_session_fatal());
    }

    /// A remote solver that sleeps, then leaves `marker` behind.
    #[cfg(unix)]
    fn slow_remote(dir: &TempDir, seconds: u32) -> (Arc<RemoteBackend>, PathBuf) {
        let marker = dir.path().join("finished");
        let script = dir.path().join("slow.sh");
        fs::write(&script, format!("sleep {}\ntouch {}\n", seconds, marker.display())).unwrap();
        let backend = RemoteBackend::from_command_line(&format!("sh {}", script.display())).unwrap();
        (Arc::new(backend), marker)
    }

    #[test]
    #[cfg(unix)]
    fn test_timed_out_remote_process_is_killed() {
        let dir = TempDir::new().unwrap();
        let (backend, marker) = slow_remote(&dir, 3);
        let mut solver = Solver::with_backend(config(CachingMode::Off, None), backend.clone());
        solver.start(false).unwrap();
        solver.set_timeout(1);

        let err = solver.solve(&matmul("N")).unwrap_err();
        assert!(matches!(err, SolverError::Timeout { seconds: 1, .. }));
        assert_eq!(backend.in_flight(), 0);
        solver.end().unwrap();

        thread::sleep(Duration::from_secs(4));
        assert!(!marker.exists(), "solver process outlived its timeout");
    }

    #[test]
    #[cfg(unix)]
    fn test_shutdown_kills_in_flight_solves() {
        let dir = TempDir::new().unwrap();
        let (backend, marker) = slow_remote(&dir, 3);
        let worker = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || backend.solve(&matmul("N")))
        };
        while backend.in_flight() == 0 {
            thread::sleep(Duration::from_millis(10));
        }
        backend.shutdown();
        assert_eq!(backend.in_flight(), 0);

        let result = worker.join().unwrap();
        assert!(matches!(result, Err(SolverError::Backend { ref message, .. }) if message == "cancelled"));
        thread::sleep(Duration::from_secs(1));
        assert!(!marker.exists());
    }

    #[test]
    fn test_guard_ends_session_on_drop() {
        let backend = CountingBackend::new(None);
        {
            let solver = Solver::with_backend(config(CachingMode::Off, None), backend.clone());
            let guard = SessionGuard::start(solver).unwrap();
            assert!(guard.is_active());
        }
        assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_without_command() {
        let mut solver = Solver::new(SolverConfig::default());
        assert_eq!(solver.start(true), Err(SolverError::NoRemoteCommand));
        assert!(!solver.is_active());
    }

    #[test]
    fn test_caching_mode_parsing() {
        assert_eq!("cached-only".parse::<CachingMode>(), Ok(CachingMode::CachedOnly));
        assert_eq!("Caching".parse::<CachingMode>(), Ok(CachingMode::Caching));
        assert!("sometimes".parse::<CachingMode>().is_err());
    }
}
