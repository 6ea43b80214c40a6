//! Built-in I/O lower-bound derivation
//!
//! Derives the symbolic bound of a single region from its access structure.
//! For a region with variables `v` and arrays `A` (each indexed by a subset
//! `phi(A)` of the variables), the tile maximizing computation per unit of
//! loaded data has sides `X^a_v`, where the exponents solve
//!
//! ```text
//! maximize   sigma = sum_v a_v
//! subject to sum_{v in phi(A)} a_v <= 1    for every array A
//!            a_v >= 0
//! ```
//!
//! The exponent LP is tiny (one row per array, one column per loop), so it is
//! solved exactly by enumerating its vertices over [`Rational`]s. With `T` the
//! arrays whose constraint is tight, the intensity at the optimal tile size
//! `X* = k*S` (`k = sigma/(sigma-1)`) is
//!
//! ```text
//! rho = ops * (k/|T|)^sigma * S^(sigma-1) / (k-1)      (sigma > 1)
//! rho = ops / |T|                                       (sigma = 1)
//! Q   = ops * prod(N) / rho
//! ```
//!
//! For matrix multiplication this gives `Q = 2*N^3/sqrt(S)`.
//!
//! # Symbols
//!
//! Results are expressed in the canonical extents of the sub-problem plus
//! [`CACHE_SIZE_SYMBOL`] (fast memory size) and [`RANK_COUNT_SYMBOL`] (number
//! of ranks, only in the outer tile).

use crate::expr::SymExpr;
use crate::rational::Rational;
use crate::solver::{Solution, SolverBackend, SolverError, SubProblem};
use log::{debug, trace};
use std::collections::BTreeSet;

/// Fast memory size
pub const CACHE_SIZE_SYMBOL: &str = "S";

/// Number of ranks sharing the computation
pub const RANK_COUNT_SYMBOL: &str = "P";

/// Optimal point of the exponent LP
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilingExponents {
    /// Exponent per variable, at the centroid of the optimal face
    pub exponents: Vec<Rational>,
    /// Optimal objective value
    pub sigma: Rational,
    /// Number of arrays whose footprint constraint is tight
    pub tight_arrays: usize,
}

/// Solve the exponent LP for `variables` loops and the given array footprints
/// (each a list of variable positions).
///
/// # Returns
/// * `Ok(TilingExponents)` - exponents at the centroid of the optimal face
/// * `Err(String)` - the LP is unbounded (a variable indexes no array) or empty
pub fn tiling_exponents(variables: usize, footprints: &[Vec<usize>]) -> Result<TilingExponents, String> {
    if variables == 0 {
        return Err("region has no loops".to_string());
    }

    let footprints: Vec<BTreeSet<usize>> = footprints
        .iter()
        .map(|dims| dims.iter().copied().filter(|&d| d < variables).collect())
        .collect();

    for v in 0..variables {
        if !footprints.iter().any(|f| f.contains(&v)) {
            return Err(format!(
                "loop {} indexes no array, the tile can grow without bound",
                v
            ));
        }
    }

    // Rows `coeffs . a <= rhs`: one per array, then `-a_v <= 0`.
    let mut rows: Vec<(Vec<Rational>, Rational)> = Vec::new();
    for footprint in footprints.iter().filter(|f| !f.is_empty()) {
        let coeffs = (0..variables)
            .map(|v| {
                if footprint.contains(&v) {
                    Rational::ONE
                } else {
                    Rational::ZERO
                }
            })
            .collect();
        rows.push((coeffs, Rational::ONE));
    }
    for v in 0..variables {
        let coeffs = (0..variables)
            .map(|w| {
                if w == v {
                    Rational::from_integer(-1)
                } else {
                    Rational::ZERO
                }
            })
            .collect();
        rows.push((coeffs, Rational::ZERO));
    }

    let mut best: Option<Rational> = None;
    let mut optimal: Vec<Vec<Rational>> = Vec::new();

    for basis in Combinations::new(rows.len(), variables) {
        let matrix: Vec<Vec<Rational>> = basis.iter().map(|&r| rows[r].0.clone()).collect();
        let rhs: Vec<Rational> = basis.iter().map(|&r| rows[r].1).collect();
        let Some(point) = solve_square(matrix, rhs) else {
            continue;
        };
        if !is_feasible(&rows, &point) {
            continue;
        }
        let Some(objective) = point
            .iter()
            .try_fold(Rational::ZERO, |acc, a| acc.checked_add(a))
        else {
            continue;
        };
        trace!("LP vertex {:?} with objective {}", point, objective);
        match best {
            Some(current) if objective < current => {}
            Some(current) if objective == current => {
                if !optimal.contains(&point) {
                    optimal.push(point);
                }
            }
            _ => {
                best = Some(objective);
                optimal = vec![point];
            }
        }
    }

    let sigma = best.ok_or_else(|| "exponent LP has no vertex".to_string())?;
    let count = Rational::from_integer(optimal.len() as i64);
    let mut exponents = Vec::with_capacity(variables);
    for v in 0..variables {
        let total = optimal
            .iter()
            .try_fold(Rational::ZERO, |acc, point| acc.checked_add(&point[v]))
            .and_then(|sum| sum.checked_div(&count))
            .ok_or_else(|| "overflow while averaging optimal exponents".to_string())?;
        exponents.push(total);
    }

    let tight_arrays = footprints
        .iter()
        .filter(|f| !f.is_empty())
        .filter(|f| {
            f.iter()
                .try_fold(Rational::ZERO, |acc, &v| acc.checked_add(&exponents[v]))
                == Some(Rational::ONE)
        })
        .count();

    Ok(TilingExponents {
        exponents,
        sigma,
        tight_arrays,
    })
}

fn is_feasible(rows: &[(Vec<Rational>, Rational)], point: &[Rational]) -> bool {
    rows.iter().all(|(coeffs, rhs)| {
        coeffs
            .iter()
            .zip(point)
            .try_fold(Rational::ZERO, |acc, (c, x)| acc.checked_add(&c.checked_mul(x)?))
            .map(|lhs| lhs <= *rhs)
            .unwrap_or(false)
    })
}

/// Gauss-Jordan elimination; `None` when singular or on overflow.
fn solve_square(mut a: Vec<Vec<Rational>>, mut b: Vec<Rational>) -> Option<Vec<Rational>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).find(|&r| !a[r][col].is_zero())?;
        a.swap(col, pivot);
        b.swap(col, pivot);

        let inv = a[col][col].recip()?;
        for k in col..n {
            let scaled = a[col][k].checked_mul(&inv)?;
            a[col][k] = scaled;
        }
        b[col] = b[col].checked_mul(&inv)?;

        for r in 0..n {
            if r == col || a[r][col].is_zero() {
                continue;
            }
            let factor = a[r][col];
            for k in col..n {
                let updated = a[r][k].checked_sub(&factor.checked_mul(&a[col][k])?)?;
                a[r][k] = updated;
            }
            let updated = b[r].checked_sub(&factor.checked_mul(&b[col])?)?;
            b[r] = updated;
        }
    }
    Some(b)
}

/// Lexicographic k-subsets of `0..n`
struct Combinations {
    n: usize,
    current: Option<Vec<usize>>,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Combinations {
            n,
            current: if k <= n { Some((0..k).collect()) } else { None },
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.current.take()?;
        let k = current.len();
        let mut following = current.clone();
        let mut advanced = false;
        for i in (0..k).rev() {
            if following[i] < self.n - k + i {
                following[i] += 1;
                for j in i + 1..k {
                    following[j] = following[j - 1] + 1;
                }
                advanced = true;
                break;
            }
        }
        if advanced {
            self.current = Some(following);
        }
        Some(current)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// The built-in bound derivation
#[derive(Clone, Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    fn failure(message: impl Into<String>) -> SolverError {
        SolverError::Backend {
            backend: "local".to_string(),
            message: message.into(),
        }
    }

    /// Derive the symbolic bound and tiling of `problem`.
    pub fn derive(problem: &SubProblem) -> Result<Solution, SolverError> {
        let footprints: Vec<Vec<usize>> = problem.arrays.iter().map(|a| a.dims.clone()).collect();
        let lp = tiling_exponents(problem.variables.len(), &footprints)
            .map_err(|e| Self::failure(format!("{}: {}", problem.name, e)))?;
        debug!(
            "'{}': sigma = {}, {} tight array(s), exponents {:?}",
            problem.name,
            lp.sigma,
            lp.tight_arrays,
            lp.exponents.iter().map(|e| e.to_string()).collect::<Vec<_>>()
        );
        if lp.tight_arrays == 0 {
            return Err(Self::failure(format!("{}: no tight array at the optimum", problem.name)));
        }

        let overflow = || Self::failure(format!("{}: coefficient overflow", problem.name));
        let cache = SymExpr::sym(CACHE_SIZE_SYMBOL);
        let ranks = SymExpr::sym(RANK_COUNT_SYMBOL);
        let ops = Rational::from_integer(problem.ops_per_iter as i64);
        let tight = Rational::from_integer(lp.tight_arrays as i64);
        let volume = SymExpr::mul(problem.extents.iter().cloned());

        let (intensity, tile_size) = if lp.sigma == Rational::ONE {
            let rho = ops.checked_div(&tight).ok_or_else(overflow)?;
            let size = SymExpr::ratio(cache, SymExpr::rational(tight));
            (SymExpr::rational(rho), size)
        } else {
            let sigma_minus_one = lp.sigma.checked_sub(&Rational::ONE).ok_or_else(overflow)?;
            let k = lp.sigma.checked_div(&sigma_minus_one).ok_or_else(overflow)?;
            let k_minus_one = k.checked_sub(&Rational::ONE).ok_or_else(overflow)?;
            let per_array = k.checked_div(&tight).ok_or_else(overflow)?;
            let scale = ops.checked_div(&k_minus_one).ok_or_else(overflow)?;
            let rho = SymExpr::mul([
                SymExpr::rational(scale),
                SymExpr::pow(SymExpr::rational(per_array), lp.sigma),
                SymExpr::pow(cache.clone(), sigma_minus_one),
            ]);
            let size = SymExpr::mul([SymExpr::rational(per_array), cache]);
            (rho, size)
        };

        let io_bound = SymExpr::ratio(
            SymExpr::mul([SymExpr::rational(ops), volume.clone()]),
            intensity.clone(),
        );
        let inner_tile = lp
            .exponents
            .iter()
            .map(|a| SymExpr::pow(tile_size.clone(), *a))
            .collect();
        let per_rank = SymExpr::ratio(volume, ranks);
        let outer_tile = lp
            .exponents
            .iter()
            .map(|a| a.checked_div(&lp.sigma).map(|e| SymExpr::pow(per_rank.clone(), e)))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(overflow)?;

        Ok(Solution {
            io_bound,
            intensity,
            inner_tile,
            outer_tile,
        })
    }
}

impl SolverBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn solve(&self, problem: &SubProblem) -> Result<Solution, SolverError> {
        Self::derive(problem)
    }
}
