//! Levenberg–Marquardt over block-structured reprojection problems.
//!
//! Residuals are grouped into blocks (one per view and camera). The Jacobian
//! is taken by central differences, re-evaluating only the blocks a parameter
//! touches, one column per task on the rayon pool.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{CalibError, Result};

pub trait LeastSquaresProblem: Sync {
    fn num_params(&self) -> usize;
    fn num_blocks(&self) -> usize;
    /// Number of residuals produced by `block`.
    fn block_len(&self, block: usize) -> usize;
    /// Writes the residuals of `block` into `out` (length `block_len(block)`).
    fn block_residuals(&self, block: usize, params: &[f64], out: &mut [f64]);
    /// Whether parameter `param` influences the residuals of `block`.
    fn touches(&self, _param: usize, _block: usize) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LmOptions {
    pub max_iterations: usize,
    /// Converged once `|delta| <= epsilon * (|x| + epsilon)` over the free parameters.
    pub epsilon: f64,
    pub initial_lambda: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            epsilon: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LmReport {
    pub iterations: usize,
    pub initial_cost: f64,
    /// Sum of squared residuals at the solution.
    pub final_cost: f64,
}

fn block_offsets<P: LeastSquaresProblem>(problem: &P) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(problem.num_blocks() + 1);
    let mut acc = 0;
    offsets.push(0);
    for b in 0..problem.num_blocks() {
        acc += problem.block_len(b);
        offsets.push(acc);
    }
    offsets
}

fn evaluate<P: LeastSquaresProblem>(problem: &P, offsets: &[usize], params: &[f64]) -> DVector<f64> {
    let mut r = DVector::zeros(offsets[offsets.len() - 1]);
    for b in 0..problem.num_blocks() {
        problem.block_residuals(b, params, &mut r.as_mut_slice()[offsets[b]..offsets[b + 1]]);
    }
    r
}

fn jacobian<P: LeastSquaresProblem>(
    problem: &P,
    offsets: &[usize],
    params: &[f64],
    free: &[usize],
) -> DMatrix<f64> {
    let m = offsets[offsets.len() - 1];
    let columns: Vec<DVector<f64>> = free
        .par_iter()
        .map(|&k| {
            let h = 1e-6 * (1.0 + params[k].abs());
            let mut plus = params.to_vec();
            let mut minus = params.to_vec();
            plus[k] += h;
            minus[k] -= h;
            let mut col = DVector::zeros(m);
            for b in 0..problem.num_blocks() {
                if !problem.touches(k, b) {
                    continue;
                }
                let len = problem.block_len(b);
                let mut rp = vec![0.0; len];
                let mut rm = vec![0.0; len];
                problem.block_residuals(b, &plus, &mut rp);
                problem.block_residuals(b, &minus, &mut rm);
                for i in 0..len {
                    col[offsets[b] + i] = (rp[i] - rm[i]) / (2.0 * h);
                }
            }
            col
        })
        .collect();
    DMatrix::from_columns(&columns)
}

fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

/// Minimizes the squared residuals of `problem` in place over the parameters
/// whose `free` flag is set.
///
/// # Errors
/// `SolverDivergence` when the residuals at the current estimate are not
/// finite, or when `max_iterations` pass without the step-size criterion.
pub fn levenberg_marquardt<P: LeastSquaresProblem>(
    problem: &P,
    params: &mut [f64],
    free: &[bool],
    options: &LmOptions,
) -> Result<LmReport> {
    if params.len() != problem.num_params() || free.len() != params.len() {
        return Err(CalibError::InvalidParameters(format!(
            "parameter vector has {} entries, mask {}, problem expects {}",
            params.len(),
            free.len(),
            problem.num_params()
        )));
    }

    let offsets = block_offsets(problem);
    let free_idx: Vec<usize> = (0..params.len()).filter(|&k| free[k]).collect();
    let mut residuals = evaluate(problem, &offsets, params);
    if !all_finite(&residuals) {
        return Err(CalibError::SolverDivergence(
            "non-finite residual at the initial estimate".to_string(),
        ));
    }
    let mut cost = residuals.norm_squared();
    let initial_cost = cost;
    if free_idx.is_empty() {
        return Ok(LmReport {
            iterations: 0,
            initial_cost,
            final_cost: cost,
        });
    }

    let mut lambda = options.initial_lambda;
    for iter in 0..options.max_iterations {
        let j = jacobian(problem, &offsets, params, &free_idx);
        if !j.iter().all(|x| x.is_finite()) {
            return Err(CalibError::SolverDivergence(format!(
                "non-finite Jacobian at iteration {iter}"
            )));
        }
        let jtj = j.transpose() * &j;
        let jtr = j.transpose() * &residuals;
        let x_norm = free_idx
            .iter()
            .map(|&k| params[k] * params[k])
            .sum::<f64>()
            .sqrt();

        loop {
            let mut lhs = jtj.clone();
            for i in 0..lhs.nrows() {
                lhs[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let delta = match lhs.clone().cholesky() {
                Some(chol) => Some(chol.solve(&jtr)),
                None => lhs.lu().solve(&jtr),
            };
            let Some(delta) = delta.filter(all_finite) else {
                lambda *= 10.0;
                if lambda > 1e20 {
                    return Err(CalibError::SolverDivergence(
                        "normal equations stayed singular".to_string(),
                    ));
                }
                continue;
            };

            let step = delta.norm();
            let small_step = step <= options.epsilon * (x_norm + options.epsilon);
            let mut candidate = params.to_vec();
            for (d, &k) in delta.iter().zip(&free_idx) {
                candidate[k] -= d;
            }
            let next = evaluate(problem, &offsets, &candidate);
            let next_cost = if all_finite(&next) {
                next.norm_squared()
            } else {
                f64::INFINITY
            };

            if next_cost < cost {
                params.copy_from_slice(&candidate);
                residuals = next;
                cost = next_cost;
                lambda = (lambda / 10.0).max(1e-15);
                trace!(iter, cost, lambda, step, "accepted step");
                if small_step {
                    debug!(iterations = iter + 1, cost, "levenberg-marquardt converged");
                    return Ok(LmReport {
                        iterations: iter + 1,
                        initial_cost,
                        final_cost: cost,
                    });
                }
                break;
            }

            if small_step || lambda > 1e20 {
                debug!(iterations = iter + 1, cost, "levenberg-marquardt converged");
                return Ok(LmReport {
                    iterations: iter + 1,
                    initial_cost,
                    final_cost: cost,
                });
            }
            lambda *= 10.0;
        }
    }

    Err(CalibError::SolverDivergence(format!(
        "no convergence after {} iterations (cost {cost:.6e})",
        options.max_iterations
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a * exp(b * x), one block per sample.
    struct ExpFit {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl LeastSquaresProblem for ExpFit {
        fn num_params(&self) -> usize {
            2
        }
        fn num_blocks(&self) -> usize {
            self.xs.len()
        }
        fn block_len(&self, _block: usize) -> usize {
            1
        }
        fn block_residuals(&self, block: usize, p: &[f64], out: &mut [f64]) {
            out[0] = p[0] * (p[1] * self.xs[block]).exp() - self.ys[block];
        }
    }

    fn problem() -> ExpFit {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys = xs.iter().map(|x| 2.5 * (-1.3 * x).exp()).collect();
        ExpFit { xs, ys }
    }

    #[test]
    fn fits_exponential() {
        let mut p = [1.0, 0.0];
        let report = levenberg_marquardt(&problem(), &mut p, &[true, true], &LmOptions::default())
            .unwrap();
        assert!((p[0] - 2.5).abs() < 1e-6, "a = {}", p[0]);
        assert!((p[1] + 1.3).abs() < 1e-6, "b = {}", p[1]);
        assert!(report.final_cost < 1e-12);
    }

    #[test]
    fn fixed_parameter_is_untouched() {
        let mut p = [1.0, -1.3];
        levenberg_marquardt(&problem(), &mut p, &[true, false], &LmOptions::default()).unwrap();
        assert_eq!(p[1], -1.3);
        assert!((p[0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn iteration_cap_without_convergence_is_divergence() {
        let mut p = [1.0, 0.0];
        let options = LmOptions {
            max_iterations: 1,
            ..LmOptions::default()
        };
        let err = levenberg_marquardt(&problem(), &mut p, &[true, true], &options).unwrap_err();
        assert!(matches!(err, CalibError::SolverDivergence(_)));
    }

    #[test]
    fn non_finite_start_is_divergence() {
        let mut p = [f64::NAN, 0.0];
        let err = levenberg_marquardt(&problem(), &mut p, &[true, true], &LmOptions::default())
            .unwrap_err();
        assert!(matches!(err, CalibError::SolverDivergence(_)));
    }
}
