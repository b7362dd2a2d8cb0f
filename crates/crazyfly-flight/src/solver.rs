//! Quadratic program solvers
//!
//! The MPC only needs box-constrained QPs, so the native backend is an
//! accelerated projected-gradient method (FISTA with gradient-based adaptive
//! restart). An OSQP backend is available behind the `osqp` feature.

use std::time::{Duration, Instant};

use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ocp::BoxQp;

/// Solver errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("problem dimensions are inconsistent: {0}")]
    Dimension(String),
    #[error("infeasible bounds at index {index}: lower {lower} > upper {upper}")]
    Infeasible { index: usize, lower: f64, upper: f64 },
    #[error("maximum iterations ({0}) reached without convergence")]
    MaxIterationsReached(usize),
    #[error("time budget of {budget_ms:.2} ms exceeded")]
    Timeout { budget_ms: f64 },
    #[error("numerical failure: {0}")]
    Numerical(String),
    #[error("{0} backend unavailable")]
    Unavailable(&'static str),
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Which QP backend the MPC uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpBackend {
    #[default]
    ProjectedGradient,
    Osqp,
}

/// Configuration for a single solve call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the projected-gradient residual
    pub tolerance: f64,
    /// Wall-clock budget per solve [ms]; unlimited when absent
    pub time_budget_ms: Option<f64>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-6,
            time_budget_ms: Some(5.0),
        }
    }
}

impl SolveOptions {
    fn budget(&self) -> Option<Duration> {
        self.time_budget_ms
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }
}

/// Solution statistics from a solver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStatistics {
    pub iterations: usize,
    /// Total solve time [ms]
    pub solve_time_ms: f64,
    pub objective: f64,
    /// Projected-gradient residual at the returned point
    pub residual: f64,
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub statistics: SolveStatistics,
}

/// A box-constrained QP solver
pub trait QpSolver: Send {
    fn name(&self) -> &'static str;

    /// Solve `qp`, optionally starting from `warm_start`
    fn solve(
        &mut self,
        qp: &BoxQp,
        warm_start: Option<&DVector<f64>>,
        options: &SolveOptions,
    ) -> Result<QpSolution, SolverError>;
}

/// Instantiate the requested backend
pub fn solver_for(backend: QpBackend) -> Result<Box<dyn QpSolver>, SolverError> {
    match backend {
        QpBackend::ProjectedGradient => Ok(Box::new(ProjectedGradientSolver::default())),
        #[cfg(feature = "osqp")]
        QpBackend::Osqp => Ok(Box::new(osqp_backend::OsqpSolver::default())),
        #[cfg(not(feature = "osqp"))]
        QpBackend::Osqp => Err(SolverError::Unavailable("osqp")),
    }
}

/// Reject malformed problems before iterating
fn check_problem(qp: &BoxQp) -> Result<(), SolverError> {
    let n = qp.dim();
    if qp.hessian.nrows() != n || qp.hessian.ncols() != n || qp.lower.len() != n || qp.upper.len() != n {
        return Err(SolverError::Dimension(format!(
            "hessian {}x{}, gradient {}, bounds {}/{}",
            qp.hessian.nrows(),
            qp.hessian.ncols(),
            n,
            qp.lower.len(),
            qp.upper.len()
        )));
    }
    if qp.hessian.iter().chain(qp.gradient.iter()).any(|v| !v.is_finite()) {
        return Err(SolverError::Numerical("non-finite problem data".into()));
    }
    for i in 0..n {
        if qp.lower[i].is_nan() || qp.upper[i].is_nan() || qp.lower[i] > qp.upper[i] {
            return Err(SolverError::Infeasible {
                index: i,
                lower: qp.lower[i],
                upper: qp.upper[i],
            });
        }
    }
    Ok(())
}

/// Accelerated projected-gradient solver
#[derive(Debug, Clone, Default)]
pub struct ProjectedGradientSolver {
    restarts: usize,
}

impl ProjectedGradientSolver {
    /// Momentum restarts over the solver's lifetime
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Gershgorin bound on the largest eigenvalue of a symmetric matrix
    fn lipschitz(qp: &BoxQp) -> f64 {
        qp.hessian
            .row_iter()
            .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
            .fold(0.0, f64::max)
    }
}

impl QpSolver for ProjectedGradientSolver {
    fn name(&self) -> &'static str {
        "projected-gradient"
    }

    fn solve(
        &mut self,
        qp: &BoxQp,
        warm_start: Option<&DVector<f64>>,
        options: &SolveOptions,
    ) -> Result<QpSolution, SolverError> {
        let started = Instant::now();
        check_problem(qp)?;

        let lipschitz = Self::lipschitz(qp);
        if !(lipschitz.is_finite() && lipschitz > 0.0) {
            return Err(SolverError::Numerical(format!("step bound {}", lipschitz)));
        }
        let step = 1.0 / lipschitz;
        let budget = options.budget();

        let mut x = match warm_start {
            Some(w) if w.len() == qp.dim() && w.iter().all(|v| v.is_finite()) => qp.project(w),
            _ => qp.project(&DVector::zeros(qp.dim())),
        };
        let mut y = x.clone();
        let mut t = 1.0_f64;

        for iteration in 1..=options.max_iterations {
            let gradient = &qp.hessian * &y + &qp.gradient;
            let next = qp.project(&(&y - gradient * step));
            if next.iter().any(|v| !v.is_finite()) {
                return Err(SolverError::Numerical(format!("iterate diverged at iteration {}", iteration)));
            }

            let residual = qp.residual(&next);
            if residual <= options.tolerance {
                let statistics = SolveStatistics {
                    iterations: iteration,
                    solve_time_ms: started.elapsed().as_secs_f64() * 1e3,
                    objective: qp.objective(&next),
                    residual,
                };
                debug!(
                    "qp converged in {} iterations ({:.3} ms)",
                    iteration, statistics.solve_time_ms
                );
                return Ok(QpSolution { x: next, statistics });
            }

            // Restart the momentum once it points uphill
            if (&y - &next).dot(&(&next - &x)) > 0.0 {
                t = 1.0;
                y = next.clone();
                self.restarts += 1;
            } else {
                let t_next = 0.5 * (1.0 + (1.0 + 4.0 * t * t).sqrt());
                y = &next + (&next - &x) * ((t - 1.0) / t_next);
                t = t_next;
            }
            x = next;

            if let Some(budget) = budget {
                if started.elapsed() > budget {
                    return Err(SolverError::Timeout {
                        budget_ms: budget.as_secs_f64() * 1e3,
                    });
                }
            }
        }
        Err(SolverError::MaxIterationsReached(options.max_iterations))
    }
}

#[cfg(feature = "osqp")]
mod osqp_backend {
    use std::time::Instant;

    use nalgebra::DVector;
    use osqp::{CscMatrix, Problem, Settings, Status};

    use super::{check_problem, QpSolution, QpSolver, SolveOptions, SolveStatistics, SolverError};
    use crate::ocp::BoxQp;

    /// OSQP operator-splitting backend
    #[derive(Debug, Default)]
    pub struct OsqpSolver;

    impl QpSolver for OsqpSolver {
        fn name(&self) -> &'static str {
            "osqp"
        }

        fn solve(
            &mut self,
            qp: &BoxQp,
            warm_start: Option<&DVector<f64>>,
            options: &SolveOptions,
        ) -> Result<QpSolution, SolverError> {
            let started = Instant::now();
            check_problem(qp)?;
            let n = qp.dim();

            // nalgebra storage is column-major
            let p = CscMatrix::from_column_iter_dense(n, n, qp.hessian.iter().copied()).into_upper_tri();
            let a = CscMatrix::from_column_iter_dense(
                n,
                n,
                (0..n * n).map(|k| if k % (n + 1) == 0 { 1.0 } else { 0.0 }),
            );

            let settings = Settings::default()
                .verbose(false)
                .eps_abs(options.tolerance)
                .eps_rel(options.tolerance)
                .max_iter(options.max_iterations as u32)
                .polish(true)
                .time_limit(options.budget());

            let mut problem = Problem::new(
                p,
                qp.gradient.as_slice(),
                a,
                qp.lower.as_slice(),
                qp.upper.as_slice(),
                &settings,
            )
            .map_err(|e| SolverError::Backend(format!("{:?}", e)))?;
            if let Some(w) = warm_start.filter(|w| w.len() == n) {
                problem.warm_start_x(w.as_slice());
            }

            match problem.solve() {
                Status::Solved(solution) => {
                    let x = qp.project(&DVector::from_column_slice(solution.x()));
                    let statistics = SolveStatistics {
                        iterations: solution.iter() as usize,
                        solve_time_ms: started.elapsed().as_secs_f64() * 1e3,
                        objective: qp.objective(&x),
                        residual: qp.residual(&x),
                    };
                    Ok(QpSolution { x, statistics })
                }
                Status::MaxIterationsReached(_) => Err(SolverError::MaxIterationsReached(options.max_iterations)),
                Status::PrimalInfeasible(_) | Status::PrimalInfeasibleInaccurate(_) => {
                    Err(SolverError::Infeasible {
                        index: 0,
                        lower: f64::NAN,
                        upper: f64::NAN,
                    })
                }
                Status::TimeLimitReached(_) => Err(SolverError::Timeout {
                    budget_ms: options.time_budget_ms.unwrap_or(0.0),
                }),
                _ => Err(SolverError::Backend("osqp did not return a solution".into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn unconstrained_qp() -> BoxQp {
        // minimize (x0 - 1)² + 2(x1 + 2)²
        BoxQp {
            hessian: DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]),
            gradient: DVector::from_column_slice(&[-2.0, 8.0]),
            lower: DVector::from_element(2, -10.0),
            upper: DVector::from_element(2, 10.0),
        }
    }

    fn options() -> SolveOptions {
        SolveOptions {
            time_budget_ms: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_unconstrained_minimum() {
        let mut solver = ProjectedGradientSolver::default();
        let solution = solver.solve(&unconstrained_qp(), None, &options()).unwrap();
        assert_relative_eq!(solution.x[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(solution.x[1], -2.0, epsilon = 1e-5);
        assert!(solution.statistics.residual <= 1e-6);
    }

    #[test]
    fn test_active_bounds() {
        let mut qp = unconstrained_qp();
        qp.lower[1] = -1.0;
        qp.upper[0] = 0.5;
        let solution = ProjectedGradientSolver::default().solve(&qp, None, &options()).unwrap();
        assert_relative_eq!(solution.x[0], 0.5, epsilon = 1e-9);
        assert_relative_eq!(solution.x[1], -1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_coupled_problem_matches_linear_solve() {
        let hessian = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let gradient = DVector::from_column_slice(&[1.0, -2.0, 0.5]);
        let expected = hessian.clone().cholesky().unwrap().solve(&(-&gradient));
        let qp = BoxQp {
            hessian,
            gradient,
            lower: DVector::from_element(3, -100.0),
            upper: DVector::from_element(3, 100.0),
        };
        let solution = ProjectedGradientSolver::default().solve(&qp, None, &options()).unwrap();
        assert_relative_eq!(solution.x, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_warm_start_at_optimum_returns_immediately() {
        let mut solver = ProjectedGradientSolver::default();
        let optimum = DVector::from_column_slice(&[1.0, -2.0]);
        let solution = solver.solve(&unconstrained_qp(), Some(&optimum), &options()).unwrap();
        assert_eq!(solution.statistics.iterations, 1);
    }

    #[test]
    fn test_inverted_bounds_infeasible() {
        let mut qp = unconstrained_qp();
        qp.lower[1] = 3.0;
        qp.upper[1] = 2.0;
        let err = ProjectedGradientSolver::default().solve(&qp, None, &options()).unwrap_err();
        assert!(matches!(err, SolverError::Infeasible { index: 1, .. }));
    }

    #[test]
    fn test_iteration_limit_reported() {
        let opts = SolveOptions {
            max_iterations: 1,
            tolerance: 0.0,
            time_budget_ms: None,
        };
        let err = ProjectedGradientSolver::default()
            .solve(&unconstrained_qp(), None, &opts)
            .unwrap_err();
        assert_eq!(err, SolverError::MaxIterationsReached(1));
    }

    #[test]
    fn test_non_finite_data_rejected() {
        let mut qp = unconstrained_qp();
        qp.gradient[0] = f64::NAN;
        let err = ProjectedGradientSolver::default().solve(&qp, None, &options()).unwrap_err();
        assert!(matches!(err, SolverError::Numerical(_)));
    }

    #[cfg(not(feature = "osqp"))]
    #[test]
    fn test_osqp_unavailable_without_feature() {
        assert!(matches!(solver_for(QpBackend::Osqp), Err(SolverError::Unavailable("osqp"))));
    }
}
