//! Receding-horizon MPC
//!
//! Each tick the condensed tracking problem is rebuilt from the freshest
//! state estimate and solved; only the first acceleration of the plan is
//! applied, through the same attitude and rate loops the PID cascade uses.
//!
//! When the solver fails the controller keeps flying on the last good
//! acceleration for a few ticks, then decays it geometrically toward zero
//! (hover), raising a `ControlFault` on every failed tick.

use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crazyfly_core::control::{CascadeConfig, InnerLoops};
use crazyfly_core::dynamics::VehicleParams;
use crazyfly_core::error::ControllerKind;
use crazyfly_core::{ActuatorCommand, ConfigError, ControlReference, Fault, Vec3, VehicleState};

use crate::ocp::{AccelerationBounds, TrackingProblem, TrackingWeights, INPUT_DIM};
use crate::solver::{solver_for, QpBackend, QpSolver, SolveOptions, SolveStatistics, SolverError};

/// MPC errors
#[derive(Debug, Error)]
pub enum MpcError {
    #[error("invalid MPC configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("solver error: {0}")]
    Solver(#[from] SolverError),
}

/// What to command while the optimizer keeps failing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    /// Consecutive failures during which the last good command is held
    pub hold_ticks: usize,
    /// Per-tick decay toward hover once the hold has expired
    pub decay: f64,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            hold_ticks: 3,
            decay: 0.8,
        }
    }
}

impl FallbackPolicy {
    /// Fallback acceleration after `failures` consecutive failed solves
    pub fn acceleration(&self, last_good: Option<Vec3>, failures: usize) -> Vec3 {
        let Some(last_good) = last_good else {
            return Vec3::zeros();
        };
        if failures <= self.hold_ticks {
            return last_good;
        }
        let excess = (failures - self.hold_ticks).min(i32::MAX as usize) as i32;
        last_good * self.decay.powi(excess)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    /// Prediction horizon [steps]
    pub horizon: usize,
    /// Prediction step [s]
    pub step: f64,
    pub weights: TrackingWeights,
    /// Horizontal acceleration limit [m/s²]
    pub max_horizontal_acceleration: f64,
    /// Vertical acceleration limit [m/s²], further limited by the thrust envelope
    pub max_vertical_acceleration: f64,
    pub backend: QpBackend,
    pub solver: SolveOptions,
    /// Seed each solve with the previous plan shifted by one step
    pub warm_start: bool,
    pub fallback: FallbackPolicy,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            horizon: 10,
            step: 0.1,
            weights: TrackingWeights::default(),
            max_horizontal_acceleration: 4.0,
            max_vertical_acceleration: 5.0,
            backend: QpBackend::default(),
            solver: SolveOptions::default(),
            warm_start: true,
            fallback: FallbackPolicy::default(),
        }
    }
}

impl MpcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.horizon > 0, "mpc.horizon", "must be at least one step")?;
        ConfigError::check(self.step > 0.0 && self.step.is_finite(), "mpc.step", "must be positive")?;
        self.weights.validate()?;
        ConfigError::check(
            self.max_horizontal_acceleration > 0.0,
            "mpc.max_horizontal_acceleration",
            "must be positive",
        )?;
        ConfigError::check(
            self.max_vertical_acceleration > 0.0,
            "mpc.max_vertical_acceleration",
            "must be positive",
        )?;
        ConfigError::check(self.solver.max_iterations > 0, "mpc.solver.max_iterations", "must be positive")?;
        ConfigError::check(self.solver.tolerance > 0.0, "mpc.solver.tolerance", "must be positive")?;
        if let Some(budget) = self.solver.time_budget_ms {
            ConfigError::check(budget > 0.0, "mpc.solver.time_budget_ms", "must be positive")?;
        }
        ConfigError::check(
            (0.0..1.0).contains(&self.fallback.decay),
            "mpc.fallback.decay",
            "must be in [0, 1)",
        )
    }
}

/// How the applied acceleration was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpcStatus {
    Solved,
    Fallback { consecutive_failures: usize },
}

#[derive(Debug, Clone)]
pub struct MpcOutput {
    pub command: ActuatorCommand,
    /// Acceleration handed to the inner loops, augmentation included
    pub acceleration: Vec3,
    /// Planned accelerations over the horizon; empty on fallback
    pub plan: Vec<Vec3>,
    pub status: MpcStatus,
    pub fault: Option<Fault>,
    pub statistics: Option<SolveStatistics>,
}

/// Running solve statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MpcStats {
    pub solves: usize,
    pub failures: usize,
    pub total_iterations: usize,
    pub max_solve_time_ms: f64,
    pub last: Option<SolveStatistics>,
}

pub struct MpcController {
    config: MpcConfig,
    problem: TrackingProblem,
    solver: Box<dyn QpSolver>,
    inner: InnerLoops,
    warm_start: Option<DVector<f64>>,
    last_good: Option<Vec3>,
    failures: usize,
    stats: MpcStats,
}

impl MpcController {
    /// Controller using the configured QP backend
    pub fn new(config: MpcConfig, cascade: &CascadeConfig, params: &VehicleParams) -> Result<Self, MpcError> {
        let solver = solver_for(config.backend)?;
        Self::with_solver(config, cascade, params, solver)
    }

    pub fn with_solver(
        config: MpcConfig,
        cascade: &CascadeConfig,
        params: &VehicleParams,
        solver: Box<dyn QpSolver>,
    ) -> Result<Self, MpcError> {
        config.validate()?;
        cascade.validate()?;
        params.validate()?;
        let bounds = AccelerationBounds::new(
            config.max_horizontal_acceleration,
            config.max_vertical_acceleration,
            &params.envelope(),
            params.mass,
        );
        let problem = TrackingProblem::new(config.horizon, config.step, &config.weights, bounds)?;
        debug!(
            "mpc: horizon {} x {:.3} s, {} backend, bounds {:?}..{:?}",
            config.horizon,
            config.step,
            solver.name(),
            bounds.lower.as_slice(),
            bounds.upper.as_slice()
        );
        Ok(Self {
            problem,
            solver,
            inner: InnerLoops::new(cascade, params),
            warm_start: None,
            last_good: None,
            failures: 0,
            stats: MpcStats::default(),
            config,
        })
    }

    /// Solve the horizon problem for `state`; returns the planned accelerations
    pub fn plan(
        &mut self,
        state: &VehicleState,
        reference: &ControlReference,
    ) -> Result<(Vec<Vec3>, SolveStatistics), SolverError> {
        if !state.is_finite() {
            return Err(SolverError::Numerical("non-finite state estimate".into()));
        }
        let z0 = TrackingProblem::initial_state(state);
        let zref = self.problem.reference_stack(reference);
        let qp = self.problem.build(&z0, &zref);

        let warm = if self.config.warm_start { self.warm_start.as_ref() } else { None };
        let solution = self.solver.solve(&qp, warm, &self.config.solver)?;
        if !qp.contains(&solution.x, 1e-9) {
            return Err(SolverError::Numerical("solution violates the acceleration bounds".into()));
        }

        self.warm_start = Some(shift(&solution.x));
        Ok((TrackingProblem::unstack(&solution.x), solution.statistics))
    }

    pub fn compute(&mut self, state: &VehicleState, reference: &ControlReference, dt: f64) -> MpcOutput {
        self.compute_augmented(state, reference, dt, |a| a)
    }

    /// Plan, pick the first acceleration (or the fallback) and run the inner
    /// loops on `augment` of it
    pub fn compute_augmented(
        &mut self,
        state: &VehicleState,
        reference: &ControlReference,
        dt: f64,
        augment: impl FnOnce(Vec3) -> Vec3,
    ) -> MpcOutput {
        let (nominal, plan, status, fault, statistics) = match self.plan(state, reference) {
            Ok((plan, statistics)) => {
                self.stats.solves += 1;
                self.stats.total_iterations += statistics.iterations;
                self.stats.max_solve_time_ms = self.stats.max_solve_time_ms.max(statistics.solve_time_ms);
                self.stats.last = Some(statistics.clone());
                if self.failures > 0 {
                    debug!("mpc recovered after {} failed solves", self.failures);
                }
                self.failures = 0;

                let first = plan.first().copied().unwrap_or_else(Vec3::zeros);
                self.last_good = Some(first);
                (first, plan, MpcStatus::Solved, None, Some(statistics))
            }
            Err(err) => {
                self.failures += 1;
                self.stats.failures += 1;
                self.warm_start = None;
                warn!("mpc solve failed ({} in a row): {}", self.failures, err);

                let fallback = self.config.fallback.acceleration(self.last_good, self.failures);
                let fault = Fault::ControlFault {
                    controller: ControllerKind::Mpc,
                    reason: err.to_string(),
                };
                let status = MpcStatus::Fallback {
                    consecutive_failures: self.failures,
                };
                (fallback, Vec::new(), status, Some(fault), None)
            }
        };

        let acceleration = augment(nominal);
        let inner = self.inner.track_acceleration(state, &acceleration, reference.yaw, dt);
        MpcOutput {
            command: inner.command,
            acceleration,
            plan,
            status,
            fault,
            statistics,
        }
    }

    /// Forget the warm start, fallback memory and inner-loop integrators
    pub fn reset(&mut self) {
        self.inner.reset();
        self.warm_start = None;
        self.last_good = None;
        self.failures = 0;
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn problem(&self) -> &TrackingProblem {
        &self.problem
    }

    pub fn stats(&self) -> &MpcStats {
        &self.stats
    }

    pub fn consecutive_failures(&self) -> usize {
        self.failures
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }
}

/// Drop the first step of a plan and repeat the last one
fn shift(u: &DVector<f64>) -> DVector<f64> {
    let n = u.len();
    if n <= INPUT_DIM {
        return u.clone();
    }
    DVector::from_fn(n, |i, _| u[(i + INPUT_DIM).min(n - INPUT_DIM + i % INPUT_DIM)])
}
