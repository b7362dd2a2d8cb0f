//! Receding-horizon tracking problem
//!
//! The translational dynamics are modelled as a double integrator driven by
//! the world-frame acceleration command (gravity already compensated by the
//! inner loops):
//!
//! ```text
//! zₖ = [pₖ, vₖ]
//! pₖ₊₁ = pₖ + vₖ·Δt + ½·uₖ·Δt²
//! vₖ₊₁ = vₖ + uₖ·Δt
//! ```
//!
//! Over a horizon of `H` steps the states are eliminated ("condensed") so the
//! only decision variables are the `3H` accelerations:
//!
//! ```text
//! Z = Sx·z₀ + Su·U
//! minimize    ½·Uᵀ(Suᵀ Q̄ Su + R̄)U + Uᵀ Suᵀ Q̄ (Sx·z₀ − Zref)
//! subject to  lower ≤ U ≤ upper
//! ```
//!
//! where `Q̄` applies the stage weights to z₁…z_{H−1} and the terminal weight
//! to z_H.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crazyfly_core::{ConfigError, ControlReference, Vec3, VehicleState, GRAVITY};
use crazyfly_core::state::ActuatorEnvelope;

/// Translational state dimension [p, v]
pub const STATE_DIM: usize = 6;
/// Acceleration command dimension
pub const INPUT_DIM: usize = 3;

/// Box-constrained quadratic program
///
/// minimize ½·xᵀHx + gᵀx subject to lower ≤ x ≤ upper
#[derive(Debug, Clone)]
pub struct BoxQp {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl BoxQp {
    pub fn dim(&self) -> usize {
        self.gradient.len()
    }

    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.hessian * x)) + self.gradient.dot(x)
    }

    /// Clamp `x` into the box
    pub fn project(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(self.dim(), |i, _| x[i].clamp(self.lower[i], self.upper[i]))
    }

    pub fn contains(&self, x: &DVector<f64>, tolerance: f64) -> bool {
        x.len() == self.dim()
            && x.iter()
                .enumerate()
                .all(|(i, v)| v.is_finite() && *v >= self.lower[i] - tolerance && *v <= self.upper[i] + tolerance)
    }

    /// Infinity norm of the projected-gradient step, zero at the optimum
    pub fn residual(&self, x: &DVector<f64>) -> f64 {
        let gradient = &self.hessian * x + &self.gradient;
        (x - self.project(&(x - gradient))).amax()
    }
}

/// Tracking cost weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingWeights {
    pub position: f64,
    pub velocity: f64,
    /// Acceleration effort
    pub effort: f64,
    /// Terminal weight as a multiple of the stage weight
    pub terminal_scale: f64,
}

impl Default for TrackingWeights {
    fn default() -> Self {
        Self {
            position: 10.0,
            velocity: 5.0,
            effort: 0.1,
            terminal_scale: 2.0,
        }
    }
}

impl TrackingWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(
            self.position >= 0.0 && self.velocity >= 0.0 && self.terminal_scale >= 0.0,
            "mpc.weights",
            "tracking weights must be non-negative",
        )?;
        ConfigError::check(self.effort > 0.0, "mpc.weights.effort", "must be positive")
    }
}

/// Per-axis acceleration limits [m/s²]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerationBounds {
    pub lower: Vec3,
    pub upper: Vec3,
}

impl AccelerationBounds {
    /// Symmetric horizontal limit and a vertical limit further restricted to
    /// what the thrust envelope can produce
    pub fn new(max_horizontal: f64, max_vertical: f64, envelope: &ActuatorEnvelope, mass: f64) -> Self {
        let climb = (envelope.max_thrust / mass - GRAVITY).min(max_vertical);
        let sink = (envelope.min_thrust / mass - GRAVITY).max(-max_vertical);
        Self {
            lower: Vec3::new(-max_horizontal, -max_horizontal, sink),
            upper: Vec3::new(max_horizontal, max_horizontal, climb),
        }
    }

    pub fn clamp(&self, acceleration: &Vec3) -> Vec3 {
        Vec3::from_fn(|i, _| acceleration[i].clamp(self.lower[i], self.upper[i]))
    }

    pub fn contains(&self, acceleration: &Vec3, tolerance: f64) -> bool {
        (0..3).all(|i| {
            acceleration[i] >= self.lower[i] - tolerance && acceleration[i] <= self.upper[i] + tolerance
        })
    }
}

/// Condensed tracking problem with precomputed prediction matrices
#[derive(Debug, Clone)]
pub struct TrackingProblem {
    horizon: usize,
    step: f64,
    bounds: AccelerationBounds,
    /// Free response, (6H × 6)
    sx: DMatrix<f64>,
    /// Forced response, (6H × 3H)
    su: DMatrix<f64>,
    /// Suᵀ Q̄, (3H × 6H)
    su_t_q: DMatrix<f64>,
    hessian: DMatrix<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl TrackingProblem {
    pub fn new(
        horizon: usize,
        step: f64,
        weights: &TrackingWeights,
        bounds: AccelerationBounds,
    ) -> Result<Self, ConfigError> {
        ConfigError::check(horizon > 0, "mpc.horizon", "must be at least 1")?;
        ConfigError::check(step.is_finite() && step > 0.0, "mpc.step", "must be positive")?;
        weights.validate()?;
        ConfigError::check(
            (0..3).all(|i| bounds.lower[i] <= bounds.upper[i]),
            "mpc.bounds",
            "acceleration bounds are empty",
        )?;

        let n = STATE_DIM * horizon;
        let m = INPUT_DIM * horizon;
        let half_dt2 = 0.5 * step * step;

        let mut sx = DMatrix::zeros(n, STATE_DIM);
        let mut su = DMatrix::zeros(n, m);
        for k in 0..horizon {
            let row = STATE_DIM * k;
            let elapsed = (k + 1) as f64 * step;
            for axis in 0..3 {
                sx[(row + axis, axis)] = 1.0;
                sx[(row + axis, axis + 3)] = elapsed;
                sx[(row + axis + 3, axis + 3)] = 1.0;
            }
            // Input j reaches z_{k+1} through A^{k-j}·B
            for j in 0..=k {
                let col = INPUT_DIM * j;
                let lag = (k - j) as f64;
                for axis in 0..3 {
                    su[(row + axis, col + axis)] = half_dt2 + lag * step * step;
                    su[(row + axis + 3, col + axis)] = step;
                }
            }
        }

        let q_bar = DVector::from_fn(n, |i, _| {
            let scale = if i / STATE_DIM == horizon - 1 { weights.terminal_scale } else { 1.0 };
            let weight = if i % STATE_DIM < 3 { weights.position } else { weights.velocity };
            weight * scale
        });
        let mut su_t_q = su.transpose();
        for (j, mut column) in su_t_q.column_iter_mut().enumerate() {
            column *= q_bar[j];
        }
        let hessian = &su_t_q * &su + DMatrix::identity(m, m) * weights.effort;

        let lower = DVector::from_fn(m, |i, _| bounds.lower[i % INPUT_DIM]);
        let upper = DVector::from_fn(m, |i, _| bounds.upper[i % INPUT_DIM]);

        Ok(Self {
            horizon,
            step,
            bounds,
            sx,
            su,
            su_t_q,
            hessian,
            lower,
            upper,
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn bounds(&self) -> &AccelerationBounds {
        &self.bounds
    }

    /// [p, v] of a vehicle state
    pub fn initial_state(state: &VehicleState) -> DVector<f64> {
        let mut z = DVector::zeros(STATE_DIM);
        z.fixed_rows_mut::<3>(0).copy_from(&state.position);
        z.fixed_rows_mut::<3>(3).copy_from(&state.velocity);
        z
    }

    /// Stacked references for z₁…z_H
    ///
    /// The reference's preview supplies one point per step; without a preview
    /// the setpoint is held over the whole horizon.
    pub fn reference_stack(&self, reference: &ControlReference) -> DVector<f64> {
        let mut stack = DVector::zeros(STATE_DIM * self.horizon);
        for k in 0..self.horizon {
            let point = reference.point_at(k);
            stack.fixed_rows_mut::<3>(STATE_DIM * k).copy_from(&point.position);
            stack.fixed_rows_mut::<3>(STATE_DIM * k + 3).copy_from(&point.velocity);
        }
        stack
    }

    /// The QP for initial state `z0` and stacked reference `zref`
    pub fn build(&self, z0: &DVector<f64>, zref: &DVector<f64>) -> BoxQp {
        let free = &self.sx * z0 - zref;
        BoxQp {
            hessian: self.hessian.clone(),
            gradient: &self.su_t_q * free,
            lower: self.lower.clone(),
            upper: self.upper.clone(),
        }
    }

    /// Predicted state trajectory z₁…z_H under the inputs `u`
    pub fn predict(&self, z0: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.sx * z0 + &self.su * u
    }

    /// Split stacked inputs into per-step accelerations
    pub fn unstack(u: &DVector<f64>) -> Vec<Vec3> {
        u.as_slice()
            .chunks_exact(INPUT_DIM)
            .map(|c| Vec3::new(c[0], c[1], c[2]))
            .collect()
    }
}
