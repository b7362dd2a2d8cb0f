//! Recursive estimator contract
//!
//! Both estimators run the same predict/update cycle over the 18-entry
//! state vector laid out in [`crate::state::index`], share one motion model
//! and report their belief through [`Estimate`].

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EstimatorError, EstimatorKind};
use crate::estimation::SensorMeasurement;
use crate::state::{index, wrap_attitude, VehicleState, STATE_DIM};

/// Predict/update cycle shared by every estimator
pub trait RecursiveEstimator {
    fn kind(&self) -> EstimatorKind;

    /// Advance state and uncertainty by `dt > 0` seconds
    ///
    /// Returns [`EstimatorError::Diverged`] when the uncertainty ceiling had
    /// to be enforced; the state has still been advanced in that case.
    fn predict(&mut self, dt: f64) -> Result<(), EstimatorError>;

    /// Correct the belief with one measurement
    ///
    /// Returns the Mahalanobis distance of the innovation on success.
    fn update(&mut self, measurement: &SensorMeasurement) -> Result<f64, EstimatorError>;

    /// Mahalanobis distance the measurement would have, without applying it
    fn innovation_distance(&self, measurement: &SensorMeasurement) -> Result<f64, EstimatorError>;

    fn current_estimate(&self) -> Estimate;

    /// Restart from a known state and covariance
    fn reset(&mut self, state: &VehicleState, covariance: &DMatrix<f64>);
}

/// Snapshot of an estimator's belief
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub state: VehicleState,
    /// Full state covariance (a copy; the estimator keeps its own)
    pub covariance: DMatrix<f64>,
    /// Trace of the position covariance block [m²]
    pub uncertainty: f64,
    /// `1 / (1 + uncertainty)`, in [0, 1]
    pub confidence: f64,
}

impl Estimate {
    pub fn from_moments(mean: &DVector<f64>, covariance: DMatrix<f64>) -> Self {
        let uncertainty = (0..3)
            .map(|i| covariance[(index::POSITION + i, index::POSITION + i)])
            .sum::<f64>()
            .max(0.0);
        let confidence = if uncertainty.is_finite() {
            (1.0 / (1.0 + uncertainty)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            state: VehicleState::from_vector(mean),
            covariance,
            uncertainty,
            confidence,
        }
    }
}

/// One variance per state block
///
/// Used both for initial uncertainty [unit²] and for process-noise spectral
/// densities [unit²/s].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockVariances {
    pub position: f64,
    pub velocity: f64,
    pub attitude: f64,
    pub angular_rate: f64,
    pub gyro_bias: f64,
    pub accel_bias: f64,
}

impl BlockVariances {
    /// Default initial uncertainty
    pub fn initial() -> Self {
        Self {
            position: 1.0,
            velocity: 1.0,
            attitude: 0.1,
            angular_rate: 0.1,
            gyro_bias: 1e-2,
            accel_bias: 1e-1,
        }
    }

    /// Default process-noise densities
    pub fn process() -> Self {
        Self {
            position: 1e-4,
            velocity: 0.5,
            attitude: 1e-3,
            angular_rate: 1.0,
            gyro_bias: 1e-6,
            accel_bias: 1e-5,
        }
    }

    pub fn uniform(variance: f64) -> Self {
        Self {
            position: variance,
            velocity: variance,
            attitude: variance,
            angular_rate: variance,
            gyro_bias: variance,
            accel_bias: variance,
        }
    }

    pub fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        let values = [
            self.position,
            self.velocity,
            self.attitude,
            self.angular_rate,
            self.gyro_bias,
            self.accel_bias,
        ];
        ConfigError::check(
            values.iter().all(|v| v.is_finite() && *v >= 0.0),
            field,
            "variances must be finite and non-negative",
        )
    }

    /// Expand to a full-state diagonal
    pub fn diagonal(&self) -> DVector<f64> {
        let mut d = DVector::zeros(STATE_DIM);
        let blocks = [
            (index::POSITION, self.position),
            (index::VELOCITY, self.velocity),
            (index::ATTITUDE, self.attitude),
            (index::ANGULAR_RATE, self.angular_rate),
            (index::GYRO_BIAS, self.gyro_bias),
            (index::ACCEL_BIAS, self.accel_bias),
        ];
        for (offset, value) in blocks {
            d.rows_mut(offset, 3).fill(value);
        }
        d
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&self.diagonal())
    }

    /// Discrete process noise `Q = diag(densities) · dt`
    pub fn process_noise(&self, dt: f64) -> DMatrix<f64> {
        DMatrix::from_diagonal(&(self.diagonal() * dt))
    }
}

/// Motion model
///
/// Constant velocity and constant body rate. Roll/pitch/yaw advance by the
/// body rate (small-angle kinematics), biases follow a random walk.
pub fn propagate(x: &DVector<f64>, dt: f64) -> DVector<f64> {
    let mut next = x.clone();
    for i in 0..3 {
        next[index::POSITION + i] += x[index::VELOCITY + i] * dt;
        next[index::ATTITUDE + i] += x[index::ANGULAR_RATE + i] * dt;
    }
    wrap_attitude(&mut next);
    next
}

/// Jacobian of [`propagate`]
pub fn transition_matrix(dt: f64) -> DMatrix<f64> {
    let mut f = DMatrix::identity(STATE_DIM, STATE_DIM);
    for i in 0..3 {
        f[(index::POSITION + i, index::VELOCITY + i)] = dt;
        f[(index::ATTITUDE + i, index::ANGULAR_RATE + i)] = dt;
    }
    f
}

pub(crate) fn check_time_step(dt: f64) -> Result<(), EstimatorError> {
    if dt.is_finite() && dt > 0.0 {
        Ok(())
    } else {
        Err(EstimatorError::InvalidTimeStep(dt))
    }
}

/// Mahalanobis distance `sqrt(yᵀ S⁻¹ y)`
pub fn mahalanobis(innovation: &DVector<f64>, covariance: &DMatrix<f64>) -> Result<f64, EstimatorError> {
    let chol = covariance
        .clone()
        .cholesky()
        .ok_or(EstimatorError::SingularInnovation)?;
    let weighted = chol.solve(innovation);
    Ok(innovation.dot(&weighted).max(0.0).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_propagate_matches_transition() {
        let mut x = DVector::zeros(STATE_DIM);
        x[index::VELOCITY] = 1.0;
        x[index::VELOCITY + 2] = -0.5;
        x[index::ANGULAR_RATE + 2] = 0.2;

        let dt = 0.1;
        let linear = transition_matrix(dt) * &x;
        assert_relative_eq!(propagate(&x, dt), linear, epsilon = 1e-12);
    }

    #[test]
    fn test_propagate_wraps_yaw() {
        let mut x = DVector::zeros(STATE_DIM);
        x[index::ATTITUDE + 2] = 3.1;
        x[index::ANGULAR_RATE + 2] = 1.0;

        let next = propagate(&x, 0.1);
        assert!(next[index::ATTITUDE + 2] < 0.0);
    }

    #[test]
    fn test_mahalanobis_scales_with_covariance() {
        let y = DVector::from_vec(vec![2.0, 0.0]);
        let s = DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 1.0]));
        assert_relative_eq!(mahalanobis(&y, &s).unwrap(), 1.0, epsilon = 1e-12);

        let singular = DMatrix::zeros(2, 2);
        assert_eq!(mahalanobis(&y, &singular), Err(EstimatorError::SingularInnovation));
    }

    #[test]
    fn test_confidence_summary() {
        let x = VehicleState::default().to_vector();
        let estimate = Estimate::from_moments(&x, BlockVariances::uniform(1.0).covariance());
        assert_relative_eq!(estimate.uncertainty, 3.0);
        assert_relative_eq!(estimate.confidence, 0.25);
    }
}
