//! Sensor measurements and their observation models
//!
//! Every measurement carries the source it came from, the time it was
//! taken, and a tagged observation with its own value and uncertainty. The
//! observation knows how to predict itself from an estimator state vector
//! and how to linearize that prediction.

use nalgebra::{DMatrix, DVector, Matrix3};
use serde::{Deserialize, Serialize};

use crate::error::EstimatorError;
use crate::math::{euler_vector, wrap_angle};
use crate::state::{index, STATE_DIM};
use crate::{Quat, Vec3, GRAVITY};

/// Physical source of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorSource {
    /// External motion-capture system
    MotionCapture,
    /// Onboard inertial measurement unit
    Imu,
    /// Onboard barometer
    Barometer,
    /// Downward range sensor
    Rangefinder,
    /// Satellite navigation receiver
    Gps,
    /// Onboard state relayed over the telemetry link
    Telemetry,
}

/// Payload-free discriminant of [`Observation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObservationKind {
    Position,
    Velocity,
    Attitude,
    Imu,
    Altitude,
}

/// Observed quantity with its reported uncertainty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Observation {
    /// Position fix [m] (world frame)
    PositionFix { position: Vec3, covariance: Matrix3<f64> },
    /// Velocity fix [m/s] (world frame)
    VelocityFix { velocity: Vec3, covariance: Matrix3<f64> },
    /// Attitude fix; covariance is over roll/pitch/yaw [rad²]
    AttitudeFix { attitude: Quat, covariance: Matrix3<f64> },
    /// Accelerometer specific force [m/s²] and gyro rate [rad/s], body frame
    Imu {
        specific_force: Vec3,
        angular_rate: Vec3,
        accel_covariance: Matrix3<f64>,
        gyro_covariance: Matrix3<f64>,
    },
    /// Height above the world origin [m]
    Altitude { altitude: f64, variance: f64 },
}

/// One timestamped sample from one sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMeasurement {
    pub source: SensorSource,
    /// Time the sample was taken [s]
    pub timestamp: f64,
    pub observation: Observation,
}

impl SensorMeasurement {
    pub fn new(source: SensorSource, timestamp: f64, observation: Observation) -> Self {
        Self {
            source,
            timestamp,
            observation,
        }
    }

    /// Position fix with isotropic standard deviation `std_dev` [m]
    pub fn position(source: SensorSource, timestamp: f64, position: Vec3, std_dev: f64) -> Self {
        Self::new(
            source,
            timestamp,
            Observation::PositionFix {
                position,
                covariance: Matrix3::identity() * std_dev.powi(2),
            },
        )
    }

    pub fn velocity(source: SensorSource, timestamp: f64, velocity: Vec3, std_dev: f64) -> Self {
        Self::new(
            source,
            timestamp,
            Observation::VelocityFix {
                velocity,
                covariance: Matrix3::identity() * std_dev.powi(2),
            },
        )
    }

    pub fn attitude(source: SensorSource, timestamp: f64, attitude: Quat, std_dev: f64) -> Self {
        Self::new(
            source,
            timestamp,
            Observation::AttitudeFix {
                attitude,
                covariance: Matrix3::identity() * std_dev.powi(2),
            },
        )
    }

    pub fn imu(
        timestamp: f64,
        specific_force: Vec3,
        angular_rate: Vec3,
        accel_std: f64,
        gyro_std: f64,
    ) -> Self {
        Self::new(
            SensorSource::Imu,
            timestamp,
            Observation::Imu {
                specific_force,
                angular_rate,
                accel_covariance: Matrix3::identity() * accel_std.powi(2),
                gyro_covariance: Matrix3::identity() * gyro_std.powi(2),
            },
        )
    }

    pub fn altitude(source: SensorSource, timestamp: f64, altitude: f64, std_dev: f64) -> Self {
        Self::new(
            source,
            timestamp,
            Observation::Altitude {
                altitude,
                variance: std_dev.powi(2),
            },
        )
    }

    /// Whether this measurement can refresh the position-fix staleness clock
    pub fn is_position_fix(&self) -> bool {
        matches!(self.observation, Observation::PositionFix { .. })
    }

    /// Reject non-finite values and covariances that are not positive definite
    pub fn validate(&self) -> Result<(), EstimatorError> {
        if !self.timestamp.is_finite() || self.timestamp <= 0.0 {
            return Err(EstimatorError::InvalidMeasurement(format!(
                "{:?} timestamp {} is not a valid time",
                self.source, self.timestamp
            )));
        }
        let value = self.observation.value();
        if value.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::InvalidMeasurement(format!(
                "{:?} sample contains non-finite values",
                self.source
            )));
        }
        let noise = self.observation.noise();
        if noise.iter().any(|v| !v.is_finite()) || noise.cholesky().is_none() {
            return Err(EstimatorError::InvalidMeasurement(format!(
                "{:?} covariance is not positive definite",
                self.source
            )));
        }
        Ok(())
    }
}

impl Observation {
    pub fn kind(&self) -> ObservationKind {
        match self {
            Observation::PositionFix { .. } => ObservationKind::Position,
            Observation::VelocityFix { .. } => ObservationKind::Velocity,
            Observation::AttitudeFix { .. } => ObservationKind::Attitude,
            Observation::Imu { .. } => ObservationKind::Imu,
            Observation::Altitude { .. } => ObservationKind::Altitude,
        }
    }

    /// Measurement dimension
    pub fn dim(&self) -> usize {
        match self {
            Observation::Imu { .. } => 6,
            Observation::Altitude { .. } => 1,
            _ => 3,
        }
    }

    /// Measured value z
    pub fn value(&self) -> DVector<f64> {
        match self {
            Observation::PositionFix { position, .. } => DVector::from_column_slice(position.as_slice()),
            Observation::VelocityFix { velocity, .. } => DVector::from_column_slice(velocity.as_slice()),
            Observation::AttitudeFix { attitude, .. } => {
                DVector::from_column_slice(euler_vector(attitude).as_slice())
            }
            Observation::Imu {
                specific_force,
                angular_rate,
                ..
            } => DVector::from_iterator(6, specific_force.iter().chain(angular_rate.iter()).copied()),
            Observation::Altitude { altitude, .. } => DVector::from_element(1, *altitude),
        }
    }

    /// Measurement noise covariance R
    pub fn noise(&self) -> DMatrix<f64> {
        match self {
            Observation::PositionFix { covariance, .. }
            | Observation::VelocityFix { covariance, .. }
            | Observation::AttitudeFix { covariance, .. } => {
                DMatrix::from_column_slice(3, 3, covariance.as_slice())
            }
            Observation::Imu {
                accel_covariance,
                gyro_covariance,
                ..
            } => {
                let mut r = DMatrix::zeros(6, 6);
                r.fixed_view_mut::<3, 3>(0, 0).copy_from(accel_covariance);
                r.fixed_view_mut::<3, 3>(3, 3).copy_from(gyro_covariance);
                r
            }
            Observation::Altitude { variance, .. } => DMatrix::from_element(1, 1, *variance),
        }
    }

    /// Predicted measurement h(x)
    ///
    /// The accelerometer model assumes the vehicle is not accelerating, so it
    /// observes gravity rotated into the body frame plus the accelerometer
    /// bias: g·[-sinθ, sinφ cosθ, cosφ cosθ] + b_a.
    pub fn predict(&self, x: &DVector<f64>) -> DVector<f64> {
        match self {
            Observation::PositionFix { .. } => x.rows(index::POSITION, 3).into_owned(),
            Observation::VelocityFix { .. } => x.rows(index::VELOCITY, 3).into_owned(),
            Observation::AttitudeFix { .. } => x.rows(index::ATTITUDE, 3).into_owned(),
            Observation::Imu { .. } => {
                let (roll, pitch) = (x[index::ATTITUDE], x[index::ATTITUDE + 1]);
                let mut z = DVector::zeros(6);
                z[0] = -GRAVITY * pitch.sin() + x[index::ACCEL_BIAS];
                z[1] = GRAVITY * roll.sin() * pitch.cos() + x[index::ACCEL_BIAS + 1];
                z[2] = GRAVITY * roll.cos() * pitch.cos() + x[index::ACCEL_BIAS + 2];
                for i in 0..3 {
                    z[3 + i] = x[index::ANGULAR_RATE + i] + x[index::GYRO_BIAS + i];
                }
                z
            }
            Observation::Altitude { .. } => DVector::from_element(1, x[index::POSITION + 2]),
        }
    }

    /// Jacobian H = ∂h/∂x evaluated at `x`
    pub fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        let mut h = DMatrix::zeros(self.dim(), STATE_DIM);
        match self {
            Observation::PositionFix { .. } => {
                h.fixed_view_mut::<3, 3>(0, index::POSITION).fill_with_identity();
            }
            Observation::VelocityFix { .. } => {
                h.fixed_view_mut::<3, 3>(0, index::VELOCITY).fill_with_identity();
            }
            Observation::AttitudeFix { .. } => {
                h.fixed_view_mut::<3, 3>(0, index::ATTITUDE).fill_with_identity();
            }
            Observation::Imu { .. } => {
                let (roll, pitch) = (x[index::ATTITUDE], x[index::ATTITUDE + 1]);
                let (sr, cr) = roll.sin_cos();
                let (sp, cp) = pitch.sin_cos();

                // ∂/∂roll
                h[(1, index::ATTITUDE)] = GRAVITY * cr * cp;
                h[(2, index::ATTITUDE)] = -GRAVITY * sr * cp;
                // ∂/∂pitch
                h[(0, index::ATTITUDE + 1)] = -GRAVITY * cp;
                h[(1, index::ATTITUDE + 1)] = -GRAVITY * sr * sp;
                h[(2, index::ATTITUDE + 1)] = -GRAVITY * cr * sp;

                h.fixed_view_mut::<3, 3>(0, index::ACCEL_BIAS).fill_with_identity();
                h.fixed_view_mut::<3, 3>(3, index::ANGULAR_RATE).fill_with_identity();
                h.fixed_view_mut::<3, 3>(3, index::GYRO_BIAS).fill_with_identity();
            }
            Observation::Altitude { .. } => {
                h[(0, index::POSITION + 2)] = 1.0;
            }
        }
        h
    }

    /// Innovation z - h(x), with angle components wrapped to (-π, π]
    pub fn innovation(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = self.value() - self.predict(x);
        if let Observation::AttitudeFix { .. } = self {
            for v in y.iter_mut() {
                *v = wrap_angle(*v);
            }
        }
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VehicleState;
    use approx::assert_relative_eq;

    fn numeric_jacobian(obs: &Observation, x: &DVector<f64>) -> DMatrix<f64> {
        let eps = 1e-6;
        let mut jac = DMatrix::zeros(obs.dim(), STATE_DIM);
        for j in 0..STATE_DIM {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[j] += eps;
            xm[j] -= eps;
            let column = (obs.predict(&xp) - obs.predict(&xm)) / (2.0 * eps);
            jac.set_column(j, &column);
        }
        jac
    }

    #[test]
    fn test_imu_jacobian_matches_finite_difference() {
        let mut state = VehicleState::at_rest(Vec3::new(0.0, 0.0, 1.0));
        state.attitude = Quat::from_euler_angles(0.2, -0.1, 0.7);
        state.accel_bias = Vec3::new(0.05, -0.02, 0.01);
        let x = state.to_vector();
        let obs = SensorMeasurement::imu(0.0, Vec3::zeros(), Vec3::zeros(), 0.1, 0.01).observation;

        assert_relative_eq!(obs.jacobian(&x), numeric_jacobian(&obs, &x), epsilon = 1e-6);
    }

    #[test]
    fn test_level_imu_sees_gravity() {
        let x = VehicleState::default().to_vector();
        let obs = SensorMeasurement::imu(0.0, Vec3::zeros(), Vec3::zeros(), 0.1, 0.01).observation;

        let z = obs.predict(&x);
        assert_relative_eq!(z[2], GRAVITY, epsilon = 1e-12);
        assert_relative_eq!(z[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_attitude_innovation_wraps() {
        let mut state = VehicleState::default();
        state.attitude = Quat::from_euler_angles(0.0, 0.0, 3.1);
        let x = state.to_vector();
        let fix = SensorMeasurement::attitude(
            SensorSource::MotionCapture,
            0.0,
            Quat::from_euler_angles(0.0, 0.0, -3.1),
            0.01,
        );

        let y = fix.observation.innovation(&x);
        assert_relative_eq!(y[2], 2.0 * std::f64::consts::PI - 6.2, epsilon = 1e-9);
    }

    #[test]
    fn test_validation_rejects_bad_samples() {
        let good = SensorMeasurement::position(SensorSource::MotionCapture, 1.0, Vec3::zeros(), 0.01);
        assert!(good.validate().is_ok());

        let nan = SensorMeasurement::position(SensorSource::MotionCapture, 1.0, Vec3::new(f64::NAN, 0.0, 0.0), 0.01);
        assert!(matches!(nan.validate(), Err(EstimatorError::InvalidMeasurement(_))));

        let singular = SensorMeasurement::position(SensorSource::MotionCapture, 1.0, Vec3::zeros(), 0.0);
        assert!(singular.validate().is_err());

        let unstamped = SensorMeasurement::altitude(SensorSource::Barometer, f64::NAN, 1.0, 0.1);
        assert!(unstamped.validate().is_err());

        let at_origin = SensorMeasurement::position(SensorSource::MotionCapture, 0.0, Vec3::zeros(), 0.01);
        assert!(at_origin.validate().is_err());
        let negative = SensorMeasurement::position(SensorSource::MotionCapture, -0.5, Vec3::zeros(), 0.01);
        assert!(negative.validate().is_err());
    }
}
