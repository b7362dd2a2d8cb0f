//! Vehicle data model
//!
//! The state shared between estimators and controllers, the reference the
//! controllers track, and the actuator command handed to the outside world.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::math::{euler_vector, quaternion_from_euler_vector, wrap_angle};
use crate::{Quat, Vec3};

/// Offsets of each block inside the estimator state vector
///
/// `[position, velocity, roll/pitch/yaw, body rates, gyro bias, accel bias]`
pub mod index {
    pub const POSITION: usize = 0;
    pub const VELOCITY: usize = 3;
    pub const ATTITUDE: usize = 6;
    pub const ANGULAR_RATE: usize = 9;
    pub const GYRO_BIAS: usize = 12;
    pub const ACCEL_BIAS: usize = 15;
}

/// Dimension of the estimator state vector
pub const STATE_DIM: usize = 18;

/// Full vehicle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// Position [m] (world frame, ENU)
    pub position: Vec3,
    /// Velocity [m/s] (world frame)
    pub velocity: Vec3,
    /// Orientation (body to world), kept normalized
    pub attitude: Quat,
    /// Angular rate [rad/s] (body frame)
    pub angular_rate: Vec3,
    /// Gyroscope bias [rad/s]
    pub gyro_bias: Vec3,
    /// Accelerometer bias [m/s²]
    pub accel_bias: Vec3,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            attitude: Quat::identity(),
            angular_rate: Vec3::zeros(),
            gyro_bias: Vec3::zeros(),
            accel_bias: Vec3::zeros(),
        }
    }
}

impl VehicleState {
    /// Level, motionless vehicle at `position`
    pub fn at_rest(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Roll, pitch and yaw [rad]
    pub fn euler(&self) -> Vec3 {
        euler_vector(&self.attitude)
    }

    pub fn yaw(&self) -> f64 {
        self.euler().z
    }

    /// Replace the attitude, renormalizing it
    pub fn set_attitude(&mut self, attitude: Quat) {
        self.attitude = attitude;
        self.attitude.renormalize();
    }

    /// Pack into the estimator state vector
    pub fn to_vector(&self) -> DVector<f64> {
        let mut x = DVector::zeros(STATE_DIM);
        x.fixed_rows_mut::<3>(index::POSITION).copy_from(&self.position);
        x.fixed_rows_mut::<3>(index::VELOCITY).copy_from(&self.velocity);
        x.fixed_rows_mut::<3>(index::ATTITUDE).copy_from(&self.euler());
        x.fixed_rows_mut::<3>(index::ANGULAR_RATE).copy_from(&self.angular_rate);
        x.fixed_rows_mut::<3>(index::GYRO_BIAS).copy_from(&self.gyro_bias);
        x.fixed_rows_mut::<3>(index::ACCEL_BIAS).copy_from(&self.accel_bias);
        x
    }

    /// Unpack from the estimator state vector
    ///
    /// The attitude is rebuilt from roll/pitch/yaw, so it is unit length by
    /// construction.
    pub fn from_vector(x: &DVector<f64>) -> Self {
        debug_assert_eq!(x.len(), STATE_DIM);
        let rpy = x.fixed_rows::<3>(index::ATTITUDE).into_owned();
        Self {
            position: x.fixed_rows::<3>(index::POSITION).into_owned(),
            velocity: x.fixed_rows::<3>(index::VELOCITY).into_owned(),
            attitude: quaternion_from_euler_vector(&rpy),
            angular_rate: x.fixed_rows::<3>(index::ANGULAR_RATE).into_owned(),
            gyro_bias: x.fixed_rows::<3>(index::GYRO_BIAS).into_owned(),
            accel_bias: x.fixed_rows::<3>(index::ACCEL_BIAS).into_owned(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.velocity.iter().all(|v| v.is_finite())
            && self.attitude.coords.iter().all(|v| v.is_finite())
            && self.angular_rate.iter().all(|v| v.is_finite())
    }
}

/// Wrap the attitude block of an estimator state vector in place
pub fn wrap_attitude(x: &mut DVector<f64>) {
    for i in index::ATTITUDE..index::ATTITUDE + 3 {
        x[i] = wrap_angle(x[i]);
    }
}

/// A single trajectory sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub position: Vec3,
    pub velocity: Vec3,
    pub yaw: f64,
}

impl TrajectoryPoint {
    pub fn hold(position: Vec3, yaw: f64) -> Self {
        Self {
            position,
            velocity: Vec3::zeros(),
            yaw,
        }
    }
}

/// Desired trajectory point supplied to the controllers each tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReference {
    /// Desired position [m]
    pub position: Vec3,
    /// Desired velocity [m/s] (feedforward)
    pub velocity: Vec3,
    /// Desired acceleration [m/s²] (feedforward)
    pub acceleration: Vec3,
    /// Desired heading [rad]
    pub yaw: f64,
    /// Optional preview of upcoming points, one per MPC step
    #[serde(default)]
    pub horizon: Vec<TrajectoryPoint>,
}

impl ControlReference {
    /// Hover in place at `position`
    pub fn hover(position: Vec3, yaw: f64) -> Self {
        Self {
            position,
            velocity: Vec3::zeros(),
            acceleration: Vec3::zeros(),
            yaw,
            horizon: Vec::new(),
        }
    }

    pub fn with_horizon(mut self, horizon: Vec<TrajectoryPoint>) -> Self {
        self.horizon = horizon;
        self
    }

    /// Whether every component, preview included, is a finite number
    pub fn is_finite(&self) -> bool {
        let point_finite = |p: &Vec3, v: &Vec3, yaw: f64| {
            p.iter().chain(v.iter()).all(|x| x.is_finite()) && yaw.is_finite()
        };
        point_finite(&self.position, &self.velocity, self.yaw)
            && self.acceleration.iter().all(|a| a.is_finite())
            && self.horizon.iter().all(|h| point_finite(&h.position, &h.velocity, h.yaw))
    }

    /// Reference point `k` steps ahead; holds the last known point past the preview
    pub fn point_at(&self, k: usize) -> TrajectoryPoint {
        match self.horizon.get(k).or_else(|| self.horizon.last()) {
            Some(point) => point.clone(),
            None => TrajectoryPoint {
                position: self.position,
                velocity: self.velocity,
                yaw: self.yaw,
            },
        }
    }
}

impl Default for ControlReference {
    fn default() -> Self {
        Self::hover(Vec3::zeros(), 0.0)
    }
}

/// Collective thrust and body torques
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ActuatorCommand {
    /// Total thrust along body z [N]
    pub thrust: f64,
    /// Body torque [N·m]
    pub torque: Vec3,
}

impl ActuatorCommand {
    pub fn new(thrust: f64, torque: Vec3) -> Self {
        Self { thrust, torque }
    }

    /// All motors off
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_finite(&self) -> bool {
        self.thrust.is_finite() && self.torque.iter().all(|v| v.is_finite())
    }
}

/// Declared actuator limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorEnvelope {
    /// Minimum collective thrust [N]
    pub min_thrust: f64,
    /// Maximum collective thrust [N]
    pub max_thrust: f64,
    /// Per-axis torque magnitude limit [N·m]
    pub max_torque: Vec3,
}

impl Default for ActuatorEnvelope {
    fn default() -> Self {
        Self {
            min_thrust: 0.0,
            max_thrust: 2.0 * 0.5 * crate::GRAVITY,
            max_torque: Vec3::new(0.3, 0.3, 0.1),
        }
    }
}

impl ActuatorEnvelope {
    /// Clamp a command into the envelope
    ///
    /// Non-finite components collapse to the minimum thrust / zero torque, so
    /// the result is always inside the envelope.
    pub fn clamp(&self, command: &ActuatorCommand) -> ActuatorCommand {
        let thrust = if command.thrust.is_finite() {
            command.thrust.clamp(self.min_thrust, self.max_thrust)
        } else {
            self.min_thrust
        };
        let torque = Vec3::from_fn(|i, _| {
            let t = command.torque[i];
            if t.is_finite() {
                t.clamp(-self.max_torque[i], self.max_torque[i])
            } else {
                0.0
            }
        });
        ActuatorCommand { thrust, torque }
    }

    pub fn contains(&self, command: &ActuatorCommand) -> bool {
        command.is_finite()
            && command.thrust >= self.min_thrust
            && command.thrust <= self.max_thrust
            && (0..3).all(|i| command.torque[i].abs() <= self.max_torque[i])
    }
}
