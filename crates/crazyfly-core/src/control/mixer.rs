//! X-configuration motor mixer
//!
//! Motor order: front-right, rear-left, front-left, rear-right. Front-right
//! and rear-left spin counter-clockwise.
//!
//! ```text
//! [T  ]   [ 1   1   1   1 ] [f0]
//! [τx ] = [-d   d   d  -d ] [f1]
//! [τy ]   [-d   d  -d   d ] [f2]
//! [τz ]   [ c   c  -c  -c ] [f3]
//! ```
//!
//! with d = arm_length / √2 and c the yaw moment coefficient.

use nalgebra::{Matrix4, Vector4};

use crate::dynamics::VehicleParams;
use crate::error::ConfigError;
use crate::state::ActuatorCommand;
use crate::Vec3;

#[derive(Debug, Clone)]
pub struct MotorMixer {
    allocation: Matrix4<f64>,
    inverse: Matrix4<f64>,
    max_motor_thrust: f64,
}

impl MotorMixer {
    pub fn new(params: &VehicleParams) -> Result<Self, ConfigError> {
        params.validate()?;
        let d = params.arm_length / std::f64::consts::SQRT_2;
        let c = params.yaw_moment_coefficient;
        #[rustfmt::skip]
        let allocation = Matrix4::new(
            1.0, 1.0, 1.0, 1.0,
            -d,  d,   d,   -d,
            -d,  d,   -d,  d,
            c,   c,   -c,  -c,
        );
        let inverse = allocation.try_inverse().ok_or_else(|| ConfigError::Invalid {
            field: "vehicle",
            reason: "motor allocation matrix is singular".into(),
        })?;
        Ok(Self {
            allocation,
            inverse,
            max_motor_thrust: params.max_thrust() / 4.0,
        })
    }

    /// Per-motor thrusts [N], each clamped to [0, max]
    pub fn mix(&self, command: &ActuatorCommand) -> [f64; 4] {
        let wrench = Vector4::new(command.thrust, command.torque.x, command.torque.y, command.torque.z);
        let motors = self.inverse * wrench;
        let max = self.max_motor_thrust;
        [0, 1, 2, 3].map(|i| {
            let f = motors[i];
            if f.is_finite() {
                f.clamp(0.0, max)
            } else {
                0.0
            }
        })
    }

    /// Collective thrust and torque produced by the given motor thrusts
    pub fn unmix(&self, motors: &[f64; 4]) -> ActuatorCommand {
        let wrench = self.allocation * Vector4::from_column_slice(motors);
        ActuatorCommand::new(wrench[0], Vec3::new(wrench[1], wrench[2], wrench[3]))
    }

    pub fn max_motor_thrust(&self) -> f64 {
        self.max_motor_thrust
    }
}
