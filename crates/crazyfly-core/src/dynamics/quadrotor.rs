//! Quadrotor dynamics
//!
//! ṗ = v
//! v̇ = -g e₃ + T/m · R(q)e₃ + (f_ext - c_d v)/m
//! q̇ = 1/2 Λ(q)[0; ω]
//! Jω̇ = -ω × Jω + τ
//!
//! where:
//! - p, v: position and velocity (world frame, ENU)
//! - q: orientation (body to world)
//! - ω: angular rate (body frame)
//! - T: collective thrust, τ: body torque
//! - f_ext: external disturbance force, c_d: linear drag coefficient

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::math::{integrate_quaternion, quaternion_derivative};
use crate::state::{ActuatorCommand, ActuatorEnvelope, VehicleState};
use crate::{ConfigError, GRAVITY};

/// Quadrotor physical parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleParams {
    /// Mass [kg]
    pub mass: f64,
    /// Inertia diagonal [kg·m²] (body frame)
    pub inertia: Vector3<f64>,
    /// Arm length [m] (center to rotor)
    pub arm_length: f64,
    /// Thrust-to-weight ratio at full throttle
    pub thrust_to_weight: f64,
    /// Per-axis torque limit [N·m]
    pub max_torque: Vector3<f64>,
    /// Rotor drag torque per unit thrust [m]
    pub yaw_moment_coefficient: f64,
    /// Linear translational drag [N·s/m]
    pub drag_coefficient: f64,
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self {
            mass: 0.5,
            inertia: Vector3::new(2.3e-3, 2.3e-3, 4.0e-3),
            arm_length: 0.17,
            thrust_to_weight: 2.0,
            max_torque: Vector3::new(0.3, 0.3, 0.1),
            yaw_moment_coefficient: 0.016,
            drag_coefficient: 0.0,
        }
    }
}

impl VehicleParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.mass > 0.0, "vehicle.mass", "must be positive")?;
        ConfigError::check(
            self.inertia.iter().all(|&j| j > 0.0),
            "vehicle.inertia",
            "all components must be positive",
        )?;
        ConfigError::check(self.arm_length > 0.0, "vehicle.arm_length", "must be positive")?;
        ConfigError::check(
            self.thrust_to_weight > 1.0,
            "vehicle.thrust_to_weight",
            "must exceed 1 to hover",
        )?;
        ConfigError::check(
            self.max_torque.iter().all(|&t| t > 0.0),
            "vehicle.max_torque",
            "all components must be positive",
        )?;
        ConfigError::check(
            self.yaw_moment_coefficient > 0.0,
            "vehicle.yaw_moment_coefficient",
            "must be positive",
        )?;
        ConfigError::check(self.drag_coefficient >= 0.0, "vehicle.drag_coefficient", "must be non-negative")
    }

    /// Inertia tensor [kg·m²]
    pub fn inertia_matrix(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&self.inertia)
    }

    /// Thrust that balances gravity [N]
    pub fn hover_thrust(&self) -> f64 {
        self.mass * GRAVITY
    }

    pub fn max_thrust(&self) -> f64 {
        self.hover_thrust() * self.thrust_to_weight
    }

    /// Actuator envelope implied by these parameters
    pub fn envelope(&self) -> ActuatorEnvelope {
        ActuatorEnvelope {
            min_thrust: 0.0,
            max_thrust: self.max_thrust(),
            max_torque: self.max_torque,
        }
    }
}

/// Quadrotor dynamics model
#[derive(Debug, Clone)]
pub struct QuadrotorDynamics {
    pub params: VehicleParams,
    inertia: Matrix3<f64>,
    inertia_inv: Matrix3<f64>,
}

impl QuadrotorDynamics {
    pub fn new(params: VehicleParams) -> Self {
        let inertia = params.inertia_matrix();
        let inertia_inv = Matrix3::from_diagonal(&params.inertia.map(|j| 1.0 / j));
        Self {
            params,
            inertia,
            inertia_inv,
        }
    }

    /// Translational acceleration (world frame)
    pub fn compute_acceleration(
        &self,
        state: &VehicleState,
        command: &ActuatorCommand,
        disturbance: &Vector3<f64>,
    ) -> Vector3<f64> {
        let thrust_world = state.attitude * Vector3::z() * command.thrust;
        let drag = -self.params.drag_coefficient * state.velocity;

        crate::gravity_enu() + (thrust_world + disturbance + drag) / self.params.mass
    }

    /// Angular acceleration (body frame)
    ///
    /// Jω̇ = -ω × Jω + τ
    pub fn compute_angular_acceleration(
        &self,
        state: &VehicleState,
        command: &ActuatorCommand,
    ) -> Vector3<f64> {
        let omega = &state.angular_rate;
        let gyro = -omega.cross(&(self.inertia * omega));

        self.inertia_inv * (gyro + command.torque)
    }

    /// Integrate one step with semi-implicit Euler
    ///
    /// Velocities are advanced first and the new velocities drive position and
    /// attitude. Returns the new state and the acceleration that was applied.
    pub fn integrate(
        &self,
        state: &VehicleState,
        command: &ActuatorCommand,
        disturbance: &Vector3<f64>,
        dt: f64,
    ) -> (VehicleState, Vector3<f64>) {
        let acceleration = self.compute_acceleration(state, command, disturbance);
        let angular_acceleration = self.compute_angular_acceleration(state, command);

        let mut next = state.clone();
        next.velocity += acceleration * dt;
        next.position += next.velocity * dt;
        next.angular_rate += angular_acceleration * dt;

        let q_dot = quaternion_derivative(&state.attitude, &next.angular_rate);
        next.set_attitude(integrate_quaternion(&state.attitude, &q_dot, dt));

        (next, acceleration)
    }
}

impl Default for QuadrotorDynamics {
    fn default() -> Self {
        Self::new(VehicleParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Quat;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_hover_equilibrium() {
        let quad = QuadrotorDynamics::default();
        let state = VehicleState::default();
        let command = ActuatorCommand::new(quad.params.hover_thrust(), Vector3::zeros());

        let acc = quad.compute_acceleration(&state, &command, &Vector3::zeros());

        assert_relative_eq!(acc, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_free_fall() {
        let quad = QuadrotorDynamics::default();
        let acc = quad.compute_acceleration(&VehicleState::default(), &ActuatorCommand::zero(), &Vector3::zeros());

        assert_relative_eq!(acc, Vector3::new(0.0, 0.0, -GRAVITY), epsilon = 1e-12);
    }

    #[test]
    fn test_disturbance_force() {
        let quad = QuadrotorDynamics::default();
        let command = ActuatorCommand::new(quad.params.hover_thrust(), Vector3::zeros());
        let push = Vector3::new(0.25, 0.0, 0.0);

        let acc = quad.compute_acceleration(&VehicleState::default(), &command, &push);

        assert_relative_eq!(acc.x, 0.25 / quad.params.mass, epsilon = 1e-12);
    }

    #[test]
    fn test_gyroscopic_effect_vanishes_about_principal_axis() {
        let quad = QuadrotorDynamics::default();
        let mut state = VehicleState::default();
        state.angular_rate = Vector3::new(0.0, 0.0, 10.0);

        let alpha = quad.compute_angular_acceleration(&state, &ActuatorCommand::zero());

        assert_relative_eq!(alpha.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_tilted_thrust_accelerates_sideways() {
        let quad = QuadrotorDynamics::default();
        let mut state = VehicleState::default();
        // Pitching nose-down about +y tips thrust toward +x
        state.attitude = Quat::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2 / 3.0);
        let command = ActuatorCommand::new(quad.params.hover_thrust(), Vector3::zeros());

        let acc = quad.compute_acceleration(&state, &command, &Vector3::zeros());

        assert!(acc.x > 0.0);
        assert!(acc.z < 0.0);
    }

    #[test]
    fn test_integration_preserves_quaternion_norm() {
        let quad = QuadrotorDynamics::default();
        let state = VehicleState::default();
        let command = ActuatorCommand::new(quad.params.hover_thrust(), Vector3::new(0.01, 0.0, 0.0));

        let (next, _) = quad.integrate(&state, &command, &Vector3::zeros(), 0.01);

        assert_relative_eq!(next.attitude.quaternion().norm(), 1.0, epsilon = 1e-12);
        assert!(next.angular_rate.x > 0.0);
    }

    #[test]
    fn test_envelope_from_params() {
        let params = VehicleParams::default();
        let envelope = params.envelope();

        assert_relative_eq!(envelope.max_thrust, 2.0 * params.hover_thrust());
        assert!(params.validate().is_ok());
    }
}
