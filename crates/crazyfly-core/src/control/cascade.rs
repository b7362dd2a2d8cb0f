//! 4-layer PID cascade
//!
//! position → velocity → attitude → body rate, evaluated outer to inner in a
//! single pass. The outer half (position and velocity) produces a desired
//! world-frame acceleration; [`InnerLoops`] turns any desired acceleration
//! into collective thrust and body torque, so the MPC path reuses it.

use std::f64::consts::PI;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::control::{Pid, PidGains, PidStats};
use crate::dynamics::VehicleParams;
use crate::error::ConfigError;
use crate::math::{attitude_error, body_z_axis, quaternion_from_z_axis_and_yaw};
use crate::state::{ActuatorCommand, ControlReference, VehicleState};
use crate::{Mat3, Quat, Vec3, GRAVITY};

/// When integrators are cleared
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetPolicy {
    pub on_mode_change: bool,
    /// Reference position jump that counts as a step [m]; 0 disables
    pub step_threshold: f64,
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self {
            on_mode_change: true,
            step_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Position error [m] → velocity setpoint [m/s]
    pub position: PidGains,
    /// Velocity error [m/s] → acceleration [m/s²]
    pub velocity: PidGains,
    /// Attitude error [rad] → body-rate setpoint [rad/s]
    pub attitude: PidGains,
    /// Rate error [rad/s] → angular acceleration [rad/s²]
    pub rate: PidGains,
    /// Largest commanded tilt [rad]
    pub max_tilt: f64,
    pub reset: ResetPolicy,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            position: PidGains::proportional(Vec3::new(0.8, 0.8, 1.0), 2.0),
            velocity: PidGains {
                kp: Vec3::new(2.0, 2.0, 3.0),
                ki: Vec3::new(0.1, 0.1, 0.3),
                kd: Vec3::zeros(),
                integral_limit: 2.0,
                output_limit: 6.0,
            },
            attitude: PidGains::proportional(Vec3::new(6.0, 6.0, 3.0), PI),
            rate: PidGains {
                kp: Vec3::new(20.0, 20.0, 10.0),
                ki: Vec3::new(0.2, 0.2, 0.1),
                kd: Vec3::zeros(),
                integral_limit: 1.0,
                output_limit: 200.0,
            },
            max_tilt: 30f64.to_radians(),
            reset: ResetPolicy::default(),
        }
    }
}

impl CascadeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.position.validate("cascade.position")?;
        self.velocity.validate("cascade.velocity")?;
        self.attitude.validate("cascade.attitude")?;
        self.rate.validate("cascade.rate")?;
        ConfigError::check(
            self.max_tilt > 0.0 && self.max_tilt < PI / 2.0,
            "cascade.max_tilt",
            "must be in (0, π/2)",
        )?;
        ConfigError::check(
            self.reset.step_threshold >= 0.0,
            "cascade.reset.step_threshold",
            "must be non-negative",
        )
    }
}

/// Intermediate setpoints of one cascade pass
#[derive(Debug, Clone, PartialEq)]
pub struct InnerOutput {
    pub command: ActuatorCommand,
    pub attitude_setpoint: Quat,
    pub rate_setpoint: Vec3,
}

/// Attitude and rate layers plus the acceleration-to-thrust conversion
#[derive(Debug, Clone)]
pub struct InnerLoops {
    attitude: Pid,
    rate: Pid,
    mass: f64,
    inertia: Mat3,
    max_tilt: f64,
}

impl InnerLoops {
    pub fn new(config: &CascadeConfig, params: &VehicleParams) -> Self {
        Self {
            attitude: Pid::new(config.attitude.clone()),
            rate: Pid::new(config.rate.clone()),
            mass: params.mass,
            inertia: params.inertia_matrix(),
            max_tilt: config.max_tilt,
        }
    }

    /// Track a desired world-frame acceleration (gravity excluded) and yaw
    pub fn track_acceleration(&mut self, state: &VehicleState, acceleration: &Vec3, yaw: f64, dt: f64) -> InnerOutput {
        let force = self.limit_tilt(self.mass * (acceleration + Vec3::new(0.0, 0.0, GRAVITY)));
        let thrust = force.dot(&body_z_axis(&state.attitude)).max(0.0);
        let attitude_setpoint = quaternion_from_z_axis_and_yaw(&force, yaw);
        self.track_attitude(state, thrust, &attitude_setpoint, dt)
    }

    /// Track an attitude with a given collective thrust
    pub fn track_attitude(&mut self, state: &VehicleState, thrust: f64, attitude: &Quat, dt: f64) -> InnerOutput {
        let error = attitude_error(&state.attitude, attitude, 1.0);
        let rate_setpoint = self.attitude.update(&error, &Vec3::zeros(), dt);

        let rate_error = rate_setpoint - state.angular_rate;
        let angular_acceleration = self.rate.update(&rate_error, &Vec3::zeros(), dt);

        let omega = &state.angular_rate;
        let torque = self.inertia * angular_acceleration + omega.cross(&(self.inertia * omega));
        InnerOutput {
            command: ActuatorCommand::new(thrust, torque),
            attitude_setpoint: *attitude,
            rate_setpoint,
        }
    }

    /// Clamp the force direction to the tilt cone around world up
    fn limit_tilt(&self, mut force: Vec3) -> Vec3 {
        let min_vertical = 0.1 * self.mass * GRAVITY;
        force.z = force.z.max(min_vertical);
        let horizontal = force.xy().norm();
        let max_horizontal = force.z * self.max_tilt.tan();
        if horizontal > max_horizontal {
            let scale = max_horizontal / horizontal;
            force.x *= scale;
            force.y *= scale;
        }
        force
    }

    pub fn reset(&mut self) {
        self.attitude.reset();
        self.rate.reset();
    }

    pub fn attitude_pid(&self) -> &Pid {
        &self.attitude
    }

    pub fn rate_pid(&self) -> &Pid {
        &self.rate
    }
}

/// Full cascade output
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeOutput {
    pub command: ActuatorCommand,
    pub velocity_setpoint: Vec3,
    /// Acceleration handed to the inner loops, augmentation included
    pub acceleration: Vec3,
    pub attitude_setpoint: Quat,
    pub rate_setpoint: Vec3,
}

#[derive(Debug, Clone)]
pub struct PidCascade {
    config: CascadeConfig,
    position: Pid,
    velocity: Pid,
    inner: InnerLoops,
    last_reference: Option<Vec3>,
}

impl PidCascade {
    pub fn new(config: CascadeConfig, params: &VehicleParams) -> Result<Self, ConfigError> {
        config.validate()?;
        params.validate()?;
        Ok(Self {
            position: Pid::new(config.position.clone()),
            velocity: Pid::new(config.velocity.clone()),
            inner: InnerLoops::new(&config, params),
            last_reference: None,
            config,
        })
    }

    /// Position and velocity layers: desired acceleration and velocity setpoint
    pub fn outer(&mut self, state: &VehicleState, reference: &ControlReference, dt: f64) -> (Vec3, Vec3) {
        let threshold = self.config.reset.step_threshold;
        if let Some(previous) = self.last_reference {
            if threshold > 0.0 && (reference.position - previous).norm() > threshold {
                debug!("reference step of {:.2} m, clearing integrators", (reference.position - previous).norm());
                self.reset();
            }
        }
        if reference.position.iter().all(|p| p.is_finite()) {
            self.last_reference = Some(reference.position);
        }

        let position_error = reference.position - state.position;
        let velocity_setpoint = self.position.update(&position_error, &reference.velocity, dt);

        let velocity_error = velocity_setpoint - state.velocity;
        let acceleration = self.velocity.update(&velocity_error, &reference.acceleration, dt);
        (acceleration, velocity_setpoint)
    }

    /// Inner layers for an already augmented acceleration
    pub fn inner(&mut self, state: &VehicleState, acceleration: &Vec3, yaw: f64, dt: f64) -> InnerOutput {
        self.inner.track_acceleration(state, acceleration, yaw, dt)
    }

    /// One pass through all four layers with no augmentation
    pub fn compute(&mut self, state: &VehicleState, reference: &ControlReference, dt: f64) -> CascadeOutput {
        self.compute_augmented(state, reference, dt, |a| a)
    }

    /// One pass through all four layers; `augment` maps the velocity layer's
    /// acceleration to the one actually tracked
    pub fn compute_augmented(
        &mut self,
        state: &VehicleState,
        reference: &ControlReference,
        dt: f64,
        augment: impl FnOnce(Vec3) -> Vec3,
    ) -> CascadeOutput {
        let (nominal, velocity_setpoint) = self.outer(state, reference, dt);
        let acceleration = augment(nominal);
        let inner = self.inner(state, &acceleration, reference.yaw, dt);
        CascadeOutput {
            command: inner.command,
            velocity_setpoint,
            acceleration,
            attitude_setpoint: inner.attitude_setpoint,
            rate_setpoint: inner.rate_setpoint,
        }
    }

    /// Clear every layer's integrator
    pub fn reset(&mut self) {
        self.position.reset();
        self.velocity.reset();
        self.inner.reset();
    }

    /// Apply the reset policy for a flight-mode change
    pub fn on_mode_change(&mut self) {
        if self.config.reset.on_mode_change {
            self.reset();
        }
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// (layer name, layer) from outermost to innermost
    pub fn layers(&self) -> [(&'static str, &Pid); 4] {
        [
            ("position", &self.position),
            ("velocity", &self.velocity),
            ("attitude", self.inner.attitude_pid()),
            ("rate", self.inner.rate_pid()),
        ]
    }

    pub fn stats(&self) -> [(&'static str, PidStats); 4] {
        self.layers().map(|(name, pid)| (name, *pid.stats()))
    }
}
