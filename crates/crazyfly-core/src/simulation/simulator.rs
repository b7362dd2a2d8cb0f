//! Closed-loop vehicle simulator
//!
//! Advances the true vehicle state under motor-saturated commands with a
//! ground plane at z = 0 and a constant external force.

use crate::control::MotorMixer;
use crate::dynamics::QuadrotorDynamics;
use crate::error::ConfigError;
use crate::state::{ActuatorCommand, VehicleState};
use crate::Vec3;

use super::SimConfig;

/// Recorded trajectory of a run
#[derive(Debug, Clone, Default)]
pub struct SimHistory {
    pub times: Vec<f64>,
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub commands: Vec<ActuatorCommand>,
}

impl SimHistory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// RMS distance to `target` over samples at or after `from`
    pub fn rms_error_since(&self, from: f64, target: impl Fn(f64) -> Vec3) -> Option<f64> {
        let errors: Vec<f64> = self
            .times
            .iter()
            .zip(&self.positions)
            .filter(|(t, _)| **t >= from)
            .map(|(t, p)| (p - target(*t)).norm_squared())
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some((errors.iter().sum::<f64>() / errors.len() as f64).sqrt())
    }
}

/// Ground-truth vehicle
#[derive(Debug, Clone)]
pub struct VehicleSimulator {
    dynamics: QuadrotorDynamics,
    mixer: MotorMixer,
    state: VehicleState,
    acceleration: Vec3,
    disturbance: Vec3,
    substeps: usize,
    time: f64,
    history: SimHistory,
}

impl VehicleSimulator {
    pub fn new(config: &SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            mixer: MotorMixer::new(&config.vehicle)?,
            dynamics: QuadrotorDynamics::new(config.vehicle.clone()),
            state: VehicleState::at_rest(config.initial_position),
            acceleration: Vec3::zeros(),
            disturbance: config.disturbance,
            substeps: config.substeps,
            time: 0.0,
            history: SimHistory::default(),
        })
    }

    /// True state
    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    /// True world-frame acceleration over the last step
    pub fn acceleration(&self) -> &Vec3 {
        &self.acceleration
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn history(&self) -> &SimHistory {
        &self.history
    }

    pub fn set_disturbance(&mut self, force: Vec3) {
        self.disturbance = force;
    }

    /// Apply `command` for `dt` seconds
    ///
    /// The command passes through the motor mixer so per-motor limits are
    /// enforced before it reaches the rigid body.
    pub fn step(&mut self, command: &ActuatorCommand, dt: f64) -> &VehicleState {
        let applied = self.mixer.unmix(&self.mixer.mix(command));
        let h = dt / self.substeps as f64;
        let start_velocity = self.state.velocity;

        for _ in 0..self.substeps {
            let (mut next, _) = self.dynamics.integrate(&self.state, &applied, &self.disturbance, h);
            if next.position.z <= 0.0 {
                // Resting on the ground plane
                next.position.z = 0.0;
                if next.velocity.z < 0.0 {
                    next.velocity = Vec3::zeros();
                    next.angular_rate = Vec3::zeros();
                }
            }
            self.state = next;
        }

        self.acceleration = if dt > 0.0 {
            (self.state.velocity - start_velocity) / dt
        } else {
            Vec3::zeros()
        };
        self.time += dt;

        self.history.times.push(self.time);
        self.history.positions.push(self.state.position);
        self.history.velocities.push(self.state.velocity);
        self.history.commands.push(applied);
        &self.state
    }
}
