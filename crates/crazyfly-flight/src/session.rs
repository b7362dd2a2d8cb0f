//! Closed-loop simulation session
//!
//! Wires the simulated vehicle, its synthetic sensors and the control
//! arbiter together and flies a scripted mission:
//! takeoff → hover → circle tracking → landing → idle.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crazyfly_core::error::ControllerKind;
use crazyfly_core::simulation::{SensorSuite, VehicleSimulator};
use crazyfly_core::{ConfigError, ControlReference, FaultKind, Vec3, VehicleState};

use crate::arbiter::{ArbiterError, ControlArbiter, FlightMode, TickReport};
use crate::config::FlightConfig;
use crate::trajectory::Trajectory;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Arbiter(#[from] ArbiterError),
}

/// Timing and geometry of the scripted mission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Climb above the start position [m]
    pub takeoff_height: f64,
    /// [s]
    pub takeoff_duration: f64,
    /// [s]
    pub hover_duration: f64,
    /// [m]
    pub circle_radius: f64,
    /// [rad/s]
    pub circle_angular_speed: f64,
    /// [s]
    pub circle_duration: f64,
    /// [s]
    pub landing_duration: f64,
    /// Heading held throughout [rad]
    pub yaw: f64,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            takeoff_height: 1.0,
            takeoff_duration: 3.0,
            hover_duration: 2.0,
            circle_radius: 0.5,
            circle_angular_speed: 0.5,
            circle_duration: 10.0,
            landing_duration: 3.0,
            yaw: 0.0,
        }
    }
}

impl MissionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.takeoff_height > 0.0, "mission.takeoff_height", "must be positive")?;
        for (value, field) in [
            (self.takeoff_duration, "mission.takeoff_duration"),
            (self.hover_duration, "mission.hover_duration"),
            (self.circle_duration, "mission.circle_duration"),
            (self.landing_duration, "mission.landing_duration"),
        ] {
            ConfigError::check(value >= 0.0 && value.is_finite(), field, "must be non-negative")?;
        }
        ConfigError::check(self.circle_radius >= 0.0, "mission.circle_radius", "must be non-negative")
    }
}

/// One mission phase
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub mode: FlightMode,
    pub start: f64,
    pub trajectory: Trajectory,
}

/// Mission phases in time order
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    segments: Vec<Segment>,
}

impl Mission {
    pub fn plan(config: &MissionConfig, start: Vec3) -> Self {
        let yaw = config.yaw;
        let hover_point = start + Vec3::new(0.0, 0.0, config.takeoff_height);
        let circle = Trajectory::circle_through(hover_point, config.circle_radius, config.circle_angular_speed, yaw);
        let circle_end = circle.sample(config.circle_duration).position;

        let mut t = 0.0;
        let mut segments = Vec::new();
        let mut push = |mode, duration: f64, trajectory| {
            segments.push(Segment {
                mode,
                start: t,
                trajectory,
            });
            t += duration;
        };
        push(
            FlightMode::Takeoff,
            config.takeoff_duration,
            Trajectory::Takeoff {
                from: start,
                height: config.takeoff_height,
                duration: config.takeoff_duration,
                yaw,
            },
        );
        push(FlightMode::Hover, config.hover_duration, Trajectory::hold(hover_point, yaw));
        push(FlightMode::Tracking, config.circle_duration, circle);
        push(
            FlightMode::Landing,
            config.landing_duration,
            Trajectory::Landing {
                from: circle_end,
                duration: config.landing_duration,
                yaw,
            },
        );
        let ground = Vec3::new(circle_end.x, circle_end.y, 0.0);
        push(FlightMode::Idle, 0.0, Trajectory::hold(ground, yaw));
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segment active at `t`
    pub fn segment_at(&self, t: f64) -> &Segment {
        let index = self
            .segments
            .iter()
            .rposition(|s| s.start <= t)
            .unwrap_or(0);
        &self.segments[index]
    }

    /// Flight mode and reference at `t`
    pub fn reference(&self, t: f64, horizon: usize, step: f64) -> (FlightMode, ControlReference) {
        let segment = self.segment_at(t);
        (segment.mode, segment.trajectory.reference(t - segment.start, horizon, step))
    }

    /// Time the vehicle is back on the ground
    pub fn end_time(&self) -> f64 {
        self.segments.last().map_or(0.0, |s| s.start)
    }
}

/// Aggregate results of a session
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    pub ticks: u64,
    pub duration: f64,
    pub faults: BTreeMap<FaultKind, u64>,
    pub safe_ticks: u64,
    pub controller_ticks: HashMap<ControllerKind, u64>,
    /// RMS of true position minus reference while tracking [m]
    pub tracking_rms: Option<f64>,
    pub final_position: Vec3,
    pub estimator_switches: u64,
    pub mpc_failures: usize,
}

impl SessionSummary {
    pub fn fault_count(&self, kind: FaultKind) -> u64 {
        self.faults.get(&kind).copied().unwrap_or(0)
    }
}

pub struct Session {
    config: FlightConfig,
    mission: Mission,
    sim: VehicleSimulator,
    sensors: SensorSuite,
    arbiter: ControlArbiter,
    tracking_squared_error: f64,
    tracking_ticks: u64,
}

impl Session {
    pub fn new(config: FlightConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let sim = VehicleSimulator::new(&config.sim)?;
        let sensors = SensorSuite::new(config.sim.clone(), sim.time());
        let initial = VehicleState::at_rest(config.sim.initial_position);
        let arbiter = ControlArbiter::new(&config, &initial, sim.time())?;
        let mission = Mission::plan(&config.mission, config.sim.initial_position);
        info!(
            "session: {:.1} s, mission ends at {:.1} s, {} dropout window(s)",
            config.sim.duration,
            mission.end_time(),
            config.sim.dropouts.len()
        );
        Ok(Self {
            config,
            mission,
            sim,
            sensors,
            arbiter,
            tracking_squared_error: 0.0,
            tracking_ticks: 0,
        })
    }

    /// One control tick: sample sensors, run the arbiter, advance the vehicle
    pub fn step(&mut self) -> TickReport {
        let t = self.sim.time();
        let dt = self.config.arbiter.tick_period;
        let (mode, reference) = self.mission.reference(t, self.config.mpc.horizon, self.config.mpc.step);
        if mode != self.arbiter.mode() {
            info!("t={:.2}: entering {:?}", t, mode);
            self.arbiter.set_mode(mode);
        }

        let measurements = self.sensors.sample(t, self.sim.state(), self.sim.acceleration());
        let report = self.arbiter.tick(measurements, &reference);

        if mode == FlightMode::Tracking {
            self.tracking_squared_error += (self.sim.state().position - reference.position).norm_squared();
            self.tracking_ticks += 1;
        }
        self.sim.step(&report.command, dt);
        debug!(
            "t={:.2} {:?} thrust {:.3} N, true z {:.3}",
            t,
            report.controller,
            report.command.thrust,
            self.sim.state().position.z
        );
        report
    }

    /// Fly until the configured duration has elapsed
    pub fn run(&mut self) -> SessionSummary {
        let ticks = (self.config.sim.duration / self.config.arbiter.tick_period).round() as u64;
        for _ in 0..ticks {
            self.step();
        }
        self.summary()
    }

    pub fn summary(&self) -> SessionSummary {
        let stats = self.arbiter.stats();
        SessionSummary {
            ticks: stats.ticks,
            duration: self.sim.time(),
            faults: stats.faults.clone(),
            safe_ticks: stats.safe_ticks,
            controller_ticks: stats.controller_ticks.clone(),
            tracking_rms: (self.tracking_ticks > 0)
                .then(|| (self.tracking_squared_error / self.tracking_ticks as f64).sqrt()),
            final_position: self.sim.state().position,
            estimator_switches: self.arbiter.fusion().stats().estimator_switches,
            mpc_failures: self.arbiter.mpc().stats().failures,
        }
    }

    pub fn mission(&self) -> &Mission {
        &self.mission
    }

    pub fn simulator(&self) -> &VehicleSimulator {
        &self.sim
    }

    pub fn arbiter(&self) -> &ControlArbiter {
        &self.arbiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mission_timeline() {
        let mission = Mission::plan(&MissionConfig::default(), Vec3::zeros());
        let modes: Vec<_> = mission.segments().iter().map(|s| (s.mode, s.start)).collect();
        assert_eq!(
            modes,
            vec![
                (FlightMode::Takeoff, 0.0),
                (FlightMode::Hover, 3.0),
                (FlightMode::Tracking, 5.0),
                (FlightMode::Landing, 15.0),
                (FlightMode::Idle, 18.0),
            ]
        );
        assert_eq!(mission.segment_at(4.0).mode, FlightMode::Hover);
        assert_eq!(mission.segment_at(100.0).mode, FlightMode::Idle);
        assert_eq!(mission.end_time(), 18.0);
    }

    #[test]
    fn test_mission_is_continuous() {
        let mission = Mission::plan(&MissionConfig::default(), Vec3::new(0.2, 0.1, 0.0));
        for pair in mission.segments().windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let end = a.trajectory.sample(b.start - a.start).position;
            let start = b.trajectory.sample(0.0).position;
            assert_relative_eq!(end, start, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_takeoff_and_hover() {
        let mut config = FlightConfig::default();
        config.mpc.solver.time_budget_ms = None;
        config.sim.duration = 5.0;
        let mut session = Session::new(config).unwrap();
        let summary = session.run();

        assert_eq!(summary.ticks, 500);
        assert_eq!(summary.fault_count(FaultKind::NoFixAvailable), 0);
        assert_eq!(summary.safe_ticks, 0);
        assert_relative_eq!(summary.final_position, Vec3::new(0.0, 0.0, 1.0), epsilon = 0.15);
    }
}
