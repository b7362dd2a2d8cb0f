//! Control arbiter and fixed-rate loop
//!
//! One [`ControlArbiter::tick`] is a complete pass of the flight loop:
//!
//! 1. fuse the measurements that arrived since the last tick
//! 2. decide whether the estimate can be trusted (fix, divergence timeout,
//!    escalation latch)
//! 3. run the controller assigned to the current flight mode, or the safe
//!    command
//! 4. clamp the command to the actuator envelope
//!
//! Every tick produces a bounded command; faults are collected into the
//! [`TickReport`] and never abort the tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crazyfly_core::control::{InnerLoops, L1Adaptive, PidCascade};
use crazyfly_core::dynamics::VehicleParams;
use crazyfly_core::error::{ControllerKind, EstimatorKind};
use crazyfly_core::estimation::{FixStatus, FusionManager, SensorInbox, SensorMeasurement};
use crazyfly_core::{
    ActuatorCommand, ActuatorEnvelope, ConfigError, ControlReference, Fault, FaultKind, Quat, Vec3, VehicleState,
};

use crate::config::FlightConfig;
use crate::mpc::{MpcController, MpcError};

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mpc(#[from] MpcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightMode {
    Idle,
    Takeoff,
    Hover,
    Tracking,
    Landing,
}

/// Controller assigned to each flight mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeControllers {
    pub idle: ControllerKind,
    pub takeoff: ControllerKind,
    pub hover: ControllerKind,
    pub tracking: ControllerKind,
    pub landing: ControllerKind,
}

impl Default for ModeControllers {
    fn default() -> Self {
        Self {
            idle: ControllerKind::Idle,
            takeoff: ControllerKind::Pid,
            hover: ControllerKind::PidL1,
            tracking: ControllerKind::Mpc,
            landing: ControllerKind::Pid,
        }
    }
}

impl ModeControllers {
    pub fn for_mode(&self, mode: FlightMode) -> ControllerKind {
        match mode {
            FlightMode::Idle => self.idle,
            FlightMode::Takeoff => self.takeoff,
            FlightMode::Hover => self.hover,
            FlightMode::Tracking => self.tracking,
            FlightMode::Landing => self.landing,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for kind in [self.takeoff, self.hover, self.tracking, self.landing] {
            ConfigError::check(
                !matches!(kind, ControllerKind::Idle | ControllerKind::SafeFallback),
                "arbiter.controllers",
                format!("{:?} cannot fly an airborne mode", kind),
            )?;
        }
        Ok(())
    }
}

/// What the arbiter commands when the estimate cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SafeCommand {
    /// Level attitude at the current heading, hover thrust times `thrust_scale`
    HoverHold { thrust_scale: f64 },
    MotorCut,
}

impl Default for SafeCommand {
    fn default() -> Self {
        SafeCommand::HoverHold { thrust_scale: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Loop period [s]
    pub tick_period: f64,
    pub controllers: ModeControllers,
    pub safe_command: SafeCommand,
    /// Idle mode on the ground always cuts the motors
    pub idle_safe_command: SafeCommand,
    /// How long divergence may persist before the safe command is forced [s]
    pub divergence_timeout: f64,
    /// Consecutive control faults that latch the safe command
    pub fault_escalation: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            tick_period: 0.01,
            controllers: ModeControllers::default(),
            safe_command: SafeCommand::default(),
            idle_safe_command: SafeCommand::MotorCut,
            divergence_timeout: 0.25,
            fault_escalation: 5,
        }
    }
}

impl ArbiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(
            self.tick_period > 0.0 && self.tick_period.is_finite(),
            "arbiter.tick_period",
            "must be positive",
        )?;
        self.controllers.validate()?;
        for command in [self.safe_command, self.idle_safe_command] {
            if let SafeCommand::HoverHold { thrust_scale } = command {
                ConfigError::check(
                    (0.0..=2.0).contains(&thrust_scale),
                    "arbiter.safe_command",
                    "hover-hold thrust scale must be in [0, 2]",
                )?;
            }
        }
        ConfigError::check(
            self.divergence_timeout >= 0.0,
            "arbiter.divergence_timeout",
            "must be non-negative",
        )?;
        ConfigError::check(self.fault_escalation > 0, "arbiter.fault_escalation", "must be at least 1")
    }
}

/// Why the safe command was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafeReason {
    NoFix,
    Divergence,
    /// Latched after repeated control faults
    Escalation,
}

/// Everything observable about one tick
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    /// Fused time at the end of the tick [s]
    pub time: f64,
    pub mode: FlightMode,
    pub controller: ControllerKind,
    /// Command sent to the actuators, already clamped
    pub command: ActuatorCommand,
    pub state: VehicleState,
    pub fix: FixStatus,
    pub estimator: EstimatorKind,
    pub safe: Option<SafeReason>,
    pub faults: Vec<Fault>,
}

/// Receives one clamped command per tick
pub trait ActuatorSink {
    fn send(&mut self, command: &ActuatorCommand);
}

/// Read-only observer of tick reports
pub trait TelemetrySink {
    fn publish(&mut self, report: &TickReport);
}

impl ActuatorSink for Vec<ActuatorCommand> {
    fn send(&mut self, command: &ActuatorCommand) {
        self.push(*command);
    }
}

impl TelemetrySink for Vec<TickReport> {
    fn publish(&mut self, report: &TickReport) {
        self.push(report.clone());
    }
}

/// Shared disarm flag, polled at tick boundaries
#[derive(Debug, Clone, Default)]
pub struct DisarmHandle(Arc<AtomicBool>);

impl DisarmHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disarm(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_disarmed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Fixed-rate scheduler on `Instant` deadlines
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
    overruns: u64,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
            overruns: 0,
        }
    }

    /// Sleep until the next deadline; a missed deadline is counted and the
    /// schedule restarts from now
    pub fn wait(&mut self) {
        let now = Instant::now();
        if now < self.next {
            thread::sleep(self.next - now);
            self.next += self.period;
        } else {
            self.overruns += 1;
            debug!("tick overran its deadline by {:?}", now - self.next);
            self.next = now + self.period;
        }
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArbiterStats {
    pub ticks: u64,
    pub safe_ticks: u64,
    pub faults: BTreeMap<FaultKind, u64>,
    pub controller_ticks: HashMap<ControllerKind, u64>,
    pub escalations: u64,
}

pub struct ControlArbiter {
    config: ArbiterConfig,
    envelope: ActuatorEnvelope,
    hover_thrust: f64,
    fusion: FusionManager,
    cascade: PidCascade,
    l1: L1Adaptive,
    mpc: MpcController,
    /// Attitude and rate loops reserved for the hover-hold command
    safe_loops: InnerLoops,
    mode: FlightMode,
    tick: u64,
    state: VehicleState,
    last_command: ActuatorCommand,
    last_fix: FixStatus,
    diverged_since: Option<f64>,
    control_faults: u32,
    latched: bool,
    in_safe: bool,
    stats: ArbiterStats,
}

impl ControlArbiter {
    /// Build every component from `config`, starting the estimate at `initial`
    pub fn new(config: &FlightConfig, initial: &VehicleState, start_time: f64) -> Result<Self, ArbiterError> {
        config.arbiter.validate()?;
        let params: &VehicleParams = &config.vehicle;
        params.validate()?;

        Ok(Self {
            config: config.arbiter.clone(),
            envelope: params.envelope(),
            hover_thrust: params.hover_thrust(),
            fusion: FusionManager::new(config.fusion.clone(), initial, start_time)?,
            cascade: PidCascade::new(config.cascade.clone(), params)?,
            l1: L1Adaptive::new(config.l1.clone())?,
            mpc: MpcController::new(config.mpc.clone(), &config.cascade, params)?,
            safe_loops: InnerLoops::new(&config.cascade, params),
            mode: FlightMode::Idle,
            tick: 0,
            state: initial.clone(),
            last_command: ActuatorCommand::zero(),
            last_fix: FixStatus::Available,
            diverged_since: None,
            control_faults: 0,
            latched: false,
            in_safe: false,
            stats: ArbiterStats::default(),
        })
    }

    /// Run one loop iteration
    pub fn tick(&mut self, measurements: Vec<SensorMeasurement>, reference: &ControlReference) -> TickReport {
        let dt = self.config.tick_period;
        let mut faults = Vec::new();

        let mut estimate_failed = false;
        match self.fusion.tick(measurements, dt) {
            Ok(report) => {
                self.state = report.estimate.state;
                self.last_fix = report.fix;
                faults.extend(report.faults);
                if report.diverged {
                    self.diverged_since.get_or_insert(report.time);
                } else {
                    self.diverged_since = None;
                }
            }
            Err(e) => {
                error!("fusion tick failed: {}", e);
                estimate_failed = true;
            }
        }
        let time = self.fusion.time();

        let diverged_too_long = self
            .diverged_since
            .is_some_and(|since| time - since >= self.config.divergence_timeout);
        let mut safe = if self.latched {
            Some(SafeReason::Escalation)
        } else if matches!(self.last_fix, FixStatus::NoFix { .. }) {
            Some(SafeReason::NoFix)
        } else if diverged_too_long || estimate_failed || !self.state.is_finite() {
            Some(SafeReason::Divergence)
        } else {
            None
        };
        self.on_safe_transition(safe);

        let state = self.state.clone();
        let (mut controller, mut command) = match safe {
            Some(_) => (ControllerKind::SafeFallback, self.safe_command(&state, dt)),
            None => {
                let kind = self.config.controllers.for_mode(self.mode);
                let faults_before = faults.len();
                let command = self.run_controller(kind, &state, reference, dt, &mut faults);
                let control_fault = faults[faults_before..]
                    .iter()
                    .any(|f| f.kind() == FaultKind::ControlFault);
                self.control_faults = if control_fault { self.control_faults + 1 } else { 0 };
                (kind, command)
            }
        };

        if !self.latched && self.control_faults >= self.config.fault_escalation {
            error!(
                "{} consecutive control faults, latching the safe command until the mode changes",
                self.control_faults
            );
            self.latched = true;
            self.stats.escalations += 1;
            safe = Some(SafeReason::Escalation);
            self.on_safe_transition(safe);
            controller = ControllerKind::SafeFallback;
            command = self.safe_command(&state, dt);
        }

        let command = self.envelope.clamp(&command);
        self.last_command = command;
        self.tick += 1;

        self.stats.ticks += 1;
        if safe.is_some() {
            self.stats.safe_ticks += 1;
        }
        *self.stats.controller_ticks.entry(controller).or_insert(0) += 1;
        for fault in &faults {
            *self.stats.faults.entry(fault.kind()).or_insert(0) += 1;
        }

        TickReport {
            tick: self.tick,
            time,
            mode: self.mode,
            controller,
            command,
            state,
            fix: self.last_fix,
            estimator: self.fusion.active_kind(),
            safe,
            faults,
        }
    }

    fn run_controller(
        &mut self,
        kind: ControllerKind,
        state: &VehicleState,
        reference: &ControlReference,
        dt: f64,
        faults: &mut Vec<Fault>,
    ) -> ActuatorCommand {
        let cascade_driven = matches!(kind, ControllerKind::Pid | ControllerKind::PidL1);
        if cascade_driven && !reference.is_finite() {
            return self.reject_cascade(kind, "non-finite reference", state, dt, faults);
        }
        let command = match kind {
            ControllerKind::Idle => ActuatorCommand::zero(),
            ControllerKind::SafeFallback => self.safe_command(state, dt),
            ControllerKind::Pid => self.cascade.compute(state, reference, dt).command,
            ControllerKind::PidL1 => {
                let adaptive = self.l1.compute(&state.velocity, dt);
                faults.extend(adaptive.fault);
                let l1 = &self.l1;
                let out = self
                    .cascade
                    .compute_augmented(state, reference, dt, |a| l1.compose(&a, &adaptive.compensation));
                self.l1.record_applied(&out.acceleration);
                out.command
            }
            ControllerKind::Mpc => {
                let out = self.mpc.compute(state, reference, dt);
                faults.extend(out.fault);
                out.command
            }
            ControllerKind::MpcL1 => {
                let adaptive = self.l1.compute(&state.velocity, dt);
                faults.extend(adaptive.fault);
                let l1 = &self.l1;
                let out = self
                    .mpc
                    .compute_augmented(state, reference, dt, |a| l1.compose(&a, &adaptive.compensation));
                self.l1.record_applied(&out.acceleration);
                faults.extend(out.fault.map(|fault| match fault {
                    Fault::ControlFault { reason, .. } => Fault::ControlFault {
                        controller: ControllerKind::MpcL1,
                        reason,
                    },
                    other => other,
                }));
                out.command
            }
        };
        if cascade_driven && !command.is_finite() {
            return self.reject_cascade(kind, "non-finite command", state, dt, faults);
        }
        command
    }

    /// Drop a cascade output that cannot be flown: report it, clear the
    /// integrators and hold a level attitude for this tick
    fn reject_cascade(
        &mut self,
        kind: ControllerKind,
        reason: &str,
        state: &VehicleState,
        dt: f64,
        faults: &mut Vec<Fault>,
    ) -> ActuatorCommand {
        warn!("{:?} controller: {}, holding level attitude", kind, reason);
        faults.push(Fault::ControlFault {
            controller: kind,
            reason: reason.to_string(),
        });
        self.cascade.reset();
        if kind == ControllerKind::PidL1 {
            self.l1.reset();
        }
        self.hover_hold(state, 1.0, dt)
    }

    /// Reset adaptation on entering the safe command and the nominal
    /// controllers on leaving it
    fn on_safe_transition(&mut self, safe: Option<SafeReason>) {
        match (self.in_safe, safe) {
            (false, Some(reason)) => {
                warn!("forcing safe command at t={:.3}: {:?}", self.fusion.time(), reason);
                self.l1.reset();
                self.safe_loops.reset();
                self.in_safe = true;
            }
            (true, None) => {
                info!("estimate trusted again at t={:.3}, resuming {:?}", self.fusion.time(), self.mode);
                self.cascade.reset();
                self.mpc.reset();
                self.in_safe = false;
            }
            _ => {}
        }
    }

    fn safe_command(&mut self, state: &VehicleState, dt: f64) -> ActuatorCommand {
        let command = if self.mode == FlightMode::Idle {
            self.config.idle_safe_command
        } else {
            self.config.safe_command
        };
        match command {
            SafeCommand::MotorCut => ActuatorCommand::zero(),
            SafeCommand::HoverHold { thrust_scale } => self.hover_hold(state, thrust_scale, dt),
        }
    }

    /// Level attitude at the current heading with scaled hover thrust
    fn hover_hold(&mut self, state: &VehicleState, thrust_scale: f64, dt: f64) -> ActuatorCommand {
        let level = Quat::from_euler_angles(0.0, 0.0, state.yaw());
        let thrust = self.hover_thrust * thrust_scale;
        let command = self.safe_loops.track_attitude(state, thrust, &level, dt).command;
        if command.is_finite() {
            command
        } else {
            self.safe_loops.reset();
            ActuatorCommand::new(thrust, Vec3::zeros())
        }
    }

    /// Switch flight mode; clears integrators per the reset policy and the
    /// escalation latch
    pub fn set_mode(&mut self, mode: FlightMode) {
        if mode == self.mode {
            return;
        }
        info!("flight mode {:?} -> {:?}", self.mode, mode);
        if self.mode == FlightMode::Idle {
            // Re-arm
            self.l1.reset();
        }
        self.cascade.on_mode_change();
        self.mpc.reset();
        if self.latched {
            info!("operator mode change clears the safe-command latch");
        }
        self.latched = false;
        self.control_faults = 0;
        self.mode = mode;
    }

    /// Final command on disarm: the safe command for the last estimate
    pub fn disarm_command(&mut self) -> ActuatorCommand {
        let state = self.state.clone();
        let raw = self.safe_command(&state, self.config.tick_period);
        let command = self.envelope.clamp(&raw);
        self.last_command = command;
        command
    }

    pub fn mode(&self) -> FlightMode {
        self.mode
    }

    /// Latest fused state (the initial state before the first tick)
    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    /// Latest clamped command (zero before the first tick)
    pub fn last_command(&self) -> ActuatorCommand {
        self.last_command
    }

    pub fn time(&self) -> f64 {
        self.fusion.time()
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn envelope(&self) -> &ActuatorEnvelope {
        &self.envelope
    }

    pub fn fusion(&self) -> &FusionManager {
        &self.fusion
    }

    pub fn mpc(&self) -> &MpcController {
        &self.mpc
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub overruns: u64,
    /// Safe command emitted on disarm
    pub final_command: ActuatorCommand,
}

/// Drive the arbiter at a fixed rate until `disarm` is raised
///
/// The flag is checked only between ticks. On disarm one final safe
/// command is sent before returning.
pub fn run<R, A, T>(
    arbiter: &mut ControlArbiter,
    inbox: &SensorInbox,
    mut reference: R,
    sink: &mut A,
    telemetry: &mut T,
    disarm: &DisarmHandle,
    ticker: &mut Ticker,
) -> RunSummary
where
    R: FnMut(f64) -> ControlReference,
    A: ActuatorSink + ?Sized,
    T: TelemetrySink + ?Sized,
{
    let mut ticks = 0;
    while !disarm.is_disarmed() {
        let measurements = inbox.drain();
        let reference = reference(arbiter.time());
        let report = arbiter.tick(measurements, &reference);
        sink.send(&report.command);
        telemetry.publish(&report);
        ticks += 1;
        ticker.wait();
    }

    let final_command = arbiter.disarm_command();
    sink.send(&final_command);
    info!("disarmed after {} ticks, final thrust {:.3} N", ticks, final_command.thrust);
    RunSummary {
        ticks,
        overruns: ticker.overruns(),
        final_command,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SolveOptions;
    use approx::assert_relative_eq;
    use crazyfly_core::estimation::SensorSource;

    fn config() -> FlightConfig {
        let mut config = FlightConfig::default();
        config.mpc.solver = SolveOptions {
            time_budget_ms: None,
            ..Default::default()
        };
        config
    }

    fn hover_state() -> VehicleState {
        VehicleState::at_rest(Vec3::new(0.0, 0.0, 1.0))
    }

    fn mocap(t: f64, position: Vec3) -> Vec<SensorMeasurement> {
        vec![SensorMeasurement::position(SensorSource::MotionCapture, t, position, 0.01)]
    }

    /// Disarms after a fixed number of reports
    struct DisarmAfter {
        remaining: usize,
        handle: DisarmHandle,
        reports: Vec<TickReport>,
    }

    impl TelemetrySink for DisarmAfter {
        fn publish(&mut self, report: &TickReport) {
            self.reports.push(report.clone());
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                self.handle.disarm();
            }
        }
    }

    #[test]
    fn test_zero_ticks_is_a_no_op() {
        let initial = hover_state();
        let arbiter = ControlArbiter::new(&config(), &initial, 0.0).unwrap();
        assert_eq!(arbiter.state(), &initial);
        assert_eq!(arbiter.last_command(), ActuatorCommand::zero());
        assert_eq!(arbiter.ticks(), 0);
        assert_eq!(arbiter.mode(), FlightMode::Idle);
    }

    #[test]
    fn test_idle_commands_motors_off() {
        let mut arbiter = ControlArbiter::new(&config(), &VehicleState::at_rest(Vec3::zeros()), 0.0).unwrap();
        let report = arbiter.tick(mocap(0.01, Vec3::zeros()), &ControlReference::default());
        assert_eq!(report.controller, ControllerKind::Idle);
        assert_eq!(report.command, ActuatorCommand::zero());
        assert!(report.safe.is_none());
    }

    #[test]
    fn test_commands_stay_inside_envelope() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Hover);
        // A far reference saturates the cascade
        let reference = ControlReference::hover(Vec3::new(50.0, -50.0, 30.0), 0.0);
        for k in 1..=50 {
            let t = k as f64 * 0.01;
            let report = arbiter.tick(mocap(t, Vec3::new(0.0, 0.0, 1.0)), &reference);
            assert!(arbiter.envelope().contains(&report.command), "{:?}", report.command);
        }
    }

    #[test]
    fn test_mode_selects_controller() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        let reference = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        let expected = [
            (FlightMode::Takeoff, ControllerKind::Pid),
            (FlightMode::Hover, ControllerKind::PidL1),
            (FlightMode::Tracking, ControllerKind::Mpc),
            (FlightMode::Landing, ControllerKind::Pid),
        ];
        for (k, (mode, kind)) in expected.into_iter().enumerate() {
            arbiter.set_mode(mode);
            let t = (k + 1) as f64 * 0.01;
            let report = arbiter.tick(mocap(t, Vec3::new(0.0, 0.0, 1.0)), &reference);
            assert_eq!(report.controller, kind);
            assert!(report.faults.is_empty(), "{:?}", report.faults);
        }
    }

    #[test]
    fn test_no_fix_forces_hover_hold() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Hover);
        let reference = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);

        let mut safe_ticks = 0;
        for _ in 0..100 {
            let report = arbiter.tick(Vec::new(), &reference);
            let no_fix = matches!(report.fix, FixStatus::NoFix { .. });
            assert_eq!(report.safe == Some(SafeReason::NoFix), no_fix);
            if no_fix {
                safe_ticks += 1;
                assert_eq!(report.controller, ControllerKind::SafeFallback);
                assert_relative_eq!(report.command.thrust, VehicleParams::default().hover_thrust(), epsilon = 1e-9);
            }
        }
        // Staleness timeout is 0.5 s; the boundary tick depends on rounding
        assert!((50..=51).contains(&safe_ticks), "{} safe ticks", safe_ticks);
        assert_eq!(arbiter.stats().faults.get(&FaultKind::NoFixAvailable), Some(&1));
    }

    #[test]
    fn test_motor_cut_safe_command() {
        let mut config = config();
        config.arbiter.safe_command = SafeCommand::MotorCut;
        let mut arbiter = ControlArbiter::new(&config, &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Hover);
        assert_eq!(arbiter.disarm_command(), ActuatorCommand::zero());
    }

    #[test]
    fn test_control_faults_latch_until_mode_change() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Tracking);
        // A non-finite reference makes every solve fail
        let mut reference = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        reference.position.x = f64::NAN;

        let mut reports = Vec::new();
        for k in 1..=8 {
            reports.push(arbiter.tick(mocap(k as f64 * 0.01, Vec3::new(0.0, 0.0, 1.0)), &reference));
        }
        for report in &reports[..4] {
            assert_eq!(report.controller, ControllerKind::Mpc);
            assert!(report.safe.is_none());
        }
        for report in &reports[4..] {
            assert_eq!(report.safe, Some(SafeReason::Escalation));
            assert_eq!(report.controller, ControllerKind::SafeFallback);
            assert!(report.command.is_finite());
        }
        assert!(arbiter.is_latched());
        assert_eq!(arbiter.stats().escalations, 1);

        arbiter.set_mode(FlightMode::Hover);
        assert!(!arbiter.is_latched());
        let good = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        let report = arbiter.tick(mocap(0.09, Vec3::new(0.0, 0.0, 1.0)), &good);
        assert_eq!(report.controller, ControllerKind::PidL1);
    }

    fn is_control_fault(fault: &Fault, kind: ControllerKind) -> bool {
        matches!(fault, Fault::ControlFault { controller, .. } if *controller == kind)
    }

    #[test]
    fn test_non_finite_reference_rejected_before_the_cascade() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Takeoff);
        let hover_thrust = VehicleParams::default().hover_thrust();

        let mut bad = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        bad.position.z = f64::NAN;
        let report = arbiter.tick(mocap(0.01, Vec3::new(0.0, 0.0, 1.0)), &bad);
        assert_eq!(report.controller, ControllerKind::Pid);
        assert!(report.safe.is_none());
        assert_eq!(report.faults.iter().filter(|f| is_control_fault(f, ControllerKind::Pid)).count(), 1);
        assert_relative_eq!(report.command.thrust, hover_thrust, epsilon = 1e-9);

        // Integrators must come out of the rejected tick clean
        let good = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        for k in 2..=30 {
            let report = arbiter.tick(mocap(k as f64 * 0.01, Vec3::new(0.0, 0.0, 1.0)), &good);
            assert!(report.command.is_finite(), "tick {}: {:?}", k, report.command);
            assert!((report.command.thrust - hover_thrust).abs() < 0.1 * hover_thrust, "tick {}: {:?}", k, report.command);
            assert!(!report.faults.iter().any(|f| f.kind() == FaultKind::ControlFault));
        }
        assert!(!arbiter.is_latched());
    }

    #[test]
    fn test_repeated_non_finite_references_escalate() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Hover);
        let mut reference = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        reference.velocity.y = f64::INFINITY;

        let reports: Vec<TickReport> = (1..=6)
            .map(|k| arbiter.tick(mocap(k as f64 * 0.01, Vec3::new(0.0, 0.0, 1.0)), &reference))
            .collect();
        for report in &reports[..4] {
            assert_eq!(report.controller, ControllerKind::PidL1);
            assert!(report.safe.is_none());
            assert!(report.command.is_finite());
            assert!(report.faults.iter().any(|f| is_control_fault(f, ControllerKind::PidL1)));
        }
        for report in &reports[4..] {
            assert_eq!(report.safe, Some(SafeReason::Escalation));
            assert!(report.command.is_finite());
        }
        assert_eq!(arbiter.stats().escalations, 1);
    }

    #[test]
    fn test_fix_reacquired_after_outage_at_displaced_position() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Hover);
        let reference = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        let displaced = Vec3::new(0.3, 0.0, 1.0);

        let mut no_fix = 0;
        for k in 1..=120 {
            let measurements = if k <= 20 {
                mocap(k as f64 * 0.01, Vec3::new(0.0, 0.0, 1.0))
            } else {
                Vec::new()
            };
            let report = arbiter.tick(measurements, &reference);
            no_fix += report.faults.iter().filter(|f| f.kind() == FaultKind::NoFixAvailable).count();
        }
        assert_eq!(no_fix, 1);
        assert!(arbiter.in_safe);

        for k in 121..=220 {
            let report = arbiter.tick(mocap(k as f64 * 0.01, displaced), &reference);
            assert!(report.safe.is_none(), "tick {}: {:?}", k, report.safe);
            assert_eq!(report.fix, FixStatus::Available);
            for fault in &report.faults {
                assert!(
                    !matches!(fault.kind(), FaultKind::NoFixAvailable | FaultKind::OutlierRejected),
                    "tick {}: {:?}",
                    k,
                    fault
                );
            }
        }
        assert!((arbiter.state().position - displaced).norm() < 0.02);
        assert_eq!(arbiter.fusion().stats().reacquisitions, 1);
    }

    #[test]
    fn test_run_emits_final_safe_command_on_disarm() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        arbiter.set_mode(FlightMode::Hover);
        let inbox = SensorInbox::default();
        let disarm = DisarmHandle::new();
        let mut telemetry = DisarmAfter {
            remaining: 5,
            handle: disarm.clone(),
            reports: Vec::new(),
        };
        let mut commands: Vec<ActuatorCommand> = Vec::new();
        let mut ticker = Ticker::new(Duration::from_millis(1));

        let hover = ControlReference::hover(Vec3::new(0.0, 0.0, 1.0), 0.0);
        let summary = run(
            &mut arbiter,
            &inbox,
            |_| hover.clone(),
            &mut commands,
            &mut telemetry,
            &disarm,
            &mut ticker,
        );

        assert_eq!(summary.ticks, 5);
        assert_eq!(telemetry.reports.len(), 5);
        assert_eq!(commands.len(), 6);
        assert_eq!(commands.last(), Some(&summary.final_command));
        assert_relative_eq!(summary.final_command.thrust, VehicleParams::default().hover_thrust(), epsilon = 1e-9);
    }

    #[test]
    fn test_disarmed_before_start_sends_only_the_safe_command() {
        let mut arbiter = ControlArbiter::new(&config(), &hover_state(), 0.0).unwrap();
        let disarm = DisarmHandle::new();
        disarm.disarm();
        let mut commands: Vec<ActuatorCommand> = Vec::new();
        let mut telemetry: Vec<TickReport> = Vec::new();
        let summary = run(
            &mut arbiter,
            &SensorInbox::default(),
            |_| ControlReference::default(),
            &mut commands,
            &mut telemetry,
            &disarm,
            &mut Ticker::new(Duration::from_millis(1)),
        );
        assert_eq!(summary.ticks, 0);
        assert!(telemetry.is_empty());
        // Idle on the ground: motors stay off
        assert_eq!(commands, vec![ActuatorCommand::zero()]);
    }

    #[test]
    fn test_invalid_mode_table_rejected() {
        let mut config = config();
        config.arbiter.controllers.hover = ControllerKind::Idle;
        assert!(matches!(
            ControlArbiter::new(&config, &hover_state(), 0.0),
            Err(ArbiterError::Config(_))
        ));
    }
}
