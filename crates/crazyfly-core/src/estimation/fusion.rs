//! Sensor fusion manager
//!
//! Owns the single active estimator and feeds it, once per tick, the
//! measurements that became available since the previous tick:
//!
//! 1. samples are processed in timestamp order; the estimator is predicted
//!    forward to each sample's timestamp before the sample is applied
//! 2. samples older than the fused time by more than `stale_tolerance` are
//!    dropped as stale, samples stamped after the end of the tick wait in
//!    the pending buffer
//! 3. every sample passes a Mahalanobis gate before it may update the state
//! 4. the estimator is predicted to the end of the tick
//!
//! The first position fix after a lost fix re-seeds the estimate: position
//! is taken from the fix and the velocity uncertainty is re-inflated, and
//! the next `reacquire_fixes` position fixes skip the gate while the
//! velocity re-converges.
//!
//! Sustained Kalman divergence hands the estimate over to a particle filter;
//! once the particle filter has been consistent for a hysteresis window the
//! estimate is handed back. Both switches happen at the end of a tick.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EstimatorError, EstimatorKind, Fault};
use crate::estimation::{
    Estimate, HealthConfig, Observation, KalmanConfig, KalmanEstimator, ParticleFilter, ParticleFilterConfig,
    RecursiveEstimator, SensorHealthMonitor, SensorMeasurement,
};
use crate::state::{index, VehicleState};

/// Slack when comparing sample timestamps against the end of a tick [s]
const TIME_EPSILON: f64 = 1e-9;

/// Fusion tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Estimator active at start-up
    pub initial_estimator: EstimatorKind,
    pub kalman: KalmanConfig,
    pub particle: ParticleFilterConfig,
    /// Innovation gate [Mahalanobis distance]
    pub outlier_gate: f64,
    /// How far behind the fused time a sample may be and still be applied [s]
    pub stale_tolerance: f64,
    /// Samples stamped further ahead of the fused time are dropped [s]
    pub max_future: f64,
    /// Time without an accepted position fix before `NoFixAvailable` [s]
    pub staleness_timeout: f64,
    /// Velocity variance the estimate restarts with when a lost fix returns [m²/s²]
    pub reacquire_velocity_variance: f64,
    /// Position fixes applied without gating after a lost fix returns
    pub reacquire_fixes: u32,
    /// Consecutive diverged ticks before the Kalman filter is replaced
    pub divergence_switch_count: u32,
    /// Consecutive consistent ticks before switching back to Kalman
    pub hysteresis_ticks: u32,
    /// Largest position uncertainty [m²] the particle filter may report and
    /// still count as consistent
    pub consistency_threshold: f64,
    pub health: HealthConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            initial_estimator: EstimatorKind::Kalman,
            kalman: KalmanConfig::default(),
            particle: ParticleFilterConfig::default(),
            outlier_gate: 4.0,
            stale_tolerance: 0.05,
            max_future: 1.0,
            staleness_timeout: 0.5,
            reacquire_velocity_variance: 1.0,
            reacquire_fixes: 20,
            divergence_switch_count: 3,
            hysteresis_ticks: 50,
            consistency_threshold: 0.05,
            health: HealthConfig::default(),
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kalman.validate()?;
        self.particle.validate()?;
        self.health.validate()?;
        ConfigError::check(self.outlier_gate > 0.0, "fusion.outlier_gate", "must be positive")?;
        ConfigError::check(
            self.stale_tolerance >= 0.0,
            "fusion.stale_tolerance",
            "must be non-negative",
        )?;
        ConfigError::check(self.max_future > 0.0, "fusion.max_future", "must be positive")?;
        ConfigError::check(
            self.reacquire_velocity_variance > 0.0 && self.reacquire_velocity_variance.is_finite(),
            "fusion.reacquire_velocity_variance",
            "must be positive",
        )?;
        ConfigError::check(
            self.staleness_timeout > 0.0,
            "fusion.staleness_timeout",
            "must be positive",
        )?;
        ConfigError::check(
            self.divergence_switch_count > 0,
            "fusion.divergence_switch_count",
            "must be at least 1",
        )?;
        ConfigError::check(
            self.consistency_threshold > 0.0,
            "fusion.consistency_threshold",
            "must be positive",
        )
    }
}

/// The estimator currently driving the fused state
#[derive(Debug, Clone)]
pub enum ActiveEstimator {
    Kalman(KalmanEstimator),
    Particle(ParticleFilter),
}

impl ActiveEstimator {
    pub fn kind(&self) -> EstimatorKind {
        match self {
            ActiveEstimator::Kalman(_) => EstimatorKind::Kalman,
            ActiveEstimator::Particle(_) => EstimatorKind::Particle,
        }
    }

    pub fn as_estimator(&self) -> &dyn RecursiveEstimator {
        match self {
            ActiveEstimator::Kalman(kf) => kf,
            ActiveEstimator::Particle(pf) => pf,
        }
    }

    pub fn as_estimator_mut(&mut self) -> &mut dyn RecursiveEstimator {
        match self {
            ActiveEstimator::Kalman(kf) => kf,
            ActiveEstimator::Particle(pf) => pf,
        }
    }
}

/// Position-fix availability at the end of a tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixStatus {
    Available,
    /// No position fix accepted for `elapsed` seconds
    NoFix { elapsed: f64 },
}

/// Result of one fusion tick
#[derive(Debug, Clone)]
pub struct FusionReport {
    /// Fused time at the end of the tick [s]
    pub time: f64,
    pub estimate: Estimate,
    pub estimator: EstimatorKind,
    pub fix: FixStatus,
    /// The estimator reported divergence during this tick
    pub diverged: bool,
    pub faults: Vec<Fault>,
}

impl FusionReport {
    /// The fused state, unless the position fix has gone stale
    pub fn state(&self) -> Option<&VehicleState> {
        match self.fix {
            FixStatus::Available => Some(&self.estimate.state),
            FixStatus::NoFix { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusionStats {
    pub ticks: u64,
    pub updates: u64,
    pub outliers: u64,
    pub stale: u64,
    pub invalid: u64,
    pub divergence_warnings: u64,
    pub no_fix_events: u64,
    pub reacquisitions: u64,
    pub estimator_switches: u64,
}

pub struct FusionManager {
    config: FusionConfig,
    active: ActiveEstimator,
    fused_time: f64,
    last_fix_time: f64,
    no_fix: bool,
    /// Remaining ungated position fixes after a reacquisition
    reacquiring: u32,
    consecutive_diverged: u32,
    consistent_ticks: u32,
    pending: Vec<SensorMeasurement>,
    health: SensorHealthMonitor,
    stats: FusionStats,
}

impl FusionManager {
    /// Start fusing from `initial` at time `start_time`
    ///
    /// The initial state counts as a position fix taken at `start_time`.
    pub fn new(config: FusionConfig, initial: &VehicleState, start_time: f64) -> Result<Self, ConfigError> {
        config.validate()?;
        let active = match config.initial_estimator {
            EstimatorKind::Kalman => ActiveEstimator::Kalman(KalmanEstimator::new(config.kalman.clone(), initial)?),
            EstimatorKind::Particle => {
                ActiveEstimator::Particle(ParticleFilter::new(config.particle.clone(), initial)?)
            }
        };
        Ok(Self {
            health: SensorHealthMonitor::new(config.health.clone()),
            config,
            active,
            fused_time: start_time,
            last_fix_time: start_time,
            no_fix: false,
            reacquiring: 0,
            consecutive_diverged: 0,
            consistent_ticks: 0,
            pending: Vec::new(),
            stats: FusionStats::default(),
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn time(&self) -> f64 {
        self.fused_time
    }

    pub fn active_kind(&self) -> EstimatorKind {
        self.active.kind()
    }

    pub fn active(&self) -> &ActiveEstimator {
        &self.active
    }

    pub fn current_estimate(&self) -> Estimate {
        self.active.as_estimator().current_estimate()
    }

    pub fn health(&self) -> &SensorHealthMonitor {
        &self.health
    }

    pub fn stats(&self) -> &FusionStats {
        &self.stats
    }

    /// Samples stamped beyond the last tick, waiting for their turn
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Advance the fused estimate by one tick of length `dt`
    pub fn tick(&mut self, measurements: Vec<SensorMeasurement>, dt: f64) -> Result<FusionReport, EstimatorError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(EstimatorError::InvalidTimeStep(dt));
        }
        let target = self.fused_time + dt;
        let mut faults = Vec::new();
        let mut diverged = false;

        self.enqueue(measurements);
        let split = self.pending.partition_point(|m| m.timestamp <= target + TIME_EPSILON);
        let due: Vec<SensorMeasurement> = self.pending.drain(..split).collect();

        for m in &due {
            self.process(m, &mut faults, &mut diverged);
        }
        if target > self.fused_time {
            diverged |= self.predict_to(target);
        }

        let fix = self.check_fix(&mut faults);
        self.health.refresh(self.fused_time);

        if diverged {
            let uncertainty = self.current_estimate().uncertainty;
            warn!("{:?} estimator diverged at t={:.3}", self.active.kind(), self.fused_time);
            faults.push(Fault::DivergenceWarning {
                estimator: self.active.kind(),
                uncertainty,
            });
            self.stats.divergence_warnings += 1;
            self.consecutive_diverged += 1;
        } else {
            self.consecutive_diverged = 0;
        }
        self.arbitrate(diverged, fix);
        self.stats.ticks += 1;

        Ok(FusionReport {
            time: self.fused_time,
            estimate: self.current_estimate(),
            estimator: self.active.kind(),
            fix,
            diverged,
            faults,
        })
    }

    /// Insert new samples into the time-ordered pending buffer
    fn enqueue(&mut self, measurements: Vec<SensorMeasurement>) {
        let horizon = self.fused_time + self.config.max_future;
        for m in measurements {
            if !m.timestamp.is_finite() || m.timestamp > horizon {
                warn!(
                    "dropping {:?} sample stamped {:.3} s, fused time is {:.3} s",
                    m.source, m.timestamp, self.fused_time
                );
                self.health.record_invalid(m.source);
                self.stats.invalid += 1;
                continue;
            }
            let at = self.pending.partition_point(|p| p.timestamp <= m.timestamp);
            self.pending.insert(at, m);
        }
    }

    fn process(&mut self, m: &SensorMeasurement, faults: &mut Vec<Fault>, diverged: &mut bool) {
        self.health.record_received(m.source, m.timestamp);
        if let Err(e) = m.validate() {
            warn!("dropping invalid sample: {}", e);
            self.health.record_invalid(m.source);
            self.stats.invalid += 1;
            return;
        }

        if m.timestamp < self.fused_time - self.config.stale_tolerance {
            let age = self.fused_time - m.timestamp;
            warn!("stale {:?} sample, {:.3} s behind", m.source, age);
            faults.push(Fault::StaleMeasurement { sensor: m.source, age });
            self.health.record_stale(m.source);
            self.stats.stale += 1;
            return;
        }
        if m.timestamp > self.fused_time {
            *diverged |= self.predict_to(m.timestamp);
        }

        let outage = self.fused_time - self.last_fix_time > self.config.staleness_timeout;
        if self.no_fix && outage && m.is_position_fix() {
            self.reacquire(m);
            return;
        }
        let bypass_gate = self.reacquiring > 0 && m.is_position_fix();
        if bypass_gate {
            self.reacquiring -= 1;
        } else {
            match self.active.as_estimator().innovation_distance(m) {
                Ok(distance) if distance > self.config.outlier_gate => {
                    warn!("{:?} outlier rejected (distance {:.2})", m.source, distance);
                    faults.push(Fault::OutlierRejected {
                        sensor: m.source,
                        distance,
                    });
                    self.health.record_outlier(m.source);
                    self.stats.outliers += 1;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    *diverged |= e.is_divergence();
                    debug!("gate skipped {:?} sample: {}", m.source, e);
                    return;
                }
            }
        }

        match self.active.as_estimator_mut().update(m) {
            Ok(_) => {
                self.health.record_accepted(m.source);
                self.stats.updates += 1;
                if m.is_position_fix() {
                    self.last_fix_time = self.last_fix_time.max(m.timestamp);
                }
            }
            Err(e) if e.is_divergence() => *diverged = true,
            Err(e) => {
                warn!("{:?} update failed: {}", m.source, e);
                self.health.record_invalid(m.source);
                self.stats.invalid += 1;
            }
        }
    }

    /// Re-seed the estimate from the first position fix after a lost fix
    ///
    /// The velocity estimate has been extrapolated blind for the whole
    /// outage, so its covariance is re-inflated along with the position's.
    fn reacquire(&mut self, m: &SensorMeasurement) {
        let Observation::PositionFix { position, covariance } = &m.observation else {
            return;
        };
        let estimate = self.current_estimate();
        let mut state = estimate.state;
        let jump = (position - state.position).norm();
        state.position = *position;

        let mut p = estimate.covariance;
        for block in [index::POSITION, index::VELOCITY] {
            p.rows_mut(block, 3).fill(0.0);
            p.columns_mut(block, 3).fill(0.0);
        }
        for i in 0..3 {
            for j in 0..3 {
                p[(index::POSITION + i, index::POSITION + j)] = covariance[(i, j)];
            }
            p[(index::VELOCITY + i, index::VELOCITY + i)] = self.config.reacquire_velocity_variance;
        }
        self.active.as_estimator_mut().reset(&state, &p);

        info!(
            "{:?} fix reacquired at t={:.3}, estimate moved {:.3} m",
            m.source, m.timestamp, jump
        );
        self.health.record_accepted(m.source);
        self.stats.updates += 1;
        self.stats.reacquisitions += 1;
        self.last_fix_time = self.last_fix_time.max(m.timestamp);
        self.reacquiring = self.config.reacquire_fixes;
    }

    /// Predict forward to `time`; returns whether the estimator diverged
    fn predict_to(&mut self, time: f64) -> bool {
        let dt = time - self.fused_time;
        if dt <= 0.0 {
            return false;
        }
        self.fused_time = time;
        match self.active.as_estimator_mut().predict(dt) {
            Ok(()) => false,
            Err(e) => {
                debug!("predict over {:.4} s: {}", dt, e);
                e.is_divergence()
            }
        }
    }

    fn check_fix(&mut self, faults: &mut Vec<Fault>) -> FixStatus {
        let elapsed = self.fused_time - self.last_fix_time;
        if elapsed > self.config.staleness_timeout {
            if !self.no_fix {
                warn!("no position fix for {:.3} s", elapsed);
                faults.push(Fault::NoFixAvailable { elapsed });
                self.stats.no_fix_events += 1;
                self.no_fix = true;
            }
            FixStatus::NoFix { elapsed }
        } else {
            if self.no_fix {
                info!("position fix regained at t={:.3}", self.fused_time);
                self.no_fix = false;
            }
            FixStatus::Available
        }
    }

    fn arbitrate(&mut self, diverged: bool, fix: FixStatus) {
        match &self.active {
            ActiveEstimator::Kalman(_) => {
                if self.consecutive_diverged >= self.config.divergence_switch_count {
                    self.switch_to(EstimatorKind::Particle);
                }
            }
            ActiveEstimator::Particle(pf) => {
                let consistent = !diverged
                    && fix == FixStatus::Available
                    && pf.current_estimate().uncertainty < self.config.consistency_threshold;
                self.consistent_ticks = if consistent { self.consistent_ticks + 1 } else { 0 };
                if self.consistent_ticks >= self.config.hysteresis_ticks {
                    self.switch_to(EstimatorKind::Kalman);
                }
            }
        }
    }

    fn switch_to(&mut self, kind: EstimatorKind) {
        let estimate = self.current_estimate();
        let next = match kind {
            EstimatorKind::Kalman => KalmanEstimator::new(self.config.kalman.clone(), &estimate.state).map(|mut kf| {
                kf.reset(&estimate.state, &estimate.covariance);
                ActiveEstimator::Kalman(kf)
            }),
            EstimatorKind::Particle => {
                ParticleFilter::new(self.config.particle.clone(), &estimate.state).map(|mut pf| {
                    pf.reset(&estimate.state, &estimate.covariance);
                    ActiveEstimator::Particle(pf)
                })
            }
        };
        match next {
            Ok(next) => {
                info!(
                    "switching estimator {:?} -> {:?} at t={:.3}",
                    self.active.kind(),
                    kind,
                    self.fused_time
                );
                self.active = next;
                self.stats.estimator_switches += 1;
                self.consecutive_diverged = 0;
                self.consistent_ticks = 0;
            }
            Err(e) => error!("cannot switch to {:?} estimator: {}", kind, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::estimation::{BlockVariances, SensorSource};
    use crate::Vec3;
    use approx::assert_relative_eq;

    fn manager() -> FusionManager {
        FusionManager::new(FusionConfig::default(), &VehicleState::default(), 0.0).unwrap()
    }

    fn mocap(t: f64, position: Vec3) -> SensorMeasurement {
        SensorMeasurement::position(SensorSource::MotionCapture, t, position, 0.01)
    }

    fn count(faults: &[Fault], kind: FaultKind) -> usize {
        faults.iter().filter(|f| f.kind() == kind).count()
    }

    #[test]
    fn test_zero_ticks_returns_initial_state() {
        let initial = VehicleState::at_rest(Vec3::new(0.5, -1.0, 2.0));
        let fusion = FusionManager::new(FusionConfig::default(), &initial, 3.0).unwrap();
        assert_eq!(fusion.current_estimate().state, initial);
        assert_relative_eq!(fusion.time(), 3.0);
    }

    #[test]
    fn test_rejects_non_positive_dt() {
        let mut fusion = manager();
        assert!(fusion.tick(Vec::new(), 0.0).is_err());
        assert!(fusion.tick(Vec::new(), -0.01).is_err());
    }

    #[test]
    fn test_out_of_order_samples_applied_in_time_order() {
        let mut fusion = manager();
        let batch = vec![
            mocap(0.008, Vec3::new(0.0, 0.0, 0.2)),
            mocap(0.002, Vec3::new(0.0, 0.0, 0.2)),
            mocap(0.005, Vec3::new(0.0, 0.0, 0.2)),
        ];
        let report = fusion.tick(batch, 0.01).unwrap();

        assert!(report.faults.is_empty());
        assert_eq!(fusion.stats().updates, 3);
        assert_relative_eq!(report.time, 0.01, epsilon = 1e-12);
        assert!(report.estimate.state.position.z > 0.1);
    }

    #[test]
    fn test_stale_sample_dropped() {
        let mut fusion = manager();
        for k in 1..=20 {
            fusion.tick(vec![mocap(k as f64 * 0.01, Vec3::zeros())], 0.01).unwrap();
        }
        let report = fusion.tick(vec![mocap(0.05, Vec3::zeros())], 0.01).unwrap();

        assert_eq!(count(&report.faults, FaultKind::StaleMeasurement), 1);
        assert_eq!(fusion.stats().stale, 1);
    }

    #[test]
    fn test_future_sample_waits_for_its_tick() {
        let mut fusion = manager();
        fusion.tick(vec![mocap(0.025, Vec3::zeros())], 0.01).unwrap();
        assert_eq!(fusion.pending(), 1);

        fusion.tick(Vec::new(), 0.01).unwrap();
        assert_eq!(fusion.pending(), 1);
        fusion.tick(Vec::new(), 0.01).unwrap();
        assert_eq!(fusion.pending(), 0);
        assert_eq!(fusion.stats().updates, 1);
    }

    #[test]
    fn test_outlier_gated() {
        let mut fusion = manager();
        for k in 1..=50 {
            fusion.tick(vec![mocap(k as f64 * 0.01, Vec3::zeros())], 0.01).unwrap();
        }
        let report = fusion.tick(vec![mocap(0.51, Vec3::new(5.0, 0.0, 0.0))], 0.01).unwrap();

        assert_eq!(count(&report.faults, FaultKind::OutlierRejected), 1);
        assert!(report.estimate.state.position.x.abs() < 0.1);
    }

    #[test]
    fn test_no_fix_raised_once_and_cleared() {
        let mut fusion = manager();
        let mut raised = 0;
        for _ in 0..100 {
            let report = fusion.tick(Vec::new(), 0.01).unwrap();
            raised += count(&report.faults, FaultKind::NoFixAvailable);
        }
        assert_eq!(raised, 1);

        let t = fusion.time() + 0.005;
        let report = fusion.tick(vec![mocap(t, Vec3::new(0.0, 0.0, 1.0))], 0.01).unwrap();
        assert_eq!(report.fix, FixStatus::Available);
        assert!(report.state().is_some());
    }

    #[test]
    fn test_fix_reacquired_with_stale_velocity() {
        let mut fusion = manager();
        let mut t = 0.0;
        for _ in 0..100 {
            t += 0.01;
            fusion.tick(vec![mocap(t, Vec3::zeros())], 0.01).unwrap();
        }

        // The vehicle starts moving while the fix is lost; the estimate
        // still believes it is at rest
        let velocity = Vec3::new(0.5, -0.2, 0.0);
        let truth = |t: f64| velocity * (t - 1.0);
        let mut no_fix = 0;
        for _ in 0..300 {
            t += 0.01;
            let report = fusion.tick(Vec::new(), 0.01).unwrap();
            no_fix += count(&report.faults, FaultKind::NoFixAvailable);
        }
        assert_eq!(no_fix, 1);

        let mut outliers = 0;
        for _ in 0..200 {
            t += 0.01;
            let report = fusion.tick(vec![mocap(t, truth(t))], 0.01).unwrap();
            no_fix += count(&report.faults, FaultKind::NoFixAvailable);
            outliers += count(&report.faults, FaultKind::OutlierRejected);
            assert_eq!(report.fix, FixStatus::Available);
        }

        assert_eq!(no_fix, 1);
        assert_eq!(outliers, 0);
        assert_eq!(fusion.stats().reacquisitions, 1);
        let estimate = fusion.current_estimate().state;
        assert_relative_eq!(estimate.position, truth(t), epsilon = 0.01);
        assert_relative_eq!(estimate.velocity, velocity, epsilon = 0.05);
    }

    #[test]
    fn test_far_future_sample_dropped() {
        let mut fusion = manager();
        let report = fusion.tick(vec![mocap(5.0, Vec3::zeros()), mocap(0.5, Vec3::zeros())], 0.01).unwrap();
        assert!(report.faults.is_empty());
        assert_eq!(fusion.pending(), 1);
        assert_eq!(fusion.stats().invalid, 1);
        assert_eq!(fusion.health().get(SensorSource::MotionCapture).map(|h| h.invalid), Some(1));
    }

    #[test]
    fn test_sustained_divergence_switches_to_particle_filter() {
        let config = FusionConfig {
            kalman: KalmanConfig {
                covariance_ceiling: 0.5,
                process_noise: BlockVariances::uniform(10.0),
                ..Default::default()
            },
            particle: ParticleFilterConfig {
                particle_count: 200,
                ..Default::default()
            },
            staleness_timeout: 10.0,
            ..Default::default()
        };
        let mut fusion = FusionManager::new(config, &VehicleState::default(), 0.0).unwrap();

        let mut warnings = 0;
        for _ in 0..3 {
            let report = fusion.tick(Vec::new(), 0.1).unwrap();
            warnings += count(&report.faults, FaultKind::DivergenceWarning);
            assert!(count(&report.faults, FaultKind::DivergenceWarning) <= 1);
        }
        assert_eq!(warnings, 3);
        assert_eq!(fusion.active_kind(), EstimatorKind::Particle);
        assert_eq!(fusion.stats().estimator_switches, 1);
    }

    #[test]
    fn test_particle_filter_hands_back_after_hysteresis() {
        let config = FusionConfig {
            initial_estimator: EstimatorKind::Particle,
            particle: ParticleFilterConfig {
                particle_count: 300,
                initial_variance: BlockVariances {
                    position: 0.01,
                    velocity: 0.01,
                    ..BlockVariances::initial()
                },
                ..Default::default()
            },
            hysteresis_ticks: 10,
            consistency_threshold: 0.05,
            ..Default::default()
        };
        let mut fusion = FusionManager::new(config, &VehicleState::default(), 0.0).unwrap();

        let mut t = 0.0;
        for _ in 0..200 {
            t += 0.01;
            let fix = SensorMeasurement::position(SensorSource::MotionCapture, t, Vec3::zeros(), 0.05);
            fusion.tick(vec![fix], 0.01).unwrap();
            if fusion.active_kind() == EstimatorKind::Kalman {
                break;
            }
        }
        assert_eq!(fusion.active_kind(), EstimatorKind::Kalman);
        assert_relative_eq!(fusion.current_estimate().state.position, Vec3::zeros(), epsilon = 0.1);
    }
}
