//! Extended Kalman filter over the full vehicle state
//!
//! The prediction uses the shared constant-velocity motion model; each
//! measurement kind brings its own (possibly nonlinear) observation model.
//! Covariance is updated in Joseph form and re-symmetrized after every step.
//!
//! On top of the textbook filter:
//! - measurement noise is rescaled per observation kind from the observed
//!   innovation statistics (batch update every `window` samples)
//! - process and measurement noise are scheduled on the detected flight phase
//! - every diagonal entry of the covariance is capped at a ceiling; hitting
//!   it reports [`EstimatorError::Diverged`]

use std::collections::{BTreeMap, VecDeque};

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EstimatorError, EstimatorKind};
use crate::estimation::estimator::{check_time_step, propagate, transition_matrix, BlockVariances};
use crate::estimation::{Estimate, ObservationKind, RecursiveEstimator, SensorMeasurement};
use crate::state::{wrap_attitude, VehicleState, STATE_DIM};

/// Flight phase used to schedule noise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightPhase {
    Unknown,
    Ground,
    Takeoff,
    Hover,
    Maneuver,
    Landing,
}

impl FlightPhase {
    /// Process-noise multiplier
    pub fn q_factor(self) -> f64 {
        match self {
            FlightPhase::Unknown => 1.0,
            FlightPhase::Ground => 0.1,
            FlightPhase::Takeoff => 2.0,
            FlightPhase::Hover => 0.8,
            FlightPhase::Maneuver => 3.0,
            FlightPhase::Landing => 1.5,
        }
    }

    /// Measurement-noise multiplier
    pub fn r_factor(self) -> f64 {
        match self {
            FlightPhase::Unknown => 1.0,
            FlightPhase::Ground => 0.5,
            FlightPhase::Takeoff => 1.5,
            FlightPhase::Hover => 0.8,
            FlightPhase::Maneuver => 1.2,
            FlightPhase::Landing => 0.6,
        }
    }
}

/// Flight phase detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub enabled: bool,
    /// Number of consecutive updates that must all be slow to count as static
    pub static_window: usize,
    /// [m/s]
    pub static_speed: f64,
    /// Below this height the vehicle is on the ground or taking off [m]
    pub takeoff_height: f64,
    /// [m/s]
    pub takeoff_speed: f64,
    /// Below this height a slow descent is a landing [m]
    pub landing_height: f64,
    /// [m/s]
    pub landing_speed: f64,
    /// [m/s]
    pub maneuver_speed: f64,
    /// [rad/s]
    pub maneuver_rate: f64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            static_window: 10,
            static_speed: 0.01,
            takeoff_height: 0.5,
            takeoff_speed: 0.5,
            landing_height: 1.0,
            landing_speed: 0.3,
            maneuver_speed: 2.0,
            maneuver_rate: 1.0,
        }
    }
}

/// Innovation-based measurement noise adaptation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveNoiseConfig {
    pub enabled: bool,
    /// Samples per adaptation batch
    pub window: usize,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for AdaptiveNoiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            min_scale: 0.1,
            max_scale: 10.0,
        }
    }
}

/// Kalman filter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    pub initial_variance: BlockVariances,
    /// Process-noise spectral densities
    pub process_noise: BlockVariances,
    /// Maximum value of any covariance diagonal entry
    pub covariance_ceiling: f64,
    /// Smallest acceptable pivot of the innovation covariance factorization
    pub singular_tolerance: f64,
    pub adaptive_noise: AdaptiveNoiseConfig,
    pub phase: PhaseConfig,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            initial_variance: BlockVariances::initial(),
            process_noise: BlockVariances::process(),
            covariance_ceiling: 1e3,
            singular_tolerance: 1e-12,
            adaptive_noise: AdaptiveNoiseConfig::default(),
            phase: PhaseConfig::default(),
        }
    }
}

impl KalmanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.initial_variance.validate("kalman.initial_variance")?;
        self.process_noise.validate("kalman.process_noise")?;
        ConfigError::check(
            self.covariance_ceiling.is_finite() && self.covariance_ceiling > 0.0,
            "kalman.covariance_ceiling",
            "must be positive",
        )?;
        ConfigError::check(
            self.singular_tolerance >= 0.0,
            "kalman.singular_tolerance",
            "must be non-negative",
        )?;
        let adaptive = &self.adaptive_noise;
        ConfigError::check(adaptive.window > 0, "kalman.adaptive_noise.window", "must be at least 1")?;
        ConfigError::check(
            adaptive.min_scale > 0.0 && adaptive.min_scale <= adaptive.max_scale,
            "kalman.adaptive_noise",
            "scale bounds must satisfy 0 < min_scale <= max_scale",
        )?;
        ConfigError::check(
            self.phase.static_window > 0,
            "kalman.phase.static_window",
            "must be at least 1",
        )
    }
}

/// Per-kind innovation statistics driving the noise scale
#[derive(Debug, Clone)]
struct AdaptiveNoise {
    scale: f64,
    ratios: Vec<f64>,
}

impl AdaptiveNoise {
    fn new() -> Self {
        Self {
            scale: 1.0,
            ratios: Vec::new(),
        }
    }

    /// Record `yᵀy / trace(S)`; once a batch is full, rescale and start over
    fn record(&mut self, ratio: f64, config: &AdaptiveNoiseConfig) {
        if !ratio.is_finite() {
            return;
        }
        self.ratios.push(ratio);
        if self.ratios.len() >= config.window {
            let mean = self.ratios.iter().sum::<f64>() / self.ratios.len() as f64;
            self.scale = (self.scale * mean).clamp(config.min_scale, config.max_scale);
            self.ratios.clear();
        }
    }
}

#[derive(Debug, Clone)]
struct PhaseDetector {
    speeds: VecDeque<f64>,
}

impl PhaseDetector {
    fn new() -> Self {
        Self {
            speeds: VecDeque::new(),
        }
    }

    fn classify(&mut self, state: &VehicleState, config: &PhaseConfig) -> FlightPhase {
        let speed = state.velocity.norm();
        self.speeds.push_back(speed);
        while self.speeds.len() > config.static_window {
            self.speeds.pop_front();
        }
        let is_static = self.speeds.len() == config.static_window
            && self.speeds.iter().all(|s| *s < config.static_speed);
        let height = state.position.z;
        let rate = state.angular_rate.norm();

        if is_static && height < config.takeoff_height {
            FlightPhase::Ground
        } else if height < config.takeoff_height && speed > config.takeoff_speed && state.velocity.z > 0.0 {
            FlightPhase::Takeoff
        } else if height < config.landing_height && speed < config.landing_speed && state.velocity.z < 0.0 {
            FlightPhase::Landing
        } else if speed > config.maneuver_speed || rate > config.maneuver_rate {
            FlightPhase::Maneuver
        } else {
            FlightPhase::Hover
        }
    }
}

/// Kalman filter bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KalmanStats {
    pub predictions: u64,
    pub updates: u64,
    pub singular_innovations: u64,
    pub ceiling_hits: u64,
    pub phase_transitions: u64,
}

/// Extended Kalman filter implementing [`RecursiveEstimator`]
#[derive(Debug, Clone)]
pub struct KalmanEstimator {
    config: KalmanConfig,
    x: DVector<f64>,
    p: DMatrix<f64>,
    phase: FlightPhase,
    detector: PhaseDetector,
    noise_scales: BTreeMap<ObservationKind, AdaptiveNoise>,
    stats: KalmanStats,
}

impl KalmanEstimator {
    pub fn new(config: KalmanConfig, initial: &VehicleState) -> Result<Self, ConfigError> {
        config.validate()?;
        let p = config.initial_variance.covariance();
        Ok(Self {
            x: initial.to_vector(),
            p,
            phase: FlightPhase::Unknown,
            detector: PhaseDetector::new(),
            noise_scales: BTreeMap::new(),
            stats: KalmanStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &KalmanConfig {
        &self.config
    }

    pub fn phase(&self) -> FlightPhase {
        self.phase
    }

    pub fn stats(&self) -> &KalmanStats {
        &self.stats
    }

    /// Current adaptive measurement-noise scale for `kind`
    pub fn noise_scale(&self, kind: ObservationKind) -> f64 {
        self.noise_scales.get(&kind).map_or(1.0, |n| n.scale)
    }

    fn measurement_noise(&self, measurement: &SensorMeasurement) -> DMatrix<f64> {
        let mut r = measurement.observation.noise() * self.noise_scale(measurement.observation.kind());
        if self.config.phase.enabled {
            r *= self.phase.r_factor();
        }
        r
    }

    /// Innovation, its covariance and the factorization used for the gain
    fn innovate(
        &self,
        measurement: &SensorMeasurement,
    ) -> Result<(DVector<f64>, DMatrix<f64>, DMatrix<f64>, DMatrix<f64>), EstimatorError> {
        measurement.validate()?;
        let obs = &measurement.observation;
        let h = obs.jacobian(&self.x);
        let r = self.measurement_noise(measurement);
        let y = obs.innovation(&self.x);
        let mut s = &h * &self.p * h.transpose() + &r;
        symmetrize(&mut s);
        Ok((y, s, h, r))
    }

    fn factor(&self, s: DMatrix<f64>) -> Result<nalgebra::Cholesky<f64, nalgebra::Dyn>, EstimatorError> {
        let chol = s.cholesky().ok_or(EstimatorError::SingularInnovation)?;
        let min_pivot = chol
            .l_dirty()
            .diagonal()
            .iter()
            .fold(f64::INFINITY, |acc, v| acc.min(v * v));
        if min_pivot < self.config.singular_tolerance {
            return Err(EstimatorError::SingularInnovation);
        }
        Ok(chol)
    }

    fn detect_phase(&mut self) {
        if !self.config.phase.enabled {
            return;
        }
        let state = VehicleState::from_vector(&self.x);
        let phase = self.detector.classify(&state, &self.config.phase);
        if phase != self.phase {
            info!("flight phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            self.stats.phase_transitions += 1;
        }
    }
}

impl RecursiveEstimator for KalmanEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Kalman
    }

    fn predict(&mut self, dt: f64) -> Result<(), EstimatorError> {
        check_time_step(dt)?;
        let q_factor = if self.config.phase.enabled {
            self.phase.q_factor()
        } else {
            1.0
        };

        let f = transition_matrix(dt);
        self.x = propagate(&self.x, dt);
        self.p = &f * &self.p * f.transpose() + self.config.process_noise.process_noise(dt) * q_factor;
        symmetrize(&mut self.p);
        self.stats.predictions += 1;

        if enforce_ceiling(&mut self.p, self.config.covariance_ceiling) {
            self.stats.ceiling_hits += 1;
            return Err(EstimatorError::Diverged {
                uncertainty: self.p.diagonal().max(),
            });
        }
        Ok(())
    }

    fn update(&mut self, measurement: &SensorMeasurement) -> Result<f64, EstimatorError> {
        let (y, s, h, r) = self.innovate(measurement)?;
        let trace_s = s.trace();
        let chol = match self.factor(s) {
            Ok(chol) => chol,
            Err(e) => {
                self.stats.singular_innovations += 1;
                return Err(e);
            }
        };

        // K = P Hᵀ S⁻¹, computed as (S⁻¹ H P)ᵀ
        let k = chol.solve(&(&h * &self.p)).transpose();
        let distance = y.dot(&chol.solve(&y)).max(0.0).sqrt();

        self.x += &k * &y;
        wrap_attitude(&mut self.x);

        let i_kh = DMatrix::<f64>::identity(STATE_DIM, STATE_DIM) - &k * &h;
        self.p = &i_kh * &self.p * i_kh.transpose() + &k * &r * k.transpose();
        symmetrize(&mut self.p);

        if self.config.adaptive_noise.enabled {
            let kind = measurement.observation.kind();
            let config = &self.config.adaptive_noise;
            self.noise_scales
                .entry(kind)
                .or_insert_with(AdaptiveNoise::new)
                .record(y.norm_squared() / trace_s, config);
        }
        self.detect_phase();
        self.stats.updates += 1;
        debug!(
            "kalman update {:?} distance {:.3}",
            measurement.observation.kind(),
            distance
        );
        Ok(distance)
    }

    fn innovation_distance(&self, measurement: &SensorMeasurement) -> Result<f64, EstimatorError> {
        let (y, s, _, _) = self.innovate(measurement)?;
        let chol = self.factor(s)?;
        Ok(y.dot(&chol.solve(&y)).max(0.0).sqrt())
    }

    fn current_estimate(&self) -> Estimate {
        Estimate::from_moments(&self.x, self.p.clone())
    }

    fn reset(&mut self, state: &VehicleState, covariance: &DMatrix<f64>) {
        self.x = state.to_vector();
        self.p = covariance.clone();
        symmetrize(&mut self.p);
        enforce_ceiling(&mut self.p, self.config.covariance_ceiling);
        self.phase = FlightPhase::Unknown;
        self.detector = PhaseDetector::new();
        self.noise_scales.clear();
    }
}

/// Replace `m` with `(m + mᵀ) / 2`
pub(crate) fn symmetrize(m: &mut DMatrix<f64>) {
    let t = m.transpose();
    *m += t;
    *m *= 0.5;
}

/// Cap every diagonal entry of a covariance at `ceiling`
///
/// Applied as the congruence `D P D` with `D_ii = min(1, sqrt(ceiling / P_ii))`
/// so the result stays positive semi-definite. Returns whether any entry
/// had to be capped.
pub(crate) fn enforce_ceiling(p: &mut DMatrix<f64>, ceiling: f64) -> bool {
    let n = p.nrows();
    let scale = DVector::from_iterator(
        n,
        (0..n).map(|i| {
            let v = p[(i, i)];
            if v > ceiling || !v.is_finite() {
                (ceiling / v).sqrt()
            } else {
                1.0
            }
        }),
    );
    if scale.iter().all(|s| *s == 1.0) {
        return false;
    }
    for i in 0..n {
        for j in 0..n {
            let v = p[(i, j)] * scale[i] * scale[j];
            p[(i, j)] = if v.is_finite() { v } else { 0.0 };
        }
    }
    for i in 0..n {
        if !p[(i, i)].is_finite() || p[(i, i)] > ceiling {
            p[(i, i)] = ceiling;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::SensorSource;
    use crate::state::index;
    use crate::Vec3;
    use approx::assert_relative_eq;

    fn plain_config() -> KalmanConfig {
        KalmanConfig {
            adaptive_noise: AdaptiveNoiseConfig {
                enabled: false,
                ..Default::default()
            },
            phase: PhaseConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_kalman_creation() {
        let kf = KalmanEstimator::new(KalmanConfig::default(), &VehicleState::default()).unwrap();
        let estimate = kf.current_estimate();
        assert_eq!(estimate.state, VehicleState::default());
        assert_eq!(estimate.covariance.nrows(), STATE_DIM);
        assert_eq!(kf.phase(), FlightPhase::Unknown);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = KalmanConfig {
            covariance_ceiling: -1.0,
            ..Default::default()
        };
        assert!(KalmanEstimator::new(config, &VehicleState::default()).is_err());
    }

    #[test]
    fn test_predict_moves_with_velocity() {
        let mut state = VehicleState::default();
        state.velocity = Vec3::new(1.0, 0.0, 0.5);
        let mut kf = KalmanEstimator::new(plain_config(), &state).unwrap();

        kf.predict(0.1).unwrap();
        let position = kf.current_estimate().state.position;
        assert_relative_eq!(position, Vec3::new(0.1, 0.0, 0.05), epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_time_step() {
        let mut kf = KalmanEstimator::new(plain_config(), &VehicleState::default()).unwrap();
        assert_eq!(kf.predict(0.0), Err(EstimatorError::InvalidTimeStep(0.0)));
        assert!(kf.predict(f64::NAN).is_err());
    }

    #[test]
    fn test_equal_uncertainty_update_is_halfway() {
        let config = KalmanConfig {
            initial_variance: BlockVariances {
                position: 1.0,
                ..BlockVariances::initial()
            },
            ..plain_config()
        };
        let mut kf = KalmanEstimator::new(config, &VehicleState::default()).unwrap();
        let fix = SensorMeasurement::position(SensorSource::MotionCapture, 0.01, Vec3::new(1.0, 0.0, 0.0), 1.0);

        let distance = kf.update(&fix).unwrap();
        let estimate = kf.current_estimate();
        assert_relative_eq!(estimate.state.position.x, 0.5, epsilon = 1e-10);
        assert_relative_eq!(estimate.covariance[(0, 0)], 0.5, epsilon = 1e-10);
        assert_relative_eq!(distance, 1.0 / 2.0_f64.sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn test_update_keeps_covariance_symmetric() {
        let mut state = VehicleState::default();
        state.attitude = crate::Quat::from_euler_angles(0.1, -0.05, 0.3);
        let mut kf = KalmanEstimator::new(KalmanConfig::default(), &state).unwrap();
        let imu = SensorMeasurement::imu(0.01, Vec3::new(0.3, 0.9, 9.7), Vec3::new(0.01, 0.0, 0.0), 0.2, 0.01);

        kf.predict(0.01).unwrap();
        kf.update(&imu).unwrap();
        let p = kf.current_estimate().covariance;
        assert_relative_eq!(p.clone(), p.transpose(), epsilon = 1e-12);
        assert!(p.diagonal().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_singular_innovation_skips_update() {
        let config = KalmanConfig {
            initial_variance: BlockVariances::uniform(0.0),
            ..plain_config()
        };
        let mut kf = KalmanEstimator::new(config, &VehicleState::default()).unwrap();
        let fix = SensorMeasurement::altitude(SensorSource::Barometer, 0.01, 5.0, 1e-9);

        assert_eq!(kf.update(&fix), Err(EstimatorError::SingularInnovation));
        assert_relative_eq!(kf.current_estimate().state.position.z, 0.0);
        assert_eq!(kf.stats().singular_innovations, 1);
    }

    #[test]
    fn test_ceiling_reports_divergence() {
        let config = KalmanConfig {
            covariance_ceiling: 10.0,
            ..plain_config()
        };
        let mut kf = KalmanEstimator::new(config, &VehicleState::default()).unwrap();

        let mut diverged = false;
        for _ in 0..100 {
            if let Err(e) = kf.predict(1.0) {
                assert!(e.is_divergence());
                diverged = true;
            }
        }
        assert!(diverged);
        let p = kf.current_estimate().covariance;
        assert!(p.diagonal().iter().all(|v| *v <= 10.0 + 1e-9));
        assert!(p.clone().cholesky().is_some() || p.symmetric_eigenvalues().min() > -1e-9);
    }

    #[test]
    fn test_adaptive_scale_grows_with_large_innovations() {
        let config = KalmanConfig {
            phase: PhaseConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut kf = KalmanEstimator::new(config, &VehicleState::default()).unwrap();

        // Altitude alternating far above and below the estimate: reported
        // noise is much smaller than the actual scatter.
        for k in 1..=20 {
            let z = if k % 2 == 0 { 2.0 } else { -2.0 };
            let fix = SensorMeasurement::altitude(SensorSource::Barometer, k as f64 * 0.01, z, 0.01);
            kf.predict(0.01).unwrap();
            kf.update(&fix).unwrap();
        }
        assert!(kf.noise_scale(ObservationKind::Altitude) > 1.0);
        assert!(kf.noise_scale(ObservationKind::Altitude) <= 10.0);
        assert_relative_eq!(kf.noise_scale(ObservationKind::Position), 1.0);
    }

    #[test]
    fn test_ground_phase_detected_when_static() {
        let mut kf = KalmanEstimator::new(KalmanConfig::default(), &VehicleState::default()).unwrap();
        for k in 1..=12 {
            let fix = SensorMeasurement::velocity(SensorSource::MotionCapture, k as f64 * 0.01, Vec3::zeros(), 1e-3);
            kf.update(&fix).unwrap();
        }
        assert_eq!(kf.phase(), FlightPhase::Ground);
        assert!(kf.stats().phase_transitions >= 1);
    }

    #[test]
    fn test_reset_restores_state() {
        let mut kf = KalmanEstimator::new(plain_config(), &VehicleState::default()).unwrap();
        kf.predict(0.5).unwrap();

        let target = VehicleState::at_rest(Vec3::new(1.0, 2.0, 3.0));
        let covariance = BlockVariances::uniform(0.2).covariance();
        kf.reset(&target, &covariance);

        let estimate = kf.current_estimate();
        assert_relative_eq!(estimate.state.position, target.position);
        assert_relative_eq!(estimate.covariance[(index::VELOCITY, index::VELOCITY)], 0.2);
    }
}
