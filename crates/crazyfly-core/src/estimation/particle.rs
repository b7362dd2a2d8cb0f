//! Sequential importance resampling particle filter
//!
//! Each particle is a full state vector. Prediction pushes every particle
//! through the motion model with sampled process noise; an update reweights
//! by measurement likelihood and resamples once the effective sample size
//! drops below `resample_threshold · N`.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EstimatorError, EstimatorKind};
use crate::estimation::estimator::{check_time_step, mahalanobis, propagate, BlockVariances};
use crate::estimation::{Estimate, RecursiveEstimator, SensorMeasurement};
use crate::math::wrap_angle;
use crate::state::{index, wrap_attitude, VehicleState, STATE_DIM};

/// How the particle set is redrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResamplingStrategy {
    /// One uniform offset, N evenly spaced pointers
    Systematic,
    /// N independent draws
    Multinomial,
    /// One independent draw per stratum
    Stratified,
    /// Deterministic copies of `floor(N·w)`, remainder drawn multinomially
    Residual,
}

/// Particle filter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleFilterConfig {
    pub particle_count: usize,
    /// Resample when ESS falls below this fraction of the particle count
    pub resample_threshold: f64,
    pub strategy: ResamplingStrategy,
    /// Jitter particles after resampling
    pub regularize: bool,
    /// Jitter standard deviation as a fraction of the cloud's spread
    pub regularization_scale: f64,
    pub initial_variance: BlockVariances,
    pub process_noise: BlockVariances,
    /// Maximum per-axis variance of the cloud
    pub covariance_ceiling: f64,
    pub seed: u64,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        Self {
            particle_count: 1000,
            resample_threshold: 0.5,
            strategy: ResamplingStrategy::Systematic,
            regularize: false,
            regularization_scale: 0.1,
            initial_variance: BlockVariances::initial(),
            process_noise: BlockVariances::process(),
            covariance_ceiling: 1e3,
            seed: 7,
        }
    }
}

impl ParticleFilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.particle_count > 0, "particle.particle_count", "must be at least 1")?;
        ConfigError::check(
            self.resample_threshold > 0.0 && self.resample_threshold <= 1.0,
            "particle.resample_threshold",
            "must be in (0, 1]",
        )?;
        ConfigError::check(
            self.regularization_scale >= 0.0,
            "particle.regularization_scale",
            "must be non-negative",
        )?;
        ConfigError::check(
            self.covariance_ceiling.is_finite() && self.covariance_ceiling > 0.0,
            "particle.covariance_ceiling",
            "must be positive",
        )?;
        self.initial_variance.validate("particle.initial_variance")?;
        self.process_noise.validate("particle.process_noise")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub state: DVector<f64>,
    pub weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParticleStats {
    pub updates: u64,
    pub resamples: u64,
    pub weight_collapses: u64,
}

/// Particle filter implementing [`RecursiveEstimator`]
#[derive(Debug, Clone)]
pub struct ParticleFilter {
    config: ParticleFilterConfig,
    particles: Vec<Particle>,
    rng: ChaCha8Rng,
    stats: ParticleStats,
}

impl ParticleFilter {
    pub fn new(config: ParticleFilterConfig, initial: &VehicleState) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut filter = Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            particles: Vec::with_capacity(config.particle_count),
            stats: ParticleStats::default(),
            config,
        };
        let covariance = filter.config.initial_variance.covariance();
        filter.reset(initial, &covariance);
        Ok(filter)
    }

    /// Build from an explicit particle set; weights are normalized
    pub fn from_particles(config: ParticleFilterConfig, particles: Vec<Particle>) -> Result<Self, ConfigError> {
        config.validate()?;
        ConfigError::check(
            particles.iter().all(|p| p.state.len() == STATE_DIM),
            "particles",
            "every particle must carry a full state vector",
        )?;
        let total: f64 = particles.iter().map(|p| p.weight).sum();
        ConfigError::check(
            !particles.is_empty() && total.is_finite() && total > 0.0,
            "particles",
            "weights must be finite with a positive sum",
        )?;
        let seed = config.seed;
        let mut filter = Self {
            config: ParticleFilterConfig {
                particle_count: particles.len(),
                ..config
            },
            rng: ChaCha8Rng::seed_from_u64(seed),
            particles,
            stats: ParticleStats::default(),
        };
        for p in &mut filter.particles {
            p.weight /= total;
        }
        Ok(filter)
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn stats(&self) -> &ParticleStats {
        &self.stats
    }

    /// `1 / Σ wᵢ²`
    pub fn effective_sample_size(&self) -> f64 {
        let sum_sq: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_sq > 0.0 {
            1.0 / sum_sq
        } else {
            0.0
        }
    }

    /// Weighted mean, with a circular mean for roll/pitch/yaw
    pub fn mean(&self) -> DVector<f64> {
        let mut mean = DVector::zeros(STATE_DIM);
        for p in &self.particles {
            mean.axpy(p.weight, &p.state, 1.0);
        }
        for i in index::ATTITUDE..index::ATTITUDE + 3 {
            let (s, c) = self.particles.iter().fold((0.0, 0.0), |(s, c), p| {
                (s + p.weight * p.state[i].sin(), c + p.weight * p.state[i].cos())
            });
            mean[i] = s.atan2(c);
        }
        mean
    }

    /// Weighted covariance about `mean`
    pub fn covariance(&self, mean: &DVector<f64>) -> DMatrix<f64> {
        let mut cov = DMatrix::zeros(STATE_DIM, STATE_DIM);
        for p in &self.particles {
            let d = deviation(&p.state, mean);
            cov.ger(p.weight, &d, &d, 1.0);
        }
        cov
    }

    /// Redraw the particle set with the configured strategy
    pub fn resample(&mut self) {
        let n = self.particles.len();
        let spread = if self.config.regularize {
            let mean = self.mean();
            Some(self.covariance(&mean).diagonal().map(|v| v.max(0.0).sqrt()))
        } else {
            None
        };

        let indices = match self.config.strategy {
            ResamplingStrategy::Systematic => {
                let u0 = self.rng.gen::<f64>() / n as f64;
                self.pointer_search((0..n).map(|j| u0 + j as f64 / n as f64).collect())
            }
            ResamplingStrategy::Stratified => {
                let pointers = (0..n)
                    .map(|j| (j as f64 + self.rng.gen::<f64>()) / n as f64)
                    .collect();
                self.pointer_search(pointers)
            }
            ResamplingStrategy::Multinomial => {
                let weights: Vec<f64> = self.particles.iter().map(|p| p.weight).collect();
                self.multinomial(&weights, n)
            }
            ResamplingStrategy::Residual => self.residual(),
        };

        let uniform = 1.0 / n as f64;
        let mut next: Vec<Particle> = indices
            .into_iter()
            .map(|i| Particle {
                state: self.particles[i].state.clone(),
                weight: uniform,
            })
            .collect();

        if let Some(std) = spread {
            let scale = self.config.regularization_scale;
            for p in &mut next {
                for k in 0..STATE_DIM {
                    let z: f64 = self.rng.sample(StandardNormal);
                    p.state[k] += scale * std[k] * z;
                }
                wrap_attitude(&mut p.state);
            }
        }
        self.particles = next;
        self.stats.resamples += 1;
    }

    /// Map sorted pointers in [0, 1) onto the cumulative weight distribution
    fn pointer_search(&self, pointers: Vec<f64>) -> Vec<usize> {
        let n = self.particles.len();
        let mut indices = Vec::with_capacity(pointers.len());
        let mut cumulative = self.particles[0].weight;
        let mut i = 0;
        for u in pointers {
            while u > cumulative && i < n - 1 {
                i += 1;
                cumulative += self.particles[i].weight;
            }
            indices.push(i);
        }
        indices
    }

    fn multinomial(&mut self, weights: &[f64], count: usize) -> Vec<usize> {
        let total: f64 = weights.iter().sum();
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut acc = 0.0;
        for w in weights {
            acc += w / total;
            cumulative.push(acc);
        }
        (0..count)
            .map(|_| {
                let u = self.rng.gen::<f64>();
                cumulative
                    .partition_point(|c| *c < u)
                    .min(weights.len() - 1)
            })
            .collect()
    }

    fn residual(&mut self) -> Vec<usize> {
        let n = self.particles.len();
        let mut indices = Vec::with_capacity(n);
        let mut residuals = Vec::with_capacity(n);
        for (i, p) in self.particles.iter().enumerate() {
            let expected = p.weight * n as f64;
            let copies = expected.floor();
            indices.extend(std::iter::repeat(i).take(copies as usize));
            residuals.push(expected - copies);
        }
        let remaining = n - indices.len();
        if remaining > 0 {
            let extra = self.multinomial(&residuals, remaining);
            indices.extend(extra);
        }
        indices
    }

    /// Normalize in place, zeroing weights below machine epsilon
    fn normalize(&mut self) -> Result<(), EstimatorError> {
        for _ in 0..2 {
            let total: f64 = self.particles.iter().map(|p| p.weight).sum();
            if !(total.is_finite() && total > 0.0) {
                return Err(EstimatorError::WeightCollapse);
            }
            for p in &mut self.particles {
                p.weight /= total;
                if p.weight < f64::EPSILON {
                    p.weight = 0.0;
                }
            }
        }
        Ok(())
    }

    fn reset_weights(&mut self) {
        let uniform = 1.0 / self.particles.len() as f64;
        for p in &mut self.particles {
            p.weight = uniform;
        }
    }

    /// Pull particles toward the mean on every axis whose variance exceeds
    /// the ceiling. Returns the largest variance found before shrinking.
    fn enforce_ceiling(&mut self) -> Option<f64> {
        let mean = self.mean();
        let variances = self.covariance(&mean).diagonal();
        let ceiling = self.config.covariance_ceiling;
        let worst = variances.max();
        if worst <= ceiling {
            return None;
        }
        for k in 0..STATE_DIM {
            if variances[k] > ceiling {
                let shrink = (ceiling / variances[k]).sqrt();
                for p in &mut self.particles {
                    let d = if (index::ATTITUDE..index::ATTITUDE + 3).contains(&k) {
                        wrap_angle(p.state[k] - mean[k])
                    } else {
                        p.state[k] - mean[k]
                    };
                    p.state[k] = mean[k] + shrink * d;
                }
            }
        }
        wrap_attitude_all(&mut self.particles);
        Some(worst)
    }
}

impl RecursiveEstimator for ParticleFilter {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Particle
    }

    fn predict(&mut self, dt: f64) -> Result<(), EstimatorError> {
        check_time_step(dt)?;
        let std = self.config.process_noise.diagonal().map(|q| (q * dt).sqrt());
        for p in &mut self.particles {
            let mut next = propagate(&p.state, dt);
            for k in 0..STATE_DIM {
                if std[k] > 0.0 {
                    let z: f64 = self.rng.sample(StandardNormal);
                    next[k] += std[k] * z;
                }
            }
            wrap_attitude(&mut next);
            p.state = next;
        }
        match self.enforce_ceiling() {
            Some(uncertainty) => Err(EstimatorError::Diverged { uncertainty }),
            None => Ok(()),
        }
    }

    fn update(&mut self, measurement: &SensorMeasurement) -> Result<f64, EstimatorError> {
        let distance = self.innovation_distance(measurement)?;
        let obs = &measurement.observation;
        let r = obs.noise();
        let chol = r.cholesky().ok_or(EstimatorError::SingularInnovation)?;

        let log_weights: Vec<f64> = self
            .particles
            .iter()
            .map(|p| {
                let y = obs.innovation(&p.state);
                p.weight.ln() - 0.5 * y.dot(&chol.solve(&y))
            })
            .collect();
        let max = log_weights
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);

        self.stats.updates += 1;
        if !max.is_finite() {
            return self.collapse();
        }
        for (p, lw) in self.particles.iter_mut().zip(&log_weights) {
            p.weight = if lw.is_finite() { (lw - max).exp() } else { 0.0 };
        }
        if self.normalize().is_err() {
            return self.collapse();
        }

        let ess = self.effective_sample_size();
        let threshold = self.config.resample_threshold * self.particles.len() as f64;
        if ess < threshold {
            debug!("particle filter resampling (ess {:.1} < {:.1})", ess, threshold);
            self.resample();
        }
        Ok(distance)
    }

    fn innovation_distance(&self, measurement: &SensorMeasurement) -> Result<f64, EstimatorError> {
        measurement.validate()?;
        let obs = &measurement.observation;
        let m = obs.dim();

        let innovations: Vec<DVector<f64>> = self.particles.iter().map(|p| obs.innovation(&p.state)).collect();
        let mut mean = DVector::zeros(m);
        for (p, y) in self.particles.iter().zip(&innovations) {
            mean.axpy(p.weight, y, 1.0);
        }
        let mut s = obs.noise();
        for (p, y) in self.particles.iter().zip(&innovations) {
            let d = y - &mean;
            s.ger(p.weight, &d, &d, 1.0);
        }
        mahalanobis(&mean, &s)
    }

    fn current_estimate(&self) -> Estimate {
        let mean = self.mean();
        let covariance = self.covariance(&mean);
        Estimate::from_moments(&mean, covariance)
    }

    fn reset(&mut self, state: &VehicleState, covariance: &DMatrix<f64>) {
        let mean = state.to_vector();
        let factor = match covariance.clone().cholesky() {
            Some(chol) => chol.unpack(),
            None => DMatrix::from_diagonal(&covariance.diagonal().map(|v| v.max(0.0).sqrt())),
        };
        let n = self.config.particle_count;
        let weight = 1.0 / n as f64;
        self.particles = (0..n)
            .map(|_| {
                let z = DVector::from_iterator(
                    STATE_DIM,
                    (0..STATE_DIM).map(|_| self.rng.sample::<f64, _>(StandardNormal)),
                );
                let mut x = &mean + &factor * z;
                wrap_attitude(&mut x);
                Particle { state: x, weight }
            })
            .collect();
    }
}

impl ParticleFilter {
    fn collapse(&mut self) -> Result<f64, EstimatorError> {
        warn!("particle weights collapsed, resetting to uniform");
        self.reset_weights();
        self.stats.weight_collapses += 1;
        Err(EstimatorError::WeightCollapse)
    }
}

fn deviation(x: &DVector<f64>, mean: &DVector<f64>) -> DVector<f64> {
    let mut d = x - mean;
    for i in index::ATTITUDE..index::ATTITUDE + 3 {
        d[i] = wrap_angle(d[i]);
    }
    d
}

fn wrap_attitude_all(particles: &mut [Particle]) {
    for p in particles {
        wrap_attitude(&mut p.state);
    }
}
