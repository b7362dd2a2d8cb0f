//! L1 adaptive augmentation
//!
//! Works on the translational velocity dynamics
//!
//! v̇ = u + σ
//!
//! where u is the commanded acceleration and σ lumps every unmodeled force
//! per unit mass. A state predictor
//!
//! v̂̇ = -a (v̂ - v) + u + σ̂
//!
//! runs one tick ahead; the mismatch x̃ = v̂ - v drives the adaptation law
//! and the low-pass filtered estimate is fed back as u_ad = -C(s) σ̂.
//! With the piecewise-constant law a constant σ is recovered up to the
//! factor e^{-aT}; the nominal controller's integrator absorbs the rest.
//!
//! Adaptation is strictly causal: the estimate used at tick k depends only
//! on measurements up to tick k and commands up to tick k - 1.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Fault};
use crate::Vec3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AdaptationLaw {
    /// σ̂ = -Φ⁻¹ μ x̃, recomputed every sample
    PiecewiseConstant,
    /// σ̂̇ = -Γ x̃ with σ̂ projected onto ±`bound`
    Gradient { gain: f64, bound: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOrder {
    First,
    Second,
}

/// How the compensation combines with the nominal acceleration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Composition {
    /// nominal + compensation
    Additive,
    /// compensation only
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Predictor pole a [rad/s]
    pub predictor_pole: f64,
    pub law: AdaptationLaw,
    /// Low-pass cut-off [rad/s]
    pub filter_bandwidth: f64,
    pub filter_order: FilterOrder,
    /// Per-axis bound on the compensation [m/s²]
    pub saturation: f64,
    pub composition: Composition,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            predictor_pole: 10.0,
            law: AdaptationLaw::PiecewiseConstant,
            filter_bandwidth: 10.0,
            filter_order: FilterOrder::First,
            saturation: 3.0,
            composition: Composition::Additive,
        }
    }
}

impl L1Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.predictor_pole > 0.0, "l1.predictor_pole", "must be positive")?;
        ConfigError::check(self.filter_bandwidth > 0.0, "l1.filter_bandwidth", "must be positive")?;
        ConfigError::check(
            self.saturation > 0.0 && self.saturation.is_finite(),
            "l1.saturation",
            "must be positive",
        )?;
        if let AdaptationLaw::Gradient { gain, bound } = self.law {
            ConfigError::check(gain > 0.0 && bound > 0.0, "l1.law", "gradient gain and bound must be positive")?;
        }
        Ok(())
    }
}

/// Compensation for one tick
#[derive(Debug, Clone, PartialEq)]
pub struct L1Output {
    /// Acceleration to add to (or use instead of) the nominal command [m/s²]
    pub compensation: Vec3,
    /// Raw disturbance estimate σ̂
    pub estimate: Vec3,
    pub saturated: bool,
    pub fault: Option<Fault>,
}

/// Estimated disturbance and filter state; lives while armed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdaptiveParameters {
    pub sigma: Vec3,
    pub filter: [Vec3; 2],
}

#[derive(Debug, Clone)]
pub struct L1Adaptive {
    config: L1Config,
    params: AdaptiveParameters,
    predicted_velocity: Option<Vec3>,
    /// Measured velocity and step of the tick still waiting for its command
    pending: Option<(Vec3, f64)>,
    last_input: Vec3,
}

impl L1Adaptive {
    pub fn new(config: L1Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            params: AdaptiveParameters::default(),
            predicted_velocity: None,
            pending: None,
            last_input: Vec3::zeros(),
        })
    }

    pub fn config(&self) -> &L1Config {
        &self.config
    }

    pub fn parameters(&self) -> &AdaptiveParameters {
        &self.params
    }

    /// Forget everything learned (re-arm, safe-mode entry)
    pub fn reset(&mut self) {
        self.params = AdaptiveParameters::default();
        self.predicted_velocity = None;
        self.pending = None;
        self.last_input = Vec3::zeros();
    }

    /// Adapt from the measured velocity and return this tick's compensation
    pub fn compute(&mut self, velocity: &Vec3, dt: f64) -> L1Output {
        if self.pending.is_some() {
            // The previous tick's command was never reported
            let last = self.last_input;
            self.record_applied(&last);
        }
        if !(dt.is_finite() && dt > 0.0) || velocity.iter().any(|v| !v.is_finite()) {
            return self.zero_output();
        }

        let a = self.config.predictor_pole;
        let mu = (-a * dt).exp();
        let phi = (1.0 - mu) / a;
        let error = self.predicted_velocity.map_or(Vec3::zeros(), |predicted| predicted - velocity);

        self.params.sigma = match self.config.law {
            AdaptationLaw::PiecewiseConstant => -error * (mu / phi),
            AdaptationLaw::Gradient { gain, bound } => {
                (self.params.sigma - error * (gain * dt)).map(|s| s.clamp(-bound, bound))
            }
        };

        let alpha = 1.0 - (-self.config.filter_bandwidth * dt).exp();
        self.params.filter[0] += (self.params.sigma - self.params.filter[0]) * alpha;
        let filtered = match self.config.filter_order {
            FilterOrder::First => self.params.filter[0],
            FilterOrder::Second => {
                self.params.filter[1] += (self.params.filter[0] - self.params.filter[1]) * alpha;
                self.params.filter[1]
            }
        };

        if self.params.sigma.iter().chain(filtered.iter()).any(|v| !v.is_finite()) {
            warn!("L1 adaptation produced non-finite values, resetting");
            self.reset();
            return self.zero_output();
        }

        let limit = self.config.saturation;
        let raw = -filtered;
        let magnitude = raw.amax();
        let compensation = raw.map(|c| c.clamp(-limit, limit));
        let saturated = magnitude > limit;
        let fault = saturated.then(|| {
            warn!("L1 compensation saturated ({:.3} > {:.3})", magnitude, limit);
            Fault::AdaptiveSaturation { magnitude, limit }
        });

        self.pending = Some((*velocity, dt));
        L1Output {
            compensation,
            estimate: self.params.sigma,
            saturated,
            fault,
        }
    }

    /// Report the acceleration actually commanded this tick; advances the
    /// predictor to the next tick
    pub fn record_applied(&mut self, acceleration: &Vec3) {
        let Some((velocity, dt)) = self.pending.take() else {
            return;
        };
        let a = self.config.predictor_pole;
        let mu = (-a * dt).exp();
        let phi = (1.0 - mu) / a;
        let predicted = self.predicted_velocity.unwrap_or(velocity);
        let next = velocity + (predicted - velocity) * mu + (acceleration + self.params.sigma) * phi;
        self.predicted_velocity = next.iter().all(|v| v.is_finite()).then_some(next);
        self.last_input = *acceleration;
    }

    /// Combine nominal acceleration and compensation
    pub fn compose(&self, nominal: &Vec3, compensation: &Vec3) -> Vec3 {
        match self.config.composition {
            Composition::Additive => nominal + compensation,
            Composition::Replace => *compensation,
        }
    }

    fn zero_output(&self) -> L1Output {
        L1Output {
            compensation: Vec3::zeros(),
            estimate: Vec3::zeros(),
            saturated: false,
            fault: None,
        }
    }
}
