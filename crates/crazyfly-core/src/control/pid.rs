//! Three-axis PID with anti-windup
//!
//! One instance per cascade layer. Each axis is saturated independently;
//! the integrator is frozen on an axis whose output saturated on the
//! previous step while the error still pushes further into saturation, and
//! the integrator state itself is clamped to `integral_limit`.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::Vec3;

/// Gains and limits for one PID layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: Vec3,
    pub ki: Vec3,
    pub kd: Vec3,
    /// Per-axis bound on the integrator state
    pub integral_limit: f64,
    /// Per-axis bound on the output
    pub output_limit: f64,
}

impl PidGains {
    pub fn proportional(kp: Vec3, output_limit: f64) -> Self {
        Self {
            kp,
            ki: Vec3::zeros(),
            kd: Vec3::zeros(),
            integral_limit: 0.0,
            output_limit,
        }
    }

    pub fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        let gains_ok = self
            .kp
            .iter()
            .chain(self.ki.iter())
            .chain(self.kd.iter())
            .all(|g| g.is_finite() && *g >= 0.0);
        ConfigError::check(gains_ok, field, "gains must be finite and non-negative")?;
        ConfigError::check(
            self.integral_limit >= 0.0 && self.output_limit > 0.0,
            field,
            "limits must be non-negative (integral) and positive (output)",
        )
    }
}

/// Tracking statistics of one layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PidStats {
    pub updates: u64,
    /// Largest error norm seen
    pub max_error: f64,
    sum_squared_error: f64,
}

impl PidStats {
    /// Root-mean-square of the error norm
    pub fn rms_error(&self) -> f64 {
        if self.updates == 0 {
            0.0
        } else {
            (self.sum_squared_error / self.updates as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pid {
    pub gains: PidGains,
    integral: Vec3,
    previous_error: Option<Vec3>,
    saturated: [bool; 3],
    last_output: Vec3,
    stats: PidStats,
}

impl Pid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: Vec3::zeros(),
            previous_error: None,
            saturated: [false; 3],
            last_output: Vec3::zeros(),
            stats: PidStats::default(),
        }
    }

    /// u = kp·e + ki·∫e + kd·ė + feedforward, saturated per axis
    pub fn update(&mut self, error: &Vec3, feedforward: &Vec3, dt: f64) -> Vec3 {
        let limit = self.gains.output_limit;
        let derivative = match self.previous_error {
            Some(prev) if dt > 0.0 => (error - prev) / dt,
            _ => Vec3::zeros(),
        };

        for i in 0..3 {
            let winding_up = self.saturated[i] && error[i] * self.last_output[i] > 0.0;
            if !winding_up && dt > 0.0 && error[i].is_finite() {
                self.integral[i] += error[i] * dt;
            }
            self.integral[i] = self.integral[i].clamp(-self.gains.integral_limit, self.gains.integral_limit);
        }

        let raw = self.gains.kp.component_mul(error)
            + self.gains.ki.component_mul(&self.integral)
            + self.gains.kd.component_mul(&derivative)
            + feedforward;

        let mut output = Vec3::zeros();
        for i in 0..3 {
            output[i] = raw[i].clamp(-limit, limit);
            self.saturated[i] = raw[i].abs() > limit;
        }

        self.previous_error = error.iter().all(|e| e.is_finite()).then_some(*error);
        self.last_output = output;
        let norm = error.norm();
        self.stats.updates += 1;
        self.stats.max_error = self.stats.max_error.max(norm);
        self.stats.sum_squared_error += norm * norm;
        output
    }

    /// Clear integrator and derivative history
    pub fn reset(&mut self) {
        self.integral = Vec3::zeros();
        self.previous_error = None;
        self.saturated = [false; 3];
        self.last_output = Vec3::zeros();
    }

    pub fn integral(&self) -> &Vec3 {
        &self.integral
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.iter().any(|s| *s)
    }

    pub fn stats(&self) -> &PidStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gains() -> PidGains {
        PidGains {
            kp: Vec3::new(2.0, 2.0, 2.0),
            ki: Vec3::new(1.0, 1.0, 1.0),
            kd: Vec3::zeros(),
            integral_limit: 0.5,
            output_limit: 1.0,
        }
    }

    #[test]
    fn test_zero_error_zero_output() {
        let mut pid = Pid::new(gains());
        let out = pid.update(&Vec3::zeros(), &Vec3::zeros(), 0.01);
        assert_relative_eq!(out, Vec3::zeros());
    }

    #[test]
    fn test_proportional_and_feedforward() {
        let mut pid = Pid::new(PidGains::proportional(Vec3::new(1.0, 2.0, 3.0), 10.0));
        let out = pid.update(&Vec3::new(1.0, 1.0, -1.0), &Vec3::new(0.5, 0.0, 0.0), 0.01);
        assert_relative_eq!(out, Vec3::new(1.5, 2.0, -3.0));
    }

    #[test]
    fn test_output_saturates_per_axis() {
        let mut pid = Pid::new(gains());
        let out = pid.update(&Vec3::new(10.0, 0.1, -10.0), &Vec3::zeros(), 0.01);
        assert_relative_eq!(out.x, 1.0);
        assert_relative_eq!(out.z, -1.0);
        assert!(out.y.abs() < 1.0);
        assert!(pid.is_saturated());
    }

    #[test]
    fn test_integrator_frozen_while_saturated() {
        let mut pid = Pid::new(gains());
        let error = Vec3::new(5.0, 0.0, 0.0);

        pid.update(&error, &Vec3::zeros(), 0.01);
        let after_first = pid.integral().x;
        for _ in 0..100 {
            pid.update(&error, &Vec3::zeros(), 0.01);
        }
        assert_relative_eq!(pid.integral().x, after_first);

        // Error reversing unfreezes the integrator
        pid.update(&Vec3::new(-0.1, 0.0, 0.0), &Vec3::zeros(), 0.01);
        assert!(pid.integral().x < after_first);
    }

    #[test]
    fn test_non_finite_error_leaves_integrator_clean() {
        let mut pid = Pid::new(gains());
        pid.update(&Vec3::new(0.1, 0.0, 0.0), &Vec3::zeros(), 0.01);
        let before = *pid.integral();

        pid.update(&Vec3::new(f64::NAN, 0.0, 0.0), &Vec3::zeros(), 0.01);
        assert!(pid.integral().iter().all(|v| v.is_finite()));
        assert_relative_eq!(pid.integral().x, before.x);

        let out = pid.update(&Vec3::new(0.1, 0.0, 0.0), &Vec3::zeros(), 0.01);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_integrator_clamped() {
        let mut pid = Pid::new(PidGains {
            kp: Vec3::zeros(),
            output_limit: 100.0,
            ..gains()
        });
        for _ in 0..1000 {
            pid.update(&Vec3::new(1.0, -1.0, 0.0), &Vec3::zeros(), 0.1);
            assert!(pid.integral().amax() <= 0.5 + 1e-12);
        }
        assert_relative_eq!(pid.integral().x, 0.5);
        assert_relative_eq!(pid.integral().y, -0.5);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pid = Pid::new(gains());
        pid.update(&Vec3::new(0.1, 0.0, 0.0), &Vec3::zeros(), 0.1);
        pid.reset();
        assert_relative_eq!(*pid.integral(), Vec3::zeros());
        assert!(!pid.is_saturated());
    }

    #[test]
    fn test_stats_track_error() {
        let mut pid = Pid::new(gains());
        pid.update(&Vec3::new(3.0, 4.0, 0.0), &Vec3::zeros(), 0.01);
        pid.update(&Vec3::zeros(), &Vec3::zeros(), 0.01);
        assert_eq!(pid.stats().updates, 2);
        assert_relative_eq!(pid.stats().max_error, 5.0);
        assert_relative_eq!(pid.stats().rms_error(), (25.0f64 / 2.0).sqrt());
    }
}
