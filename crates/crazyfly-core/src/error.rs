//! Fault taxonomy and error types
//!
//! Faults are raised inside a tick and reported alongside its result; none
//! of them aborts the tick. Errors are returned by fallible operations and
//! usually turned into a [`Fault`] one layer up.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::estimation::SensorSource;

/// Which estimator produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorKind {
    Kalman,
    Particle,
}

/// Which control law produced a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Motors off while idle on the ground
    Idle,
    /// 4-layer PID cascade
    Pid,
    /// PID cascade with L1 adaptive augmentation
    PidL1,
    /// Model predictive control
    Mpc,
    /// MPC with L1 adaptive augmentation
    MpcL1,
    /// Safe-fallback command forced by the arbiter
    SafeFallback,
}

/// Faults raised during a tick
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("{estimator:?} estimator diverged (uncertainty {uncertainty:.3e})")]
    DivergenceWarning {
        estimator: EstimatorKind,
        uncertainty: f64,
    },
    #[error("stale {sensor:?} measurement discarded ({age:.3} s behind fused time)")]
    StaleMeasurement { sensor: SensorSource, age: f64 },
    #[error("{sensor:?} measurement rejected by innovation gate (distance {distance:.2})")]
    OutlierRejected { sensor: SensorSource, distance: f64 },
    #[error("{controller:?} controller fault: {reason}")]
    ControlFault {
        controller: ControllerKind,
        reason: String,
    },
    #[error("adaptive term saturated ({magnitude:.3} exceeds {limit:.3})")]
    AdaptiveSaturation { magnitude: f64, limit: f64 },
    #[error("no position fix for {elapsed:.3} s")]
    NoFixAvailable { elapsed: f64 },
}

/// Payload-free discriminant of [`Fault`], for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaultKind {
    DivergenceWarning,
    StaleMeasurement,
    OutlierRejected,
    ControlFault,
    AdaptiveSaturation,
    NoFixAvailable,
}

/// How a fault is treated by the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSeverity {
    /// Informational; the offending input was dropped or clamped
    Advisory,
    /// Handled by a local recovery action (estimator switch, fallback command)
    Recoverable,
}

impl Fault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::DivergenceWarning { .. } => FaultKind::DivergenceWarning,
            Fault::StaleMeasurement { .. } => FaultKind::StaleMeasurement,
            Fault::OutlierRejected { .. } => FaultKind::OutlierRejected,
            Fault::ControlFault { .. } => FaultKind::ControlFault,
            Fault::AdaptiveSaturation { .. } => FaultKind::AdaptiveSaturation,
            Fault::NoFixAvailable { .. } => FaultKind::NoFixAvailable,
        }
    }

    pub fn severity(&self) -> FaultSeverity {
        match self.kind() {
            FaultKind::AdaptiveSaturation
            | FaultKind::StaleMeasurement
            | FaultKind::OutlierRejected => FaultSeverity::Advisory,
            FaultKind::DivergenceWarning | FaultKind::ControlFault | FaultKind::NoFixAvailable => {
                FaultSeverity::Recoverable
            }
        }
    }
}

/// Estimator errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimatorError {
    #[error("time step must be positive and finite, got {0}")]
    InvalidTimeStep(f64),
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),
    #[error("innovation covariance is singular")]
    SingularInnovation,
    #[error("covariance ceiling reached (uncertainty {uncertainty:.3e})")]
    Diverged { uncertainty: f64 },
    #[error("particle weights collapsed")]
    WeightCollapse,
}

impl EstimatorError {
    /// Whether the error means the estimator can no longer be trusted
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            EstimatorError::SingularInnovation
                | EstimatorError::Diverged { .. }
                | EstimatorError::WeightCollapse
        )
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    /// Fail with `reason` unless `condition` holds
    pub fn check(condition: bool, field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
        if condition {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                field,
                reason: reason.into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturation_is_advisory() {
        let fault = Fault::AdaptiveSaturation {
            magnitude: 4.0,
            limit: 3.0,
        };
        assert_eq!(fault.kind(), FaultKind::AdaptiveSaturation);
        assert_eq!(fault.severity(), FaultSeverity::Advisory);
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::OutlierRejected {
            sensor: SensorSource::MotionCapture,
            distance: 7.25,
        };
        assert_eq!(
            fault.to_string(),
            "MotionCapture measurement rejected by innovation gate (distance 7.25)"
        );
    }

    #[test]
    fn test_config_check() {
        assert!(ConfigError::check(true, "dt", "positive").is_ok());
        let err = ConfigError::check(false, "dt", "must be positive").unwrap_err();
        assert_eq!(err.to_string(), "invalid dt: must be positive");
    }
}
