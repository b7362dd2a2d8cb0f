//! # CrazyFly Core
//!
//! Quadrotor state estimation and control - core library
//!
//! Everything a fixed-rate flight loop needs short of the optimizer: the
//! vehicle data model, recursive estimators and the sensor fusion manager
//! that arbitrates between them, and the control laws that close the loop.
//!
//! ## Modules
//!
//! - [`math`]: Quaternion kinematics and SO(3) helpers
//! - [`state`]: Vehicle state, references, actuator commands and envelope
//! - [`error`]: Fault taxonomy and error types
//! - [`dynamics`]: Rigid-body quadrotor model
//! - [`estimation`]: Kalman filter, particle filter, sensor fusion
//! - [`control`]: 4-layer PID cascade, L1 adaptive augmentation, motor mixer
//! - [`simulation`]: Synthetic vehicle and sensor streams

pub mod math;
pub mod state;
pub mod error;
pub mod dynamics;
pub mod estimation;
pub mod control;
pub mod simulation;

pub use error::{ConfigError, EstimatorError, Fault, FaultKind, FaultSeverity};
pub use state::{ActuatorCommand, ActuatorEnvelope, ControlReference, TrajectoryPoint, VehicleState};

// Common type aliases
use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// 3D vector type
pub type Vec3 = Vector3<f64>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f64>;

/// Unit quaternion type for rotations
pub type Quat = UnitQuaternion<f64>;

/// Gravity constant [m/s²]
pub const GRAVITY: f64 = 9.81;

/// Gravity vector in ENU convention: z-up
pub fn gravity_enu() -> Vec3 {
    Vec3::new(0.0, 0.0, -GRAVITY)
}
