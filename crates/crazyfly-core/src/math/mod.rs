//! Mathematical utilities for CrazyFly
//!
//! Quaternion kinematics, SO(3) helpers and angle wrapping shared by the
//! estimators, the controllers and the simulator.

pub mod quaternion;
pub mod rotation;

pub use quaternion::*;
pub use rotation::*;
