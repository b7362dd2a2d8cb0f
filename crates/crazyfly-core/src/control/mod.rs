//! Control laws that run without an optimizer
//!
//! - [`Pid`]: three-axis PID with anti-windup
//! - [`PidCascade`]: position → velocity → attitude → rate cascade
//! - [`L1Adaptive`]: L1 adaptive augmentation of the commanded acceleration
//! - [`MotorMixer`]: collective thrust and torque to X-configuration motors

pub mod pid;
pub mod cascade;
pub mod l1;
pub mod mixer;

pub use pid::*;
pub use cascade::*;
pub use l1::*;
pub use mixer::*;
