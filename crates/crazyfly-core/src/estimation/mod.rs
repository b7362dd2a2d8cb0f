//! State estimation
//!
//! - [`RecursiveEstimator`]: predict/update contract
//! - [`KalmanEstimator`]: extended Kalman filter with adaptive noise
//! - [`ParticleFilter`]: SIR particle filter
//! - [`FusionManager`]: gating, time alignment and estimator arbitration
//! - [`SensorInbox`]: thread-safe hand-off from sensor links to the loop

pub mod measurement;
pub mod estimator;
pub mod kalman;
pub mod particle;
pub mod inbox;
pub mod health;
pub mod fusion;

pub use measurement::*;
pub use estimator::{BlockVariances, Estimate, RecursiveEstimator};
pub use kalman::*;
pub use particle::*;
pub use inbox::*;
pub use health::*;
pub use fusion::*;
