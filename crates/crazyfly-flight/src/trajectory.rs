//! Reference trajectory generators
//!
//! Analytic references sampled by the flight loop each tick. Takeoff and
//! landing follow the smooth step `h(s) = 3s² − 2s³`, `s = clamp(t / T, 0, 1)`,
//! so velocity is zero at both ends of the manoeuvre.

use serde::{Deserialize, Serialize};

use crazyfly_core::{ControlReference, TrajectoryPoint, Vec3};

/// Position, velocity and acceleration at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
}

/// Smooth step and its first two time derivatives
fn smooth_step(t: f64, duration: f64) -> (f64, f64, f64) {
    if duration <= 0.0 || t >= duration {
        return (1.0, 0.0, 0.0);
    }
    if t <= 0.0 {
        return (0.0, 0.0, 0.0);
    }
    let s = t / duration;
    (
        3.0 * s * s - 2.0 * s * s * s,
        (6.0 * s - 6.0 * s * s) / duration,
        (6.0 - 12.0 * s) / (duration * duration),
    )
}

/// A time-parameterised reference, `t` measured from the segment start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trajectory {
    /// Stay at a fixed position
    Hold { position: Vec3, yaw: f64 },
    /// Vertical climb by `height` over `duration`
    Takeoff {
        from: Vec3,
        height: f64,
        duration: f64,
        yaw: f64,
    },
    /// Vertical descent to the ground plane over `duration`
    Landing { from: Vec3, duration: f64, yaw: f64 },
    /// Horizontal circle, counter-clockwise for positive `angular_speed`
    Circle {
        center: Vec3,
        radius: f64,
        /// [rad/s]
        angular_speed: f64,
        /// Angle at t = 0 [rad]
        phase: f64,
        yaw: f64,
    },
}

impl Trajectory {
    pub fn hold(position: Vec3, yaw: f64) -> Self {
        Trajectory::Hold { position, yaw }
    }

    /// Circle through `start` at t = 0, with its centre `radius` away along -x
    pub fn circle_through(start: Vec3, radius: f64, angular_speed: f64, yaw: f64) -> Self {
        Trajectory::Circle {
            center: start - Vec3::new(radius, 0.0, 0.0),
            radius,
            angular_speed,
            phase: 0.0,
            yaw,
        }
    }

    pub fn sample(&self, t: f64) -> Sample {
        match *self {
            Trajectory::Hold { position, .. } => Sample {
                position,
                velocity: Vec3::zeros(),
                acceleration: Vec3::zeros(),
            },
            Trajectory::Takeoff {
                from,
                height,
                duration,
                ..
            } => {
                let (h, dh, ddh) = smooth_step(t, duration);
                Sample {
                    position: from + Vec3::new(0.0, 0.0, height * h),
                    velocity: Vec3::new(0.0, 0.0, height * dh),
                    acceleration: Vec3::new(0.0, 0.0, height * ddh),
                }
            }
            Trajectory::Landing { from, duration, .. } => {
                let drop = -from.z;
                let (h, dh, ddh) = smooth_step(t, duration);
                Sample {
                    position: from + Vec3::new(0.0, 0.0, drop * h),
                    velocity: Vec3::new(0.0, 0.0, drop * dh),
                    acceleration: Vec3::new(0.0, 0.0, drop * ddh),
                }
            }
            Trajectory::Circle {
                center,
                radius,
                angular_speed,
                phase,
                ..
            } => {
                let theta = phase + angular_speed * t.max(0.0);
                let (sin, cos) = theta.sin_cos();
                Sample {
                    position: center + Vec3::new(radius * cos, radius * sin, 0.0),
                    velocity: Vec3::new(-radius * angular_speed * sin, radius * angular_speed * cos, 0.0),
                    acceleration: Vec3::new(
                        -radius * angular_speed.powi(2) * cos,
                        -radius * angular_speed.powi(2) * sin,
                        0.0,
                    ),
                }
            }
        }
    }

    pub fn yaw(&self) -> f64 {
        match *self {
            Trajectory::Hold { yaw, .. }
            | Trajectory::Takeoff { yaw, .. }
            | Trajectory::Landing { yaw, .. }
            | Trajectory::Circle { yaw, .. } => yaw,
        }
    }

    /// Time to completion; unbounded trajectories have none
    pub fn duration(&self) -> Option<f64> {
        match *self {
            Trajectory::Takeoff { duration, .. } | Trajectory::Landing { duration, .. } => Some(duration),
            Trajectory::Hold { .. } | Trajectory::Circle { .. } => None,
        }
    }

    /// Where the trajectory ends up; the circle "ends" where it started
    pub fn end_position(&self) -> Vec3 {
        match self.duration() {
            Some(duration) => self.sample(duration).position,
            None => self.sample(0.0).position,
        }
    }

    /// Reference at `t` with a preview of `horizon` points spaced `step` apart,
    /// point k sampled at t + (k + 1)·step
    pub fn reference(&self, t: f64, horizon: usize, step: f64) -> ControlReference {
        let now = self.sample(t);
        let yaw = self.yaw();
        let preview = (1..=horizon)
            .map(|k| {
                let s = self.sample(t + k as f64 * step);
                TrajectoryPoint {
                    position: s.position,
                    velocity: s.velocity,
                    yaw,
                }
            })
            .collect();
        ControlReference {
            position: now.position,
            velocity: now.velocity,
            acceleration: now.acceleration,
            yaw,
            horizon: preview,
        }
    }
}
