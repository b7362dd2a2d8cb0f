//! Synthetic sensor streams
//!
//! Samples the true vehicle state at each channel's rate, adds seeded
//! Gaussian noise and bias, and delivers the resulting measurements after
//! the channel's latency.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::estimation::{SensorMeasurement, SensorSource};
use crate::state::VehicleState;
use crate::{gravity_enu, Quat, Vec3};

use super::SimConfig;

/// Zero-mean isotropic Gaussian vector
pub fn gaussian_vec3<R: Rng>(rng: &mut R, std_dev: f64) -> Vec3 {
    Vec3::from_fn(|_, _| rng.sample::<f64, _>(StandardNormal) * std_dev)
}

const SLACK: f64 = 1e-9;

/// Fixed-rate sample clock; the first sample falls one period after `start`
#[derive(Debug, Clone)]
struct Schedule {
    start: f64,
    rate: f64,
    count: u64,
}

impl Schedule {
    fn new(start: f64, rate: f64) -> Self {
        Self { start, rate, count: 1 }
    }

    /// Next sample time not after `time`, advancing the clock
    fn due(&mut self, time: f64) -> Option<f64> {
        let t = self.start + self.count as f64 / self.rate;
        if t <= time + SLACK {
            self.count += 1;
            Some(t)
        } else {
            None
        }
    }
}

/// Samples every configured channel
#[derive(Debug, Clone)]
pub struct SensorSuite {
    config: SimConfig,
    rng: ChaCha8Rng,
    mocap: Schedule,
    imu: Schedule,
    barometer: Schedule,
    in_flight: VecDeque<(f64, SensorMeasurement)>,
}

impl SensorSuite {
    pub fn new(config: SimConfig, start_time: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            mocap: Schedule::new(start_time, config.sensors.mocap.rate),
            imu: Schedule::new(start_time, config.sensors.imu.rate),
            barometer: Schedule::new(start_time, config.sensors.barometer.rate),
            in_flight: VecDeque::new(),
            config,
        }
    }

    /// Produce every sample due at `time` and return those delivered by then
    ///
    /// `acceleration` is the true world-frame acceleration of the vehicle.
    pub fn sample(&mut self, time: f64, state: &VehicleState, acceleration: &Vec3) -> Vec<SensorMeasurement> {
        let sensors = self.config.sensors.clone();

        if sensors.mocap.enabled {
            while let Some(t) = self.mocap.due(time) {
                if self.config.in_dropout(SensorSource::MotionCapture, t) {
                    continue;
                }
                let position = state.position + gaussian_vec3(&mut self.rng, sensors.mocap.position_std);
                let rotation = gaussian_vec3(&mut self.rng, sensors.mocap.attitude_std);
                let attitude = state.attitude * Quat::from_scaled_axis(rotation);
                let deliver = t + sensors.mocap.latency;
                self.in_flight.push_back((
                    deliver,
                    SensorMeasurement::position(SensorSource::MotionCapture, t, position, sensors.mocap.position_std),
                ));
                self.in_flight.push_back((
                    deliver,
                    SensorMeasurement::attitude(SensorSource::MotionCapture, t, attitude, sensors.mocap.attitude_std),
                ));
            }
        }

        if sensors.imu.enabled {
            while let Some(t) = self.imu.due(time) {
                if self.config.in_dropout(SensorSource::Imu, t) {
                    continue;
                }
                let specific_force = state.attitude.inverse() * (acceleration - gravity_enu())
                    + sensors.imu.accel_bias
                    + gaussian_vec3(&mut self.rng, sensors.imu.accel_noise_std);
                let rate = state.angular_rate
                    + sensors.imu.gyro_bias
                    + gaussian_vec3(&mut self.rng, sensors.imu.gyro_noise_std);
                self.in_flight.push_back((
                    t,
                    SensorMeasurement::imu(
                        t,
                        specific_force,
                        rate,
                        sensors.imu.accel_reported_std,
                        sensors.imu.gyro_noise_std,
                    ),
                ));
            }
        }

        if sensors.barometer.enabled {
            while let Some(t) = self.barometer.due(time) {
                if self.config.in_dropout(SensorSource::Barometer, t) {
                    continue;
                }
                let z: f64 = self.rng.sample(StandardNormal);
                let altitude = state.position.z + sensors.barometer.std * z;
                self.in_flight.push_back((
                    t,
                    SensorMeasurement::altitude(SensorSource::Barometer, t, altitude, sensors.barometer.std),
                ));
            }
        }

        let mut delivered = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.in_flight.len());
        for (deliver, m) in self.in_flight.drain(..) {
            if deliver <= time + SLACK {
                delivered.push(m);
            } else {
                waiting.push_back((deliver, m));
            }
        }
        self.in_flight = waiting;
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::Observation;
    use crate::simulation::{Dropout, SensorConfig};
    use crate::GRAVITY;
    use approx::assert_relative_eq;

    #[test]
    fn test_gaussian_statistics() {
        let mut rng = ChaCha8Rng::seed_from_u64(54321);
        let n = 10000;
        let samples: Vec<Vec3> = (0..n).map(|_| gaussian_vec3(&mut rng, 2.0)).collect();
        let mean = samples.iter().sum::<Vec3>() / n as f64;
        let variance = samples.iter().map(|s| (s - mean).x.powi(2)).sum::<f64>() / n as f64;

        assert!(mean.amax() < 0.1);
        assert!((variance - 4.0).abs() < 0.3);
    }

    #[test]
    fn test_streams_are_deterministic() {
        let state = VehicleState::at_rest(Vec3::new(1.0, 2.0, 3.0));
        let mut a = SensorSuite::new(SimConfig::default(), 0.0);
        let mut b = SensorSuite::new(SimConfig::default(), 0.0);
        for k in 0..10 {
            let t = k as f64 * 0.01;
            assert_eq!(a.sample(t, &state, &Vec3::zeros()), b.sample(t, &state, &Vec3::zeros()));
        }
    }

    #[test]
    fn test_hovering_imu_reads_gravity() {
        let config = SimConfig {
            sensors: SensorConfig {
                imu: crate::simulation::ImuChannel {
                    accel_noise_std: 0.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };
        let mut suite = SensorSuite::new(config, 0.0);
        let samples = suite.sample(0.01, &VehicleState::default(), &Vec3::zeros());

        let imu = samples
            .iter()
            .find_map(|m| match &m.observation {
                Observation::Imu { specific_force, .. } => Some(*specific_force),
                _ => None,
            })
            .unwrap();
        assert_relative_eq!(imu, Vec3::new(0.0, 0.0, GRAVITY), epsilon = 1e-12);
    }

    #[test]
    fn test_dropout_silences_mocap() {
        let config = SimConfig {
            dropouts: vec![Dropout {
                source: SensorSource::MotionCapture,
                start: 0.0,
                end: 1.0,
            }],
            ..Default::default()
        };
        let mut suite = SensorSuite::new(config, 0.0);
        let state = VehicleState::default();
        for k in 0..100 {
            let samples = suite.sample(k as f64 * 0.01, &state, &Vec3::zeros());
            assert!(samples.iter().all(|m| m.source != SensorSource::MotionCapture));
        }
        let samples = suite.sample(1.0, &state, &Vec3::zeros());
        assert!(samples.iter().any(|m| m.source == SensorSource::MotionCapture));
    }

    #[test]
    fn test_latency_delays_delivery() {
        let mut config = SimConfig::default();
        config.sensors.mocap.latency = 0.02;
        config.sensors.imu.enabled = false;
        let mut suite = SensorSuite::new(config, 0.0);
        let state = VehicleState::default();

        assert!(suite.sample(0.0, &state, &Vec3::zeros()).is_empty());
        assert!(suite.sample(0.01, &state, &Vec3::zeros()).is_empty());
        assert!(suite.sample(0.02, &state, &Vec3::zeros()).is_empty());
        let delivered = suite.sample(0.03, &state, &Vec3::zeros());
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|m| m.timestamp == 0.01));
    }
}
