//! Simulation configuration

use serde::{Deserialize, Serialize};

use crate::dynamics::VehicleParams;
use crate::error::ConfigError;
use crate::estimation::SensorSource;
use crate::Vec3;

/// Simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Physics sub-steps per control tick
    pub substeps: usize,
    /// Scenario length [s]
    pub duration: f64,
    pub vehicle: VehicleParams,
    /// Initial position [m]
    pub initial_position: Vec3,
    /// Constant external force [N] (world frame), e.g. wind
    pub disturbance: Vec3,
    pub sensors: SensorConfig,
    /// Windows during which a source produces nothing
    pub dropouts: Vec<Dropout>,
    /// Seed for every noise stream
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            substeps: 10,
            duration: 10.0,
            vehicle: VehicleParams::default(),
            initial_position: Vec3::zeros(),
            disturbance: Vec3::zeros(),
            sensors: SensorConfig::default(),
            dropouts: Vec::new(),
            seed: 42,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.substeps > 0, "sim.substeps", "must be at least 1")?;
        ConfigError::check(self.duration >= 0.0, "sim.duration", "must be non-negative")?;
        self.vehicle.validate()?;
        self.sensors.validate()?;
        ConfigError::check(
            self.dropouts.iter().all(|d| d.end >= d.start),
            "sim.dropouts",
            "every window must end after it starts",
        )
    }

    /// Whether `source` is silenced at time `t`
    pub fn in_dropout(&self, source: SensorSource, t: f64) -> bool {
        self.dropouts
            .iter()
            .any(|d| d.source == source && t >= d.start && t < d.end)
    }
}

/// A window [start, end) with no samples from `source`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    pub source: SensorSource,
    pub start: f64,
    pub end: f64,
}

/// Motion-capture pose stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MocapChannel {
    pub enabled: bool,
    /// [Hz]
    pub rate: f64,
    /// [m]
    pub position_std: f64,
    /// [rad]
    pub attitude_std: f64,
    /// Delay between sampling and delivery [s]
    pub latency: f64,
}

impl Default for MocapChannel {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 100.0,
            position_std: 0.005,
            attitude_std: 0.01,
            latency: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuChannel {
    pub enabled: bool,
    /// [Hz]
    pub rate: f64,
    /// [m/s²]
    pub accel_noise_std: f64,
    /// [rad/s]
    pub gyro_noise_std: f64,
    /// Accelerometer standard deviation reported with each sample; larger
    /// than the noise to cover the vehicle's own acceleration [m/s²]
    pub accel_reported_std: f64,
    pub gyro_bias: Vec3,
    pub accel_bias: Vec3,
}

impl Default for ImuChannel {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 100.0,
            accel_noise_std: 0.1,
            gyro_noise_std: 0.01,
            accel_reported_std: 1.0,
            gyro_bias: Vec3::zeros(),
            accel_bias: Vec3::zeros(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarometerChannel {
    pub enabled: bool,
    /// [Hz]
    pub rate: f64,
    /// [m]
    pub std: f64,
}

impl Default for BarometerChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 25.0,
            std: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub mocap: MocapChannel,
    pub imu: ImuChannel,
    pub barometer: BarometerChannel,
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(
            self.mocap.rate > 0.0 && self.imu.rate > 0.0 && self.barometer.rate > 0.0,
            "sensors.rate",
            "every sensor rate must be positive",
        )?;
        ConfigError::check(
            self.mocap.position_std > 0.0 && self.mocap.attitude_std > 0.0,
            "sensors.mocap",
            "noise must be positive",
        )?;
        ConfigError::check(
            self.imu.accel_reported_std > 0.0 && self.imu.gyro_noise_std > 0.0 && self.imu.accel_noise_std >= 0.0,
            "sensors.imu",
            "reported noise must be positive",
        )?;
        ConfigError::check(self.barometer.std > 0.0, "sensors.barometer.std", "must be positive")?;
        ConfigError::check(self.mocap.latency >= 0.0, "sensors.mocap.latency", "must be non-negative")
    }
}
