//! Flight configuration
//!
//! One immutable record holding every tunable of the stack. Each table is
//! optional in the TOML file and falls back to its defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crazyfly_core::control::{CascadeConfig, L1Config};
use crazyfly_core::dynamics::VehicleParams;
use crazyfly_core::estimation::FusionConfig;
use crazyfly_core::simulation::SimConfig;
use crazyfly_core::ConfigError;

use crate::arbiter::ArbiterConfig;
use crate::mpc::MpcConfig;
use crate::session::MissionConfig;

#[derive(Debug, Error)]
pub enum FlightConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Vehicle model the controllers are tuned for
    pub vehicle: VehicleParams,
    pub arbiter: ArbiterConfig,
    pub fusion: FusionConfig,
    pub cascade: CascadeConfig,
    pub l1: L1Config,
    pub mpc: MpcConfig,
    pub mission: MissionConfig,
    /// Simulated vehicle and sensors; its vehicle may differ from the model above
    pub sim: SimConfig,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            vehicle: VehicleParams::default(),
            arbiter: ArbiterConfig::default(),
            fusion: FusionConfig::default(),
            cascade: CascadeConfig::default(),
            l1: L1Config::default(),
            mpc: MpcConfig::default(),
            mission: MissionConfig::default(),
            sim: SimConfig {
                duration: 20.0,
                ..SimConfig::default()
            },
        }
    }
}

impl FlightConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vehicle.validate()?;
        self.arbiter.validate()?;
        self.fusion.validate()?;
        self.cascade.validate()?;
        self.l1.validate()?;
        self.mpc.validate()?;
        self.mission.validate()?;
        self.sim.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, FlightConfigError> {
        let config: FlightConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlightConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FlightConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
