//! Per-source sensor health tracking

use std::collections::{BTreeMap, VecDeque};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::estimation::SensorSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorStatus {
    /// Never heard from
    Inactive,
    Active,
    /// Reporting, but most recent samples fail the innovation gate
    Degraded,
    /// Silent for longer than the failure timeout
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// [s]
    pub failure_timeout: f64,
    /// Number of recent samples considered for the outlier ratio
    pub outlier_window: usize,
    /// Outlier ratio above which a source is degraded
    pub degraded_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_timeout: 1.0,
            outlier_window: 20,
            degraded_ratio: 0.5,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.failure_timeout > 0.0, "health.failure_timeout", "must be positive")?;
        ConfigError::check(self.outlier_window > 0, "health.outlier_window", "must be at least 1")?;
        ConfigError::check(
            (0.0..=1.0).contains(&self.degraded_ratio),
            "health.degraded_ratio",
            "must be in [0, 1]",
        )
    }
}

/// Counters and status for one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorHealth {
    pub status: SensorStatus,
    pub last_seen: Option<f64>,
    pub received: u64,
    pub accepted: u64,
    pub outliers: u64,
    pub stale: u64,
    pub invalid: u64,
    #[serde(skip)]
    recent: VecDeque<bool>,
}

impl SensorHealth {
    fn new() -> Self {
        Self {
            status: SensorStatus::Inactive,
            last_seen: None,
            received: 0,
            accepted: 0,
            outliers: 0,
            stale: 0,
            invalid: 0,
            recent: VecDeque::new(),
        }
    }

    /// Fraction of the recent gated samples that were rejected
    pub fn outlier_ratio(&self) -> f64 {
        if self.recent.is_empty() {
            0.0
        } else {
            self.recent.iter().filter(|r| **r).count() as f64 / self.recent.len() as f64
        }
    }

    fn push_gate_result(&mut self, rejected: bool, window: usize) {
        self.recent.push_back(rejected);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorHealthMonitor {
    config: HealthConfig,
    sources: BTreeMap<SensorSource, SensorHealth>,
}

impl SensorHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            sources: BTreeMap::new(),
        }
    }

    fn entry(&mut self, source: SensorSource) -> &mut SensorHealth {
        self.sources.entry(source).or_insert_with(SensorHealth::new)
    }

    pub fn record_received(&mut self, source: SensorSource, timestamp: f64) {
        let health = self.entry(source);
        health.received += 1;
        health.last_seen = Some(health.last_seen.map_or(timestamp, |t| t.max(timestamp)));
    }

    pub fn record_accepted(&mut self, source: SensorSource) {
        let window = self.config.outlier_window;
        let health = self.entry(source);
        health.accepted += 1;
        health.push_gate_result(false, window);
    }

    pub fn record_outlier(&mut self, source: SensorSource) {
        let window = self.config.outlier_window;
        let health = self.entry(source);
        health.outliers += 1;
        health.push_gate_result(true, window);
    }

    pub fn record_stale(&mut self, source: SensorSource) {
        self.entry(source).stale += 1;
    }

    pub fn record_invalid(&mut self, source: SensorSource) {
        self.entry(source).invalid += 1;
    }

    /// Re-derive every source's status at time `now`
    pub fn refresh(&mut self, now: f64) {
        let config = &self.config;
        for (source, health) in self.sources.iter_mut() {
            let status = match health.last_seen {
                None => SensorStatus::Inactive,
                Some(t) if now - t > config.failure_timeout => SensorStatus::Failed,
                Some(_) if health.outlier_ratio() > config.degraded_ratio => SensorStatus::Degraded,
                Some(_) => SensorStatus::Active,
            };
            if status != health.status {
                info!("sensor {:?}: {:?} -> {:?}", source, health.status, status);
                health.status = status;
            }
        }
    }

    pub fn status(&self, source: SensorSource) -> SensorStatus {
        self.sources
            .get(&source)
            .map_or(SensorStatus::Inactive, |h| h.status)
    }

    pub fn get(&self, source: SensorSource) -> Option<&SensorHealth> {
        self.sources.get(&source)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SensorSource, &SensorHealth)> {
        self.sources.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lifecycle() {
        let mut monitor = SensorHealthMonitor::new(HealthConfig::default());
        assert_eq!(monitor.status(SensorSource::Gps), SensorStatus::Inactive);

        monitor.record_received(SensorSource::Gps, 1.0);
        monitor.record_accepted(SensorSource::Gps);
        monitor.refresh(1.1);
        assert_eq!(monitor.status(SensorSource::Gps), SensorStatus::Active);

        monitor.refresh(2.5);
        assert_eq!(monitor.status(SensorSource::Gps), SensorStatus::Failed);

        monitor.record_received(SensorSource::Gps, 2.5);
        monitor.refresh(2.5);
        assert_eq!(monitor.status(SensorSource::Gps), SensorStatus::Active);
    }

    #[test]
    fn test_outliers_degrade_source() {
        let mut monitor = SensorHealthMonitor::new(HealthConfig::default());
        for k in 0..20 {
            monitor.record_received(SensorSource::MotionCapture, k as f64 * 0.01);
            if k % 4 == 0 {
                monitor.record_accepted(SensorSource::MotionCapture);
            } else {
                monitor.record_outlier(SensorSource::MotionCapture);
            }
        }
        monitor.refresh(0.2);

        assert_eq!(monitor.status(SensorSource::MotionCapture), SensorStatus::Degraded);
        let health = monitor.get(SensorSource::MotionCapture).unwrap();
        assert_eq!(health.received, 20);
        assert_eq!(health.outliers, 15);
        assert!((health.outlier_ratio() - 0.75).abs() < 1e-12);
    }
}
