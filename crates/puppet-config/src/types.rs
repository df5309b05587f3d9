use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sensor connection and acquisition timing.
    pub sensor: SensorConfig,
    /// Orientation filter tuning.
    pub filter: FilterSettings,
    /// Subscriber fan-out.
    pub broadcast: BroadcastConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            filter: FilterSettings::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reject values the sampling loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let sensor = &self.sensor;
        ensure!(!sensor.port.is_empty(), "sensor.port must not be empty");
        ensure!(sensor.baud_rate > 0, "sensor.baud_rate must be positive");
        ensure!(sensor.read_timeout_ms > 0, "sensor.read_timeout_ms must be positive");
        ensure!(
            sensor.mag_poll_attempts > 0,
            "sensor.mag_poll_attempts must be at least 1"
        );
        ensure!(
            sensor.mag_ready_timeout_ms > 0,
            "sensor.mag_ready_timeout_ms must be positive"
        );

        let filter = &self.filter;
        ensure!(
            filter.beta.is_finite() && filter.beta >= 0.0,
            "filter.beta must be finite and non-negative, got {}",
            filter.beta
        );
        ensure!(
            filter.sample_freq_hz.is_finite() && filter.sample_freq_hz > 0.0,
            "filter.sample_freq_hz must be positive, got {}",
            filter.sample_freq_hz
        );

        ensure!(
            self.broadcast.subscriber_queue > 0,
            "broadcast.subscriber_queue must be at least 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Serial device of the sensor bridge, e.g. `/dev/ttyACM0`.
    pub port: String,
    pub baud_rate: u32,
    /// Deadline for each command's reply.
    pub read_timeout_ms: u64,
    /// Magnetometer status polls per sample before giving up.
    pub mag_poll_attempts: u32,
    /// Pause between magnetometer status polls.
    pub mag_poll_interval_us: u64,
    /// Overall magnetometer readiness deadline per sample.
    pub mag_ready_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            port: "/dev/tty.usbmodem1411".into(),
            baud_rate: 115_200,
            read_timeout_ms: 100,
            mag_poll_attempts: 100,
            mag_poll_interval_us: 500,
            mag_ready_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Madgwick gain. Higher = more responsive, less smooth.
    pub beta: f32,
    /// Sampling rate of the acquisition loop.
    pub sample_freq_hz: f32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            beta: 0.0001,
            sample_freq_hz: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Frames buffered per subscriber before new ones are dropped.
    pub subscriber_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_queue: 8,
        }
    }
}
