use serde::Deserialize;
use std::time::Duration;

/// Lag-aware throttling of copy and replay work.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Whether the throttler samples the lag signal at all.
    pub enabled: bool,
    /// Lag estimate above which work is paused, in the unit of the lag source.
    pub threshold: f64,
    /// Fraction of the threshold the lag must drop below it before work resumes.
    ///
    /// With a threshold of `1.0` and a hysteresis of `0.2`, work resumes below `0.8`.
    pub hysteresis: f64,
    /// Interval in milliseconds between two samples of the lag signal.
    pub sample_interval_ms: u64,
}

impl ThrottleConfig {
    /// Returns the lag below which a paused throttler resumes.
    pub fn resume_threshold(&self) -> f64 {
        self.threshold * (1.0 - self.hysteresis)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 1.0,
            hysteresis: 0.2,
            sample_interval_ms: 250,
        }
    }
}
