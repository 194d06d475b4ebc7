//! Validated configuration consumed at transport construction.
//!
//! This crate never reads a file or an environment variable itself; a host
//! application is expected to populate a [`SchedulerConfig`] (by hand, or by
//! deserializing one with the `serde` feature enabled) and pass it to
//! [`crate::Transport::new`].

use crate::error::SchedulerError;

/// Numeric defaults and limits for the transport, sequencer, and
/// instruments.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct SchedulerConfig {
    /// Initial tempo, in beats per minute. Must fall within 60.0..=300.0.
    pub default_bpm: f64,
    /// Fallback velocity (0..=127) used when a caller doesn't supply one.
    pub default_velocity: u8,
    /// Informational default channel (0..=15). Never applied by the core.
    pub default_channel: u8,
    /// Default note duration, in beats, used by legacy direct-note helpers.
    pub default_duration: f64,
    /// Reserved: the core always uses the adaptive waiter regardless of this
    /// value.
    pub timing_precision_ms: f64,
    /// Reserved: the core never reads ahead past immediate past-due events.
    pub scheduling_lookahead_beats: f64,
    /// Advisory cap on loop iterations; not enforced by the core.
    pub max_sequence_loops: u32,
    /// Size of the transport's worker pool.
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_bpm: 120.0,
            default_velocity: 100,
            default_channel: 0,
            default_duration: 0.5,
            timing_precision_ms: 1.0,
            scheduling_lookahead_beats: 0.0,
            max_sequence_loops: 1_000,
            max_workers: 4,
        }
    }
}

impl SchedulerConfig {
    /// Validates this configuration, returning a [`SchedulerError::Config`]
    /// describing the first violation found.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !(60.0..=300.0).contains(&self.default_bpm) {
            return Err(SchedulerError::Config(format!(
                "default_bpm {} is outside 60.0..=300.0",
                self.default_bpm
            )));
        }
        if self.default_velocity > 127 {
            return Err(SchedulerError::Config(format!(
                "default_velocity {} is outside 0..=127",
                self.default_velocity
            )));
        }
        if self.default_channel > 15 {
            return Err(SchedulerError::Config(format!(
                "default_channel {} is outside 0..=15",
                self.default_channel
            )));
        }
        if self.default_duration <= 0.0 {
            return Err(SchedulerError::Config(format!(
                "default_duration {} must be positive",
                self.default_duration
            )));
        }
        if self.max_workers == 0 {
            return Err(SchedulerError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn bpm_out_of_range_is_rejected() {
        let mut c = SchedulerConfig::default();
        c.default_bpm = 10.0;
        assert!(matches!(c.validate(), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut c = SchedulerConfig::default();
        c.max_workers = 0;
        assert!(c.validate().is_err());
    }
}
