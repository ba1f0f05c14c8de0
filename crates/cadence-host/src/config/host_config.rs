use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Default tick interval for scripts (~60Hz)
const DEFAULT_TICK_INTERVAL_US: u64 = 16_667;

/// Default audio sample rate for scripted avatar audio
const DEFAULT_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Nominal time between run loop ticks, in microseconds
    #[serde(default = "default_tick_interval_us")]
    pub tick_interval_us: u64,

    /// Sample rate of mono PCM streamed to the audio mixer
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// How often an avatar identity packet is sent while in avatar mode
    #[serde(default = "default_identity_interval")]
    pub identity_packet_interval_ms: u64,

    /// How often an avatar billboard packet is sent while in avatar mode
    #[serde(default = "default_billboard_interval")]
    pub billboard_packet_interval_ms: u64,

    /// Capacity of a host's own event bus when none is supplied
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_tick_interval_us() -> u64 {
    DEFAULT_TICK_INTERVAL_US
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_identity_interval() -> u64 {
    1000
}

fn default_billboard_interval() -> u64 {
    5000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_interval_us: DEFAULT_TICK_INTERVAL_US,
            sample_rate: DEFAULT_SAMPLE_RATE,
            identity_packet_interval_ms: default_identity_interval(),
            billboard_packet_interval_ms: default_billboard_interval(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl HostConfig {
    /// Config with a custom tick interval, everything else default
    pub fn with_tick_interval(interval: Duration) -> Self {
        Self {
            tick_interval_us: interval.as_micros() as u64,
            ..Default::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(self.tick_interval_us)
    }

    /// Samples streamed per tick: round(tick seconds * sample rate).
    ///
    /// Capped at `u16::MAX`, the largest count a silent frame can carry.
    pub fn samples_per_tick(&self) -> usize {
        let samples = self.tick_interval_us as f64 * self.sample_rate as f64 / 1_000_000.0;
        let samples = (samples + 0.5).floor() as usize;
        if samples > u16::MAX as usize {
            warn!(
                "{} samples per tick exceeds the audio frame limit, capping at {}",
                samples,
                u16::MAX
            );
            return u16::MAX as usize;
        }
        samples
    }

    pub fn identity_packet_interval(&self) -> Duration {
        Duration::from_millis(self.identity_packet_interval_ms)
    }

    pub fn billboard_packet_interval(&self) -> Duration {
        Duration::from_millis(self.billboard_packet_interval_ms)
    }
}
