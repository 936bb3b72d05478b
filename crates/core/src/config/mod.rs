use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ChannelFilter, ClockPolicy, LiveSignalError, Result};

const MIN_FFT_SIZE: usize = 32;
const MAX_FFT_SIZE: usize = 32_768;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub midi: MidiConfig,
    pub patterns: PatternConfig,
}

impl AppConfig {
    /// Configuration used by the monitor when no file is given.
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file. Missing sections fall back to their
    /// defaults; the audio and MIDI sections are validated before it is
    /// returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.audio.validate()?;
        config.midi.validate()?;
        Ok(config)
    }
}

/// Configuration specific to the spectral analysis node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfig {
    pub fft_size: usize,
    pub smoothing_time_constant: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing_time_constant: 0.5,
            min_decibels: -90.0,
            max_decibels: -10.0,
        }
    }
}

impl AudioConfig {
    /// Number of frequency bins produced for this FFT size.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Checks the FFT size, smoothing constant and decibel bounds.
    pub fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two()
            || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&self.fft_size)
        {
            return Err(LiveSignalError::InvalidConfig(format!(
                "fftSize must be a power of two between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}, got {}",
                self.fft_size
            )));
        }
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(LiveSignalError::InvalidConfig(format!(
                "smoothingTimeConstant must lie in [0, 1], got {}",
                self.smoothing_time_constant
            )));
        }
        if !self.min_decibels.is_finite() || !self.max_decibels.is_finite() {
            return Err(LiveSignalError::InvalidConfig(format!(
                "decibel bounds must be finite, got {} and {}",
                self.min_decibels, self.max_decibels
            )));
        }
        if self.min_decibels >= self.max_decibels {
            return Err(LiveSignalError::InvalidConfig(format!(
                "minDecibels ({}) must be below maxDecibels ({})",
                self.min_decibels, self.max_decibels
            )));
        }
        Ok(())
    }

    /// Returns a copy with every field present in `patch` overwritten.
    pub fn merged(&self, patch: &AudioConfigPatch) -> Self {
        Self {
            fft_size: patch.fft_size.unwrap_or(self.fft_size),
            smoothing_time_constant: patch
                .smoothing_time_constant
                .unwrap_or(self.smoothing_time_constant),
            min_decibels: patch.min_decibels.unwrap_or(self.min_decibels),
            max_decibels: patch.max_decibels.unwrap_or(self.max_decibels),
        }
    }
}

/// Partial update for [`AudioConfig`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfigPatch {
    pub fft_size: Option<usize>,
    pub smoothing_time_constant: Option<f32>,
    pub min_decibels: Option<f32>,
    pub max_decibels: Option<f32>,
}

impl AudioConfigPatch {
    pub fn fft_size(fft_size: usize) -> Self {
        Self {
            fft_size: Some(fft_size),
            ..Default::default()
        }
    }

    pub fn smoothing(value: f32) -> Self {
        Self {
            smoothing_time_constant: Some(value),
            ..Default::default()
        }
    }
}

/// Configuration specific to the MIDI subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MidiConfig {
    pub sysex_enabled: bool,
    pub channel_filter: ChannelFilter,
    pub clock_policy: ClockPolicy,
}

impl MidiConfig {
    pub fn validate(&self) -> Result<()> {
        self.channel_filter.validate()
    }
}

/// Seeds the orchestrator's pattern count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PatternConfig {
    pub total_patterns: i64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self { total_patterns: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AudioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bin_count(), 1024);
    }

    #[test]
    fn rejects_bad_fft_sizes_and_ranges() {
        let base = AudioConfig::default();
        assert!(base.merged(&AudioConfigPatch::fft_size(1000)).validate().is_err());
        assert!(base.merged(&AudioConfigPatch::fft_size(16)).validate().is_err());
        assert!(base.merged(&AudioConfigPatch::smoothing(1.5)).validate().is_err());

        let inverted = AudioConfigPatch {
            min_decibels: Some(-10.0),
            max_decibels: Some(-90.0),
            ..Default::default()
        };
        assert!(base.merged(&inverted).validate().is_err());
    }

    #[test]
    fn rejects_non_finite_values() {
        let base = AudioConfig::default();
        for patch in [
            AudioConfigPatch {
                min_decibels: Some(f32::NAN),
                ..Default::default()
            },
            AudioConfigPatch {
                max_decibels: Some(f32::NAN),
                ..Default::default()
            },
            AudioConfigPatch {
                max_decibels: Some(f32::INFINITY),
                ..Default::default()
            },
            AudioConfigPatch::smoothing(f32::NAN),
        ] {
            let err = base.merged(&patch).validate().unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidConfig, "{patch:?}");
        }
    }

    #[test]
    fn midi_section_rejects_out_of_range_channel() {
        let config = MidiConfig {
            channel_filter: ChannelFilter::Channel(16),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(MidiConfig::default().validate().is_ok());
    }

    #[test]
    fn merge_only_touches_present_fields() {
        let merged = AudioConfig::default().merged(&AudioConfigPatch::fft_size(512));
        assert_eq!(merged.fft_size, 512);
        assert_eq!(merged.smoothing_time_constant, 0.5);
        assert_eq!(merged.min_decibels, -90.0);
    }

    #[test]
    fn parses_partial_json() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "audio": { "fftSize": 1024 }, "midi": { "channelFilter": "3" } }"#,
        )
        .unwrap();
        assert_eq!(config.audio.fft_size, 1024);
        assert_eq!(config.audio.max_decibels, -10.0);
        assert_eq!(config.midi.channel_filter, ChannelFilter::Channel(3));
        assert_eq!(config.patterns.total_patterns, 1);
    }
}
