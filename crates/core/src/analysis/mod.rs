//! Pure spectrum decomposition: FFT byte buffers in, per-band energies out.
//!
//! Nothing in this module touches a device. [`SpectrumAnalyzer`] is a pure
//! function of the byte buffers and the [`FrequencyRanges`] table, so the
//! per-frame update can be tested without any capture backend.

mod analyser;

pub use analyser::SpectralAnalyser;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Named frequency band, in ascending frequency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Band {
    SubBass,
    Bass,
    LowMid,
    Mid,
    HighMid,
    Treble,
    Brilliance,
}

impl Band {
    pub const ALL: [Band; 7] = [
        Band::SubBass,
        Band::Bass,
        Band::LowMid,
        Band::Mid,
        Band::HighMid,
        Band::Treble,
        Band::Brilliance,
    ];

    /// Fixed `[low, high]` bounds of the band in Hz.
    pub fn hz_bounds(self) -> (f32, f32) {
        match self {
            Band::SubBass => (20.0, 60.0),
            Band::Bass => (60.0, 250.0),
            Band::LowMid => (250.0, 500.0),
            Band::Mid => (500.0, 2_000.0),
            Band::HighMid => (2_000.0, 4_000.0),
            Band::Treble => (4_000.0, 6_000.0),
            Band::Brilliance => (6_000.0, 20_000.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Band::SubBass => "subBass",
            Band::Bass => "bass",
            Band::LowMid => "lowMid",
            Band::Mid => "mid",
            Band::HighMid => "highMid",
            Band::Treble => "treble",
            Band::Brilliance => "brilliance",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive-exclusive bin span per band, derived from the sample rate and
/// the number of FFT bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrequencyRanges {
    ranges: [(usize, usize); 7],
}

impl FrequencyRanges {
    /// Derives bin spans with `start = floor(lo / binSize)` and
    /// `end = ceil(hi / binSize)`, where `binSize = sampleRate / 2 / binCount`.
    /// Degenerate inputs yield empty spans.
    pub fn compute(sample_rate: f32, bin_count: usize) -> Self {
        let mut ranges = [(0, 0); 7];
        if bin_count == 0 || !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Self { ranges };
        }

        let bin_size = sample_rate / 2.0 / bin_count as f32;
        for band in Band::ALL {
            let (lo_hz, hi_hz) = band.hz_bounds();
            let start = (lo_hz / bin_size).floor() as usize;
            let end = (hi_hz / bin_size).ceil() as usize;
            ranges[band.index()] = (start, end.max(start));
        }
        Self { ranges }
    }

    pub fn range(&self, band: Band) -> (usize, usize) {
        self.ranges[band.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Band, (usize, usize))> + '_ {
        Band::ALL.into_iter().map(move |band| (band, self.range(band)))
    }
}

/// Normalised energy per named band, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandEnergies {
    pub sub_bass: f32,
    pub bass: f32,
    pub low_mid: f32,
    pub mid: f32,
    pub high_mid: f32,
    pub treble: f32,
    pub brilliance: f32,
}

impl BandEnergies {
    pub fn get(&self, band: Band) -> f32 {
        match band {
            Band::SubBass => self.sub_bass,
            Band::Bass => self.bass,
            Band::LowMid => self.low_mid,
            Band::Mid => self.mid,
            Band::HighMid => self.high_mid,
            Band::Treble => self.treble,
            Band::Brilliance => self.brilliance,
        }
    }

    fn set(&mut self, band: Band, value: f32) {
        let slot = match band {
            Band::SubBass => &mut self.sub_bass,
            Band::Bass => &mut self.bass,
            Band::LowMid => &mut self.low_mid,
            Band::Mid => &mut self.mid,
            Band::HighMid => &mut self.high_mid,
            Band::Treble => &mut self.treble,
            Band::Brilliance => &mut self.brilliance,
        };
        *slot = value;
    }
}

/// Per-frame audio analysis result. Replaced wholesale every frame.
///
/// `normalized` and `spectrum` always hold the same values; both names are
/// kept for consumers written against either.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioSnapshot {
    pub raw: Vec<u8>,
    pub normalized: Vec<f32>,
    pub spectrum: Vec<f32>,
    pub waveform: Vec<f32>,
    pub bands: BandEnergies,
    pub level: f32,
}

impl AudioSnapshot {
    /// The snapshot an idle source reports: empty arrays and zero energies.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn bin_count(&self) -> usize {
        self.raw.len()
    }

    pub fn band(&self, band: Band) -> f32 {
        self.bands.get(band)
    }
}

/// Stateless mapping from FFT byte buffers to an [`AudioSnapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SpectrumAnalyzer;

impl SpectrumAnalyzer {
    /// Mean of `buffer[start..min(end, len)]` divided by 255. Spans that start
    /// past the buffer yield 0 instead of failing.
    pub fn calculate_average(buffer: &[u8], start: usize, end: usize) -> f32 {
        let end = end.min(buffer.len());
        if start >= end {
            return 0.0;
        }

        let sum: u32 = buffer[start..end].iter().map(|&value| value as u32).sum();
        sum as f32 / (end - start) as f32 / 255.0
    }

    pub fn band_energies(buffer: &[u8], ranges: &FrequencyRanges) -> BandEnergies {
        let mut energies = BandEnergies::default();
        for (band, (start, end)) in ranges.iter() {
            energies.set(band, Self::calculate_average(buffer, start, end));
        }
        energies
    }

    /// Builds a full snapshot from one frequency-domain and one time-domain
    /// byte buffer of the same length.
    pub fn analyze(frequency: &[u8], time_domain: &[u8], ranges: &FrequencyRanges) -> AudioSnapshot {
        let normalized: Vec<f32> = frequency.iter().map(|&v| v as f32 / 255.0).collect();
        let waveform = time_domain
            .iter()
            .map(|&v| (v as f32 - 128.0) / 128.0)
            .collect();
        let level = if normalized.is_empty() {
            0.0
        } else {
            normalized.iter().sum::<f32>() / normalized.len() as f32
        };

        AudioSnapshot {
            raw: frequency.to_vec(),
            spectrum: normalized.clone(),
            normalized,
            waveform,
            bands: Self::band_energies(frequency, ranges),
            level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATES: [f32; 4] = [8_000.0, 22_050.0, 44_100.0, 48_000.0];
    const BIN_COUNTS: [usize; 5] = [16, 64, 256, 1024, 16_384];

    #[test]
    fn ranges_are_ordered_for_common_setups() {
        for rate in RATES {
            for bins in BIN_COUNTS {
                let ranges = FrequencyRanges::compute(rate, bins);
                for (band, (start, end)) in ranges.iter() {
                    assert!(start <= end, "{band} at {rate}/{bins}: {start} > {end}");
                }
            }
        }
    }

    #[test]
    fn ranges_match_expected_bins_at_48k() {
        // 48 kHz with 1024 bins gives 23.4375 Hz per bin.
        let ranges = FrequencyRanges::compute(48_000.0, 1024);
        assert_eq!(ranges.range(Band::SubBass), (0, 3));
        assert_eq!(ranges.range(Band::Bass), (2, 11));
        assert_eq!(ranges.range(Band::Brilliance), (256, 854));
    }

    #[test]
    fn degenerate_inputs_give_empty_ranges() {
        let ranges = FrequencyRanges::compute(0.0, 1024);
        assert!(ranges.iter().all(|(_, (s, e))| s == 0 && e == 0));
        let ranges = FrequencyRanges::compute(48_000.0, 0);
        assert!(ranges.iter().all(|(_, (s, e))| s == 0 && e == 0));
    }

    #[test]
    fn average_truncates_instead_of_overrunning() {
        let buffer = [255u8; 8];
        assert_eq!(SpectrumAnalyzer::calculate_average(&buffer, 8, 20), 0.0);
        assert_eq!(SpectrumAnalyzer::calculate_average(&buffer, 30, 40), 0.0);
        assert!((SpectrumAnalyzer::calculate_average(&buffer, 4, 400) - 1.0).abs() < 1e-6);
        assert_eq!(SpectrumAnalyzer::calculate_average(&[], 0, 4), 0.0);
    }

    #[test]
    fn silent_buffer_yields_zero_everywhere() {
        let ranges = FrequencyRanges::compute(48_000.0, 1024);
        let snapshot = SpectrumAnalyzer::analyze(&[0; 1024], &[128; 1024], &ranges);

        assert_eq!(snapshot.level, 0.0);
        for band in Band::ALL {
            assert_eq!(snapshot.band(band), 0.0);
        }
        assert!(snapshot.waveform.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn saturated_buffer_yields_unit_energies() {
        let ranges = FrequencyRanges::compute(48_000.0, 1024);
        let snapshot = SpectrumAnalyzer::analyze(&[255; 1024], &[255; 1024], &ranges);

        assert!((snapshot.level - 1.0).abs() < 1e-6);
        for band in Band::ALL {
            assert!((snapshot.band(band) - 1.0).abs() < 1e-6, "{band}");
        }
    }

    #[test]
    fn small_buffers_truncate_high_bands() {
        // 8 kHz with 64 bins: treble and brilliance start at or past the
        // Nyquist bin.
        let ranges = FrequencyRanges::compute(8_000.0, 64);
        let snapshot = SpectrumAnalyzer::analyze(&[255; 64], &[128; 64], &ranges);
        assert_eq!(snapshot.band(Band::Treble), 0.0);
        assert_eq!(snapshot.band(Band::Brilliance), 0.0);
        assert!((snapshot.band(Band::HighMid) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn snapshot_arrays_share_bin_count() {
        let ranges = FrequencyRanges::compute(44_100.0, 32);
        let frequency: Vec<u8> = (0..32).map(|i| i * 8).collect();
        let snapshot = SpectrumAnalyzer::analyze(&frequency, &[0; 32], &ranges);

        assert_eq!(snapshot.bin_count(), 32);
        assert_eq!(snapshot.normalized.len(), 32);
        assert_eq!(snapshot.waveform.len(), 32);
        assert_eq!(snapshot.normalized, snapshot.spectrum);
        assert_eq!(snapshot.waveform[0], -1.0);
    }

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snapshot = AudioSnapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.level, 0.0);
        assert_eq!(snapshot.bands, BandEnergies::default());
    }
}
