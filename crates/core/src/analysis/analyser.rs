use std::{collections::VecDeque, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{AudioConfig, LiveSignalError, Result};

/// Spectral analysis node fed with raw samples.
///
/// Produces the byte-level frequency and time-domain views that
/// [`SpectrumAnalyzer`](super::SpectrumAnalyzer) consumes. Frequency data is
/// windowed with a Blackman window, scaled by `1 / fft_size`, smoothed over
/// time with `smoothing_time_constant`, converted to decibels and quantised
/// linearly between `min_decibels` (0) and `max_decibels` (255).
///
/// The smoothed spectrum only advances when samples arrived since the last
/// read, so repeated reads within one frame return identical bytes.
pub struct SpectralAnalyser {
    config: AudioConfig,
    sample_rate: f32,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
    window: Vec<f32>,
    fft: Option<FftResources>,
    pending: bool,
}

impl SpectralAnalyser {
    /// Creates an analyser primed with silence.
    pub fn new(sample_rate: f32, config: &AudioConfig) -> Self {
        let fft_size = config.fft_size;
        Self {
            config: config.clone(),
            sample_rate,
            history: VecDeque::from(vec![0.0; fft_size]),
            smoothed: vec![0.0; fft_size / 2],
            window: blackman_window(fft_size),
            fft: None,
            pending: true,
        }
    }

    /// Returns the sample rate of the fed stream.
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Half the FFT size.
    pub fn frequency_bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Applies a new configuration. A changed FFT size resets the sample
    /// history and the smoothing state.
    pub fn configure(&mut self, config: &AudioConfig) -> Result<()> {
        config.validate()?;
        if config.fft_size != self.config.fft_size {
            let fft_size = config.fft_size;
            let mut history = VecDeque::from(vec![0.0; fft_size]);
            let skip = self.history.len().saturating_sub(fft_size);
            for sample in self.history.iter().skip(skip) {
                history.pop_front();
                history.push_back(*sample);
            }
            self.history = history;
            self.smoothed = vec![0.0; fft_size / 2];
            self.window = blackman_window(fft_size);
            self.pending = true;
        }
        self.config = config.clone();
        Ok(())
    }

    /// Appends mono samples; only the most recent `fft_size` are retained.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let fft_size = self.config.fft_size;
        let skip = samples.len().saturating_sub(fft_size);
        for sample in &samples[skip..] {
            if self.history.len() == fft_size {
                self.history.pop_front();
            }
            self.history.push_back(*sample);
        }
        self.pending |= !samples.is_empty();
    }

    /// Fills `out` with quantised magnitudes, one byte per bin. Bins beyond
    /// `out.len()` are dropped and missing bins are written as zero.
    pub fn frequency_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        if self.pending {
            self.update_spectrum()?;
            self.pending = false;
        }

        let range = self.config.max_decibels - self.config.min_decibels;
        let scale = 255.0 / range;
        for (index, byte) in out.iter_mut().enumerate() {
            let magnitude = self.smoothed.get(index).copied().unwrap_or(0.0);
            *byte = if magnitude <= 0.0 {
                0
            } else {
                let db = 20.0 * magnitude.log10();
                (scale * (db - self.config.min_decibels)).clamp(0.0, 255.0) as u8
            };
        }
        Ok(())
    }

    /// Fills `out` with the most recent samples as `128 * (1 + sample)`.
    pub fn time_domain_bytes(&self, out: &mut [u8]) {
        let skip = self.history.len().saturating_sub(out.len());
        let mut recent = self.history.iter().skip(skip);
        for byte in out.iter_mut() {
            let sample = recent.next().copied().unwrap_or(0.0);
            *byte = (128.0 * (1.0 + sample)).clamp(0.0, 255.0) as u8;
        }
    }

    fn update_spectrum(&mut self) -> Result<()> {
        let size = self.config.fft_size;
        let smoothing = self.config.smoothing_time_constant;

        self.prepare_fft(size);
        let Some(fft) = self.fft.as_mut() else {
            return Err(LiveSignalError::msg("fft resources are missing"));
        };

        for ((slot, sample), weight) in fft
            .input
            .iter_mut()
            .zip(self.history.iter())
            .zip(self.window.iter())
        {
            *slot = sample * weight;
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let norm = 1.0 / size as f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(fft.spectrum.iter()) {
            let magnitude = bin.norm() * norm;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
        }
        Ok(())
    }

    fn prepare_fft(&mut self, size: usize) {
        let rebuild = self
            .fft
            .as_ref()
            .map(|fft| fft.size != size)
            .unwrap_or(true);

        if rebuild {
            let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
            let scratch = plan.make_scratch_vec();
            let spectrum = plan.make_output_vec();
            let input = plan.make_input_vec();
            self.fft = Some(FftResources {
                size,
                plan,
                scratch,
                spectrum,
                input,
            });
        }
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectralAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralAnalyser")
            .field("config", &self.config)
            .field("sample_rate", &self.sample_rate)
            .field("history", &self.history.len())
            .finish()
    }
}

fn blackman_window(len: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    (0..len)
        .map(|i| {
            let x = i as f32 / len as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioConfigPatch;

    fn tone(freq: f32, sample_rate: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn silence_quantises_to_zero_and_midline() {
        let mut analyser = SpectralAnalyser::new(48_000.0, &AudioConfig::default());
        let mut freq = vec![0u8; analyser.frequency_bin_count()];
        let mut time = vec![0u8; analyser.frequency_bin_count()];

        analyser.frequency_bytes(&mut freq).unwrap();
        analyser.time_domain_bytes(&mut time);

        assert!(freq.iter().all(|&b| b == 0));
        assert!(time.iter().all(|&b| b == 128));
    }

    #[test]
    fn tone_peaks_at_its_bin() {
        let config = AudioConfig {
            smoothing_time_constant: 0.0,
            ..AudioConfig::default()
        };
        let sample_rate = 48_000.0;
        let mut analyser = SpectralAnalyser::new(sample_rate, &config);
        // Bin 64 of a 2048-point FFT at 48 kHz is exactly 1500 Hz.
        analyser.push_samples(&tone(1_500.0, sample_rate, 2048));

        let mut freq = vec![0u8; analyser.frequency_bin_count()];
        analyser.frequency_bytes(&mut freq).unwrap();

        let peak = freq
            .iter()
            .enumerate()
            .max_by_key(|(_, &value)| value)
            .map(|(index, _)| index)
            .unwrap();
        assert_eq!(peak, 64);
        assert!(freq[64] > 200);
        assert!(freq[400] < freq[64]);
    }

    #[test]
    fn smoothing_decays_towards_silence() {
        let sample_rate = 48_000.0;
        let mut analyser = SpectralAnalyser::new(sample_rate, &AudioConfig::default());
        analyser.push_samples(&tone(1_500.0, sample_rate, 2048));

        let mut first = vec![0u8; 1024];
        analyser.frequency_bytes(&mut first).unwrap();
        analyser.push_samples(&vec![0.0; 2048]);
        let mut second = vec![0u8; 1024];
        analyser.frequency_bytes(&mut second).unwrap();

        assert!(second[64] > 0);
        assert!(second[64] < first[64]);
    }

    #[test]
    fn repeated_reads_without_new_samples_are_stable() {
        let sample_rate = 48_000.0;
        let mut analyser = SpectralAnalyser::new(sample_rate, &AudioConfig::default());
        analyser.push_samples(&tone(1_500.0, sample_rate, 2048));

        let mut first = vec![0u8; 1024];
        let mut second = vec![0u8; 1024];
        analyser.frequency_bytes(&mut first).unwrap();
        analyser.frequency_bytes(&mut second).unwrap();
        assert_eq!(first, second);

        analyser.push_samples(&tone(1_500.0, sample_rate, 512));
        let mut third = vec![0u8; 1024];
        analyser.frequency_bytes(&mut third).unwrap();
        assert!(third[64] > first[64]);
    }

    #[test]
    fn reconfigure_changes_bin_count() {
        let mut analyser = SpectralAnalyser::new(44_100.0, &AudioConfig::default());
        let config = AudioConfig::default().merged(&AudioConfigPatch::fft_size(256));
        analyser.configure(&config).unwrap();
        assert_eq!(analyser.frequency_bin_count(), 128);

        let bad = AudioConfig::default().merged(&AudioConfigPatch::fft_size(100));
        assert!(analyser.configure(&bad).is_err());
        assert_eq!(analyser.frequency_bin_count(), 128);
    }
}
