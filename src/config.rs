//! Validated configuration record for the correlator core.
//!
//! The core never reads configuration files or global state; a `Config` is
//! constructed once (by the CLI layer or by tests), validated, and passed by
//! reference into each stage.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::errors::{FxError, FxResult};

/// Window function applied to each sub-window before the FFT.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Rectangular,
    Hanning,
    Hamming,
    Blackman,
}

/// Where frames come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Tone-plus-noise simulation driven by the array geometry.
    Synthetic,
    /// Raw interleaved complex f32 samples replayed from a file.
    Replay,
    /// Externally decoded blocks handed in over a channel.
    Feed,
}

/// What to do when the output sink cannot keep up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkPolicy {
    /// Block frame production until the sink drains the hand-off queue.
    Block,
    /// Drop the finished artifact and report an overrun.
    Drop,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    // Array
    pub n_ants: usize,
    /// Explicit antenna positions in metres (local tangent frame). When
    /// absent, a uniform circle of `ant_radius` is generated.
    pub ant_positions: Option<Vec<[f64; 3]>>,
    pub ant_radius: f64,

    // Signal
    pub sample_rate: f64,
    pub center_freq: f64,

    // F-engine
    pub n_channels: usize,
    pub window: WindowKind,
    /// Bits per component for quantisation emulation; 0 disables it.
    pub quantize_bits: u32,
    /// Sub-window overlap fraction in [0, 0.5].
    pub overlap: f64,

    // X-engine
    pub integration_time: f64,

    // Frame source
    pub mode: SourceMode,
    pub frame_len: usize,
    pub input_file: Option<String>,
    /// Source bearings for the synthetic mode, azimuth in degrees.
    pub source_angles_deg: Vec<f64>,
    pub tone_freq: f64,
    /// Target signal-to-noise ratio in dB; non-finite means noise-free.
    pub snr_db: f64,
    /// Simulated duration in seconds; `None` streams without end.
    pub duration: Option<f64>,
    /// Throttle synthetic delivery to wall-clock rate. Timing only; must not
    /// change numeric content.
    pub realtime: bool,
    pub seed: u64,

    // Delay compensation
    pub phase_center: Option<[f64; 3]>,

    // Emission
    pub max_integrations: Option<u64>,
    pub sink_policy: SinkPolicy,
    pub halt_on_sink_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_ants: 4,
            ant_positions: None,
            ant_radius: 10.0,
            sample_rate: 1024.0,
            center_freq: 0.0,
            n_channels: 256,
            window: WindowKind::Hanning,
            quantize_bits: 0,
            overlap: 0.0,
            integration_time: 1.0,
            mode: SourceMode::Synthetic,
            frame_len: 4096,
            input_file: None,
            source_angles_deg: vec![0.0],
            tone_freq: 100.0,
            snr_db: 20.0,
            duration: Some(10.0),
            realtime: false,
            seed: 0,
            phase_center: None,
            max_integrations: None,
            sink_policy: SinkPolicy::Block,
            halt_on_sink_error: false,
        }
    }
}

impl Config {
    /// Check every constraint that must hold before a pipeline is built.
    pub fn validate(&self) -> FxResult<()> {
        if self.n_ants < 2 {
            return Err(FxError::config("at least 2 antennas are required"));
        }
        if self.n_channels < 2 || !self.n_channels.is_power_of_two() {
            return Err(FxError::config(format!(
                "channel count must be a power of two >= 2, got {}",
                self.n_channels
            )));
        }
        if !(0.0..=0.5).contains(&self.overlap) {
            return Err(FxError::config(format!(
                "overlap fraction must be within [0, 0.5], got {}",
                self.overlap
            )));
        }
        if self.frame_len < self.n_channels {
            return Err(FxError::config(format!(
                "frame length {} is shorter than one sub-window of {} channels",
                self.frame_len, self.n_channels
            )));
        }
        if !(self.sample_rate > 0.0) {
            return Err(FxError::config("sample rate must be positive"));
        }
        if !(self.integration_time > 0.0) {
            return Err(FxError::config("integration time must be positive"));
        }
        if self.quantize_bits != 0 && !(2..=16).contains(&self.quantize_bits) {
            return Err(FxError::config(format!(
                "quantize bits must be 0 (disabled) or 2..=16, got {}",
                self.quantize_bits
            )));
        }
        if let Some(positions) = &self.ant_positions {
            if positions.len() != self.n_ants {
                return Err(FxError::config(format!(
                    "expected {} antenna positions, got {}",
                    self.n_ants,
                    positions.len()
                )));
            }
        }
        if self.mode == SourceMode::Replay && self.input_file.is_none() {
            return Err(FxError::config("replay mode requires an input file"));
        }
        // Must divide exactly: a fractional slice count would make the flush
        // cadence drift against the requested integration time.
        let slices = self.integration_time * self.sample_rate / self.n_channels as f64;
        if slices < 1.0 || (slices - slices.round()).abs() > 1e-9 {
            return Err(FxError::config(format!(
                "integration_time * sample_rate / n_channels must be a positive integer, got {slices}"
            )));
        }
        Ok(())
    }

    /// Spectral slices contributing to one integration window.
    pub fn spectra_per_integration(&self) -> u64 {
        (self.integration_time * self.sample_rate / self.n_channels as f64).round() as u64
    }

    /// Width of one channel in Hz.
    pub fn frequency_resolution(&self) -> f64 {
        self.sample_rate / self.n_channels as f64
    }

    /// Centre frequency of every channel, DC first, in FFT bin order
    /// (second half of the axis is the negative baseband frequencies).
    pub fn channel_freqs(&self) -> Vec<f64> {
        let n = self.n_channels;
        let df = self.frequency_resolution();
        (0..n)
            .map(|k| {
                let bin = if k < n / 2 {
                    k as isize
                } else {
                    k as isize - n as isize
                };
                self.center_freq + bin as f64 * df
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_channels() {
        let cfg = Config {
            n_channels: 100,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(FxError::Config(_))));
    }

    #[test]
    fn rejects_overlap_outside_range() {
        let cfg = Config {
            overlap: 0.6,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(FxError::Config(_))));
        let cfg = Config {
            overlap: -0.1,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(FxError::Config(_))));
    }

    #[test]
    fn rejects_fractional_spectra_per_integration() {
        let cfg = Config {
            sample_rate: 1000.0,
            n_channels: 256,
            integration_time: 1.0,
            frame_len: 4096,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(FxError::Config(_))));
    }

    #[test]
    fn rejects_position_count_mismatch() {
        let cfg = Config {
            n_ants: 4,
            ant_positions: Some(vec![[0.0; 3]; 3]),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(FxError::Config(_))));
    }

    #[test]
    fn spectra_per_integration_from_defaults() {
        // 1 s * 1024 Hz / 256 channels = 4 slices
        assert_eq!(Config::default().spectra_per_integration(), 4);
    }

    #[test]
    fn channel_freqs_follow_fft_bin_order() {
        let cfg = Config {
            n_channels: 8,
            sample_rate: 8.0,
            frame_len: 8,
            center_freq: 0.0,
            ..Config::default()
        };
        let freqs = cfg.channel_freqs();
        assert_eq!(freqs, vec![0.0, 1.0, 2.0, 3.0, -4.0, -3.0, -2.0, -1.0]);
    }
}
