//! F-engine: windowed FFT channelisation with optional quantisation
//! emulation.
//!
//! Each frame is cut into (possibly overlapping) sub-windows of one FFT
//! length per antenna, windowed, and transformed. Antennas are independent,
//! so the transform fans out across a rayon pool.

use std::f64::consts::PI;
use std::ops::Range;
use std::sync::Arc;

use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::config::{Config, WindowKind};
use crate::errors::{FxError, FxResult};
use crate::source::SignalFrame;

impl WindowKind {
    /// Window coefficients, matching the usual symmetric definitions.
    pub fn coefficients(self, len: usize) -> Vec<f64> {
        let denom = (len.max(2) - 1) as f64;
        (0..len)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / denom;
                match self {
                    WindowKind::Rectangular => 1.0,
                    WindowKind::Hanning => 0.5 * (1.0 - x.cos()),
                    WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowKind::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect()
    }
}

/// Per-antenna, per-sub-window spectra for one frame.
/// Layout is `[ant][sub_window][channel]`, channel 0 at DC.
#[derive(Clone, Debug)]
pub struct Spectrum {
    pub seq: u64,
    n_ants: usize,
    n_spectra: usize,
    n_channels: usize,
    data: Vec<Complex<f64>>,
}

impl Spectrum {
    pub fn n_ants(&self) -> usize {
        self.n_ants
    }

    pub fn n_spectra(&self) -> usize {
        self.n_spectra
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    fn range(&self, ant: usize, spec: usize) -> Range<usize> {
        let start = (ant * self.n_spectra + spec) * self.n_channels;
        start..start + self.n_channels
    }

    /// One antenna's spectrum for one sub-window.
    pub fn slice(&self, ant: usize, spec: usize) -> &[Complex<f64>] {
        &self.data[self.range(ant, spec)]
    }

    pub fn slice_mut(&mut self, ant: usize, spec: usize) -> &mut [Complex<f64>] {
        let range = self.range(ant, spec);
        &mut self.data[range]
    }
}

/// Round each component of every sample to `2^bits` levels with 3-sigma
/// clipping, emulating a coarse sampler. `bits == 0` leaves the frame
/// untouched.
pub fn quantize_frame(samples: &mut [Vec<Complex<f64>>], bits: u32) {
    if bits == 0 {
        return;
    }
    let count = samples.iter().map(|row| row.len()).sum::<usize>();
    if count == 0 {
        return;
    }
    let n_levels = 1u32 << bits;
    let steps = (n_levels / 2 - 1).max(1) as f64;

    // 3-sigma clipping scale per component, over the whole frame.
    let mut mean = Complex::new(0.0, 0.0);
    for z in samples.iter().flatten() {
        mean += z;
    }
    mean /= count as f64;
    let mut var_re = 0.0;
    let mut var_im = 0.0;
    for z in samples.iter().flatten() {
        var_re += (z.re - mean.re) * (z.re - mean.re);
        var_im += (z.im - mean.im) * (z.im - mean.im);
    }
    let scale_re = 3.0 * (var_re / count as f64).sqrt();
    let scale_im = 3.0 * (var_im / count as f64).sqrt();

    let snap = |v: f64, scale: f64| -> f64 {
        if scale > 0.0 {
            ((v / scale).clamp(-1.0, 1.0) * steps).round() / steps * scale
        } else {
            v
        }
    };
    for z in samples.iter_mut().flatten() {
        z.re = snap(z.re, scale_re);
        z.im = snap(z.im, scale_im);
    }
}

pub struct Channelizer {
    n_channels: usize,
    stride: usize,
    quantize_bits: u32,
    window: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
}

impl Channelizer {
    pub fn new(cfg: &Config) -> FxResult<Self> {
        if cfg.n_channels < 2 || !cfg.n_channels.is_power_of_two() {
            return Err(FxError::config(format!(
                "channel count must be a power of two >= 2, got {}",
                cfg.n_channels
            )));
        }
        if !(0.0..=0.5).contains(&cfg.overlap) {
            return Err(FxError::config(format!(
                "overlap fraction must be within [0, 0.5], got {}",
                cfg.overlap
            )));
        }
        let stride = ((cfg.n_channels as f64 * (1.0 - cfg.overlap)) as usize).max(1);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(cfg.n_channels);
        Ok(Self {
            n_channels: cfg.n_channels,
            stride,
            quantize_bits: cfg.quantize_bits,
            window: cfg.window.coefficients(cfg.n_channels),
            fft,
        })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Sub-windows produced per frame of `n_samples`.
    pub fn spectra_per_frame(&self, n_samples: usize) -> usize {
        if n_samples < self.n_channels {
            0
        } else {
            (n_samples - self.n_channels) / self.stride + 1
        }
    }

    /// Channelise one frame, consuming it.
    pub fn process(&self, mut frame: SignalFrame) -> FxResult<Spectrum> {
        let n_ants = frame.n_ants();
        let n_samples = frame.len();
        if n_ants == 0 {
            return Err(FxError::processing(frame.seq, "frame holds no antennas"));
        }
        if frame.samples.iter().any(|row| row.len() != n_samples) {
            return Err(FxError::processing(frame.seq, "ragged frame rows"));
        }
        let n_spectra = self.spectra_per_frame(n_samples);
        if n_spectra == 0 {
            return Err(FxError::processing(
                frame.seq,
                format!(
                    "frame of {} samples is too short for {}-channel sub-windows",
                    n_samples, self.n_channels
                ),
            ));
        }

        quantize_frame(&mut frame.samples, self.quantize_bits);

        let mut data = vec![Complex::new(0.0, 0.0); n_ants * n_spectra * self.n_channels];
        data.par_chunks_mut(n_spectra * self.n_channels)
            .zip(frame.samples.par_iter())
            .for_each(|(out, row)| {
                for spec in 0..n_spectra {
                    let start = spec * self.stride;
                    let bins = &mut out[spec * self.n_channels..(spec + 1) * self.n_channels];
                    for (k, bin) in bins.iter_mut().enumerate() {
                        *bin = row[start + k] * self.window[k];
                    }
                    self.fft.process(bins);
                }
            });

        Ok(Spectrum {
            seq: frame.seq,
            n_ants,
            n_spectra,
            n_channels: self.n_channels,
            data,
        })
    }
}
