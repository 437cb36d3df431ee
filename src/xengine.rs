//! X-engine: baseline products and time accumulation.
//!
//! Baselines are enumerated once in a canonical order every consumer must
//! reproduce: i from 0..N, then j from i..N, autocorrelations included,
//! N(N+1)/2 entries in total. The accumulator has exactly one writer and is
//! cleared only by `flush` or `discard`.

use num_complex::Complex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::{FxError, FxResult};
use crate::fengine::Spectrum;

/// Ordered antenna pair with `a <= b`; `a == b` is an autocorrelation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub a: usize,
    pub b: usize,
}

impl Baseline {
    pub fn is_auto(&self) -> bool {
        self.a == self.b
    }
}

/// The canonical baseline list for `n_ants` antennas.
pub fn enumerate_baselines(n_ants: usize) -> Vec<Baseline> {
    let mut baselines = Vec::with_capacity(n_ants * (n_ants + 1) / 2);
    for i in 0..n_ants {
        for j in i..n_ants {
            baselines.push(Baseline { a: i, b: j });
        }
    }
    baselines
}

/// An averaged integration window handed to the emitter by value.
#[derive(Clone, Debug)]
pub struct IntegratedVisibilities {
    /// Row-major `(baseline, channel)` matrix in canonical baseline order.
    pub matrix: Vec<Complex<f64>>,
    /// Spectral slices that contributed to the average.
    pub n_slices: u64,
}

pub struct XEngine {
    n_ants: usize,
    n_channels: usize,
    baselines: Vec<Baseline>,
    spectra_per_integration: u64,
    acc: Vec<Complex<f64>>,
    slices: u64,
}

impl XEngine {
    pub fn new(cfg: &Config) -> FxResult<Self> {
        cfg.validate()?;
        let baselines = enumerate_baselines(cfg.n_ants);
        let acc = vec![Complex::new(0.0, 0.0); baselines.len() * cfg.n_channels];
        Ok(Self {
            n_ants: cfg.n_ants,
            n_channels: cfg.n_channels,
            baselines,
            spectra_per_integration: cfg.spectra_per_integration(),
            acc,
            slices: 0,
        })
    }

    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    pub fn n_baselines(&self) -> usize {
        self.baselines.len()
    }

    pub fn slices_accumulated(&self) -> u64 {
        self.slices
    }

    /// Products `E_i * conj(E_j)` for one spectral slice, in canonical
    /// baseline order. Pure; does not touch the accumulator.
    pub fn correlate(&self, spectrum: &Spectrum, spec_idx: usize) -> FxResult<Vec<Complex<f64>>> {
        if spectrum.n_ants() != self.n_ants || spectrum.n_channels() != self.n_channels {
            return Err(FxError::processing(
                spectrum.seq,
                format!(
                    "spectrum shape {}x{} entering correlator sized {}x{}",
                    spectrum.n_ants(),
                    spectrum.n_channels(),
                    self.n_ants,
                    self.n_channels
                ),
            ));
        }
        if spec_idx >= spectrum.n_spectra() {
            return Err(FxError::processing(
                spectrum.seq,
                format!("sub-window {spec_idx} out of range"),
            ));
        }
        let rows: Vec<&[Complex<f64>]> = (0..self.n_ants)
            .map(|ant| spectrum.slice(ant, spec_idx))
            .collect();

        let mut products = vec![Complex::new(0.0, 0.0); self.baselines.len() * self.n_channels];
        products
            .par_chunks_mut(self.n_channels)
            .zip(self.baselines.par_iter())
            .for_each(|(out, bl)| {
                let (ei, ej) = (rows[bl.a], rows[bl.b]);
                for (k, v) in out.iter_mut().enumerate() {
                    *v = ei[k] * ej[k].conj();
                }
            });
        Ok(products)
    }

    /// Add one slice of products into the accumulator. Single mutation
    /// point; callers uphold the single-writer discipline. `seq` names the
    /// originating frame so a rejected block is attributable in the log.
    pub fn accumulate(&mut self, seq: u64, products: &[Complex<f64>]) -> FxResult<()> {
        if products.len() != self.acc.len() {
            return Err(FxError::processing(
                seq,
                format!(
                    "product block of {} values for accumulator of {}",
                    products.len(),
                    self.acc.len()
                ),
            ));
        }
        for (acc, p) in self.acc.iter_mut().zip(products.iter()) {
            *acc += p;
        }
        self.slices += 1;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.slices >= self.spectra_per_integration
    }

    /// Average and hand off the accumulated window, leaving a zeroed
    /// accumulator behind in one step. Returns `None` when nothing has been
    /// accumulated.
    pub fn flush(&mut self) -> Option<IntegratedVisibilities> {
        if self.slices == 0 {
            return None;
        }
        let n_slices = self.slices;
        // Swap-and-reset: the caller can never observe a half-cleared buffer.
        let mut matrix = std::mem::replace(
            &mut self.acc,
            vec![Complex::new(0.0, 0.0); self.baselines.len() * self.n_channels],
        );
        self.slices = 0;
        let scale = 1.0 / n_slices as f64;
        for v in &mut matrix {
            *v *= scale;
        }
        Some(IntegratedVisibilities { matrix, n_slices })
    }

    /// Drop an in-progress accumulation without emitting it.
    pub fn discard(&mut self) {
        self.acc.fill(Complex::new(0.0, 0.0));
        self.slices = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowKind;
    use crate::fengine::Channelizer;
    use crate::source::SignalFrame;

    fn engine(n_ants: usize, n_channels: usize, spectra: u64) -> XEngine {
        let cfg = Config {
            n_ants,
            n_channels,
            frame_len: n_channels,
            sample_rate: (n_channels as u64 * spectra) as f64,
            integration_time: 1.0,
            ..Config::default()
        };
        XEngine::new(&cfg).unwrap()
    }

    #[test]
    fn canonical_baseline_list_is_complete_and_stable() {
        for n in [1usize, 2, 4, 7] {
            let baselines = enumerate_baselines(n);
            assert_eq!(baselines.len(), n * (n + 1) / 2);
            assert_eq!(baselines, enumerate_baselines(n));
        }
        assert_eq!(
            enumerate_baselines(3),
            vec![
                Baseline { a: 0, b: 0 },
                Baseline { a: 0, b: 1 },
                Baseline { a: 0, b: 2 },
                Baseline { a: 1, b: 1 },
                Baseline { a: 1, b: 2 },
                Baseline { a: 2, b: 2 },
            ]
        );
    }

    #[test]
    fn flush_returns_the_mean_and_resets() {
        // 2 antennas -> 3 baselines, but the property of interest is the
        // per-cell average: products of (2+0j) then (4+0j) flush to (3+0j).
        let mut xe = engine(2, 4, 2);
        let len = xe.n_baselines() * 4;
        xe.accumulate(0, &vec![Complex::new(2.0, 0.0); len]).unwrap();
        assert!(!xe.is_ready());
        xe.accumulate(1, &vec![Complex::new(4.0, 0.0); len]).unwrap();
        assert!(xe.is_ready());

        let flushed = xe.flush().unwrap();
        assert_eq!(flushed.n_slices, 2);
        for v in &flushed.matrix {
            assert!((v - Complex::new(3.0, 0.0)).norm() < 1e-12);
        }
        // All-or-nothing reset.
        assert_eq!(xe.slices_accumulated(), 0);
        assert!(!xe.is_ready());
        assert!(xe.flush().is_none());
        xe.accumulate(2, &vec![Complex::new(8.0, 0.0); len]).unwrap();
        xe.accumulate(3, &vec![Complex::new(8.0, 0.0); len]).unwrap();
        let again = xe.flush().unwrap();
        for v in &again.matrix {
            assert!((v - Complex::new(8.0, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn discard_drops_partial_accumulation() {
        let mut xe = engine(2, 4, 2);
        let len = xe.n_baselines() * 4;
        xe.accumulate(0, &vec![Complex::new(5.0, 5.0); len]).unwrap();
        xe.discard();
        assert_eq!(xe.slices_accumulated(), 0);
        assert!(xe.flush().is_none());
    }

    #[test]
    fn correlate_forms_conjugate_products() {
        let xe = engine(2, 4, 1);
        let cfg = Config {
            n_channels: 4,
            window: WindowKind::Rectangular,
            ..Config::default()
        };
        let ch = Channelizer::new(&cfg).unwrap();
        let samples = vec![
            vec![Complex::new(1.0, 0.0); 4],
            vec![Complex::new(0.0, 1.0); 4],
        ];
        let spectrum = ch.process(SignalFrame { seq: 3, samples }).unwrap();
        let products = xe.correlate(&spectrum, 0).unwrap();

        // DC channel of each baseline: E0 = 4, E1 = 4j.
        let n_ch = 4;
        let v00 = products[0];
        let v01 = products[n_ch];
        let v11 = products[2 * n_ch];
        assert!((v00 - Complex::new(16.0, 0.0)).norm() < 1e-9);
        assert!((v01 - Complex::new(0.0, -16.0)).norm() < 1e-9);
        assert!((v11 - Complex::new(16.0, 0.0)).norm() < 1e-9);
    }

    #[test]
    fn autocorrelations_have_vanishing_imaginary_part() {
        // Noise-free tones through the full correlate/accumulate path.
        let n_ants = 3;
        let n_channels = 32;
        let mut xe = engine(n_ants, n_channels, 4);
        let cfg = Config {
            n_channels,
            window: WindowKind::Hanning,
            ..Config::default()
        };
        let ch = Channelizer::new(&cfg).unwrap();
        for seq in 0..4u64 {
            let samples = (0..n_ants)
                .map(|a| {
                    (0..n_channels)
                        .map(|k| {
                            let t = (seq as usize * n_channels + k) as f64;
                            Complex::from_polar(
                                1.0,
                                2.0 * std::f64::consts::PI * (0.1 + 0.05 * a as f64) * t,
                            )
                        })
                        .collect()
                })
                .collect();
            let spectrum = ch.process(SignalFrame { seq, samples }).unwrap();
            let products = xe.correlate(&spectrum, 0).unwrap();
            xe.accumulate(seq, &products).unwrap();
        }
        let flushed = xe.flush().unwrap();
        for (bl_idx, bl) in enumerate_baselines(n_ants).iter().enumerate() {
            if bl.is_auto() {
                for k in 0..n_channels {
                    let v = flushed.matrix[bl_idx * n_channels + k];
                    assert!(
                        v.im.abs() < 1e-9 * (1.0 + v.re.abs()),
                        "baseline ({},{}) channel {k} imag {}",
                        bl.a,
                        bl.b,
                        v.im
                    );
                }
            }
        }
    }

    #[test]
    fn rejected_product_block_names_its_frame() {
        let mut xe = engine(2, 4, 2);
        let short = vec![Complex::new(1.0, 0.0); 3];
        assert!(matches!(
            xe.accumulate(42, &short),
            Err(FxError::Processing { seq: 42, .. })
        ));
        assert_eq!(xe.slices_accumulated(), 0);
    }

    #[test]
    fn shape_mismatch_entering_the_correlator_is_rejected() {
        let xe = engine(3, 4, 1);
        let cfg = Config {
            n_channels: 4,
            window: WindowKind::Rectangular,
            ..Config::default()
        };
        let ch = Channelizer::new(&cfg).unwrap();
        let samples = vec![vec![Complex::new(1.0, 0.0); 4]; 2];
        let spectrum = ch.process(SignalFrame { seq: 9, samples }).unwrap();
        assert!(matches!(
            xe.correlate(&spectrum, 0),
            Err(FxError::Processing { seq: 9, .. })
        ));
    }
}
