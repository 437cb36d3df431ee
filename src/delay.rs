//! Geometric delay / phase compensation (fringe stopping).
//!
//! For a tracked direction s, antenna a is rotated by exp(-j*2*pi*tau_a*f)
//! per channel, where tau_a = (b_a . s) / C referenced to antenna 0. Delays
//! larger than a channel's ambiguity period are applied as-is; the phase is
//! well-defined modulo 2*pi and no unwrapping is attempted.

use num_complex::Complex;

use crate::errors::{FxError, FxResult};
use crate::fengine::Spectrum;
use crate::geom::{unit_vector, ArrayGeometry};

/// Tracked direction plus the referenced per-antenna delays it implies.
/// Mutated only through [`DelayCompensator::set_phase_center`].
#[derive(Clone, Debug)]
pub struct PhaseModel {
    pub direction: [f64; 3],
    pub delays_s: Vec<f64>,
}

pub struct DelayCompensator {
    geometry: ArrayGeometry,
    channel_freqs: Vec<f64>,
    model: PhaseModel,
    /// Precomputed `exp(-j*2*pi*tau_a*f_k)` phasors, `[ant][channel]`.
    phasors: Vec<Complex<f64>>,
}

impl DelayCompensator {
    pub fn new(geometry: ArrayGeometry, channel_freqs: Vec<f64>) -> Self {
        let n_ants = geometry.n_ants();
        let n_channels = channel_freqs.len();
        Self {
            geometry,
            channel_freqs,
            model: PhaseModel {
                direction: [0.0, 0.0, 1.0],
                delays_s: vec![0.0; n_ants],
            },
            phasors: vec![Complex::new(1.0, 0.0); n_ants * n_channels],
        }
    }

    pub fn model(&self) -> &PhaseModel {
        &self.model
    }

    /// Re-point the array. Infrequent: recomputes delays and the per-channel
    /// phasor table, off the per-chunk hot path.
    pub fn set_phase_center(&mut self, direction: [f64; 3]) -> FxResult<()> {
        let direction = unit_vector(direction)?;
        let delays = self.geometry.delays_toward(direction);
        let n_channels = self.channel_freqs.len();
        for (ant, &tau) in delays.iter().enumerate() {
            for (k, &freq) in self.channel_freqs.iter().enumerate() {
                let phase = -2.0 * std::f64::consts::PI * tau * freq;
                self.phasors[ant * n_channels + k] = Complex::from_polar(1.0, phase);
            }
        }
        self.model = PhaseModel {
            direction,
            delays_s: delays,
        };
        Ok(())
    }

    /// Rotate every spectral sample in place. Pure per-sample transform;
    /// idempotent under a zero-delay model.
    pub fn apply(&self, spectrum: &mut Spectrum) -> FxResult<()> {
        let n_channels = self.channel_freqs.len();
        if spectrum.n_ants() != self.geometry.n_ants() || spectrum.n_channels() != n_channels {
            return Err(FxError::processing(
                spectrum.seq,
                format!(
                    "spectrum shape {}x{} does not match compensator {}x{}",
                    spectrum.n_ants(),
                    spectrum.n_channels(),
                    self.geometry.n_ants(),
                    n_channels
                ),
            ));
        }
        for ant in 0..spectrum.n_ants() {
            let row = &self.phasors[ant * n_channels..(ant + 1) * n_channels];
            for spec in 0..spectrum.n_spectra() {
                let bins = spectrum.slice_mut(ant, spec);
                for (bin, rot) in bins.iter_mut().zip(row.iter()) {
                    *bin *= rot;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, WindowKind};
    use crate::fengine::Channelizer;
    use crate::source::SignalFrame;

    fn test_spectrum(n_ants: usize, n_channels: usize) -> Spectrum {
        let cfg = Config {
            n_channels,
            window: WindowKind::Rectangular,
            ..Config::default()
        };
        let ch = Channelizer::new(&cfg).unwrap();
        let samples = (0..n_ants)
            .map(|a| {
                (0..n_channels)
                    .map(|k| Complex::new((a + k) as f64, 0.5 * k as f64))
                    .collect()
            })
            .collect();
        ch.process(SignalFrame { seq: 0, samples }).unwrap()
    }

    fn freqs(n: usize, fs: f64) -> Vec<f64> {
        let cfg = Config {
            n_channels: n,
            sample_rate: fs,
            center_freq: 0.0,
            ..Config::default()
        };
        cfg.channel_freqs()
    }

    #[test]
    fn zero_delay_model_is_the_identity() {
        let geom = ArrayGeometry::circular(3, 10.0);
        let comp = DelayCompensator::new(geom, freqs(64, 64.0));
        let mut spectrum = test_spectrum(3, 64);
        let before: Vec<Complex<f64>> = spectrum.slice(1, 0).to_vec();
        comp.apply(&mut spectrum).unwrap();
        for (a, b) in spectrum.slice(1, 0).iter().zip(before.iter()) {
            assert!((a - b).norm() < 1e-9 * (1.0 + b.norm()));
        }
    }

    #[test]
    fn zenith_pointing_leaves_a_planar_array_unrotated() {
        let geom = ArrayGeometry::circular(3, 10.0);
        let mut comp = DelayCompensator::new(geom, freqs(64, 64.0));
        comp.set_phase_center([0.0, 0.0, 1.0]).unwrap();
        assert!(comp.model().delays_s.iter().all(|d| d.abs() < 1e-18));
        let mut spectrum = test_spectrum(3, 64);
        let before: Vec<Complex<f64>> = spectrum.slice(2, 0).to_vec();
        comp.apply(&mut spectrum).unwrap();
        for (a, b) in spectrum.slice(2, 0).iter().zip(before.iter()) {
            assert!((a - b).norm() < 1e-9 * (1.0 + b.norm()));
        }
    }

    #[test]
    fn applied_phasor_matches_closed_form() {
        // 1 km east-west pair so the delay is comfortably measurable.
        let geom =
            ArrayGeometry::from_positions(vec![[0.0; 3], [1000.0, 0.0, 0.0]], 2).unwrap();
        let channel_freqs = freqs(8, 8e6);
        let mut comp = DelayCompensator::new(geom.clone(), channel_freqs.clone());
        comp.set_phase_center([1.0, 0.0, 0.0]).unwrap();
        let tau = comp.model().delays_s[1];
        assert!((tau - 1000.0 / crate::geom::C).abs() < 1e-15);

        let mut spectrum = test_spectrum(2, 8);
        let before: Vec<Complex<f64>> = spectrum.slice(1, 0).to_vec();
        comp.apply(&mut spectrum).unwrap();
        for (k, (after, b)) in spectrum.slice(1, 0).iter().zip(before.iter()).enumerate() {
            let expected = b * Complex::from_polar(
                1.0,
                -2.0 * std::f64::consts::PI * tau * channel_freqs[k],
            );
            assert!((after - expected).norm() < 1e-9 * (1.0 + expected.norm()));
        }
    }

    #[test]
    fn opposite_rotation_restores_the_input() {
        let geom = ArrayGeometry::circular(4, 200.0);
        let channel_freqs = freqs(16, 16e6);
        let mut forward = DelayCompensator::new(geom.clone(), channel_freqs.clone());
        forward.set_phase_center([0.6, 0.8, 0.0]).unwrap();
        let mut backward = DelayCompensator::new(geom, channel_freqs);
        backward.set_phase_center([-0.6, -0.8, 0.0]).unwrap();

        let mut spectrum = test_spectrum(4, 16);
        let before: Vec<Complex<f64>> = spectrum.slice(3, 0).to_vec();
        forward.apply(&mut spectrum).unwrap();
        backward.apply(&mut spectrum).unwrap();
        for (a, b) in spectrum.slice(3, 0).iter().zip(before.iter()) {
            assert!((a - b).norm() < 1e-9 * (1.0 + b.norm()));
        }
    }

    #[test]
    fn shape_mismatch_is_a_chunk_error() {
        let geom = ArrayGeometry::circular(3, 10.0);
        let comp = DelayCompensator::new(geom, freqs(64, 64.0));
        let mut spectrum = test_spectrum(2, 64);
        assert!(matches!(
            comp.apply(&mut spectrum),
            Err(FxError::Processing { .. })
        ));
    }
}
