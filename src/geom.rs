//! Static array geometry and geometric-delay math.
//!
//! Positions are metres in a local tangent frame (x east, y north, z up).
//! Celestial direction vector (s): unit vector from the array towards the
//! source. Geometric delay for antenna i is (b_i . s) / C, referenced to
//! antenna 0 so residual delays stay small and centred near zero.

use crate::config::Config;
use crate::errors::{FxError, FxResult};

/// Speed of light in m/s.
pub const C: f64 = 299792458.0;

#[derive(Clone, Debug)]
pub struct ArrayGeometry {
    positions: Vec<[f64; 3]>,
}

impl ArrayGeometry {
    pub fn from_positions(positions: Vec<[f64; 3]>, expected_ants: usize) -> FxResult<Self> {
        if positions.len() != expected_ants {
            return Err(FxError::config(format!(
                "geometry holds {} positions for {} antennas",
                positions.len(),
                expected_ants
            )));
        }
        Ok(Self { positions })
    }

    /// Uniform circle of `n` antennas in the tangent plane.
    pub fn circular(n: usize, radius: f64) -> Self {
        let positions = (0..n)
            .map(|i| {
                let theta = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
                [radius * theta.cos(), radius * theta.sin(), 0.0]
            })
            .collect();
        Self { positions }
    }

    pub fn from_config(cfg: &Config) -> FxResult<Self> {
        match &cfg.ant_positions {
            Some(positions) => Self::from_positions(positions.clone(), cfg.n_ants),
            None => Ok(Self::circular(cfg.n_ants, cfg.ant_radius)),
        }
    }

    pub fn n_ants(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[[f64; 3]] {
        &self.positions
    }

    /// Unreferenced arrival delay of each antenna for a source direction,
    /// in seconds. Positive delay means the wavefront reaches that antenna
    /// after it would reach the frame origin.
    pub fn raw_delays_toward(&self, direction: [f64; 3]) -> Vec<f64> {
        self.positions
            .iter()
            .map(|p| dot(*p, direction) / C)
            .collect()
    }

    /// Delays referenced to antenna 0, as applied by the compensator.
    pub fn delays_toward(&self, direction: [f64; 3]) -> Vec<f64> {
        let mut delays = self.raw_delays_toward(direction);
        let reference = delays.first().copied().unwrap_or(0.0);
        for d in &mut delays {
            *d -= reference;
        }
        delays
    }
}

#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Normalise a direction vector, rejecting the degenerate zero vector.
pub fn unit_vector(v: [f64; 3]) -> FxResult<[f64; 3]> {
    let norm = dot(v, v).sqrt();
    if !(norm > 0.0) || !norm.is_finite() {
        return Err(FxError::config(
            "phase-centre direction must be a non-zero finite vector",
        ));
    }
    Ok([v[0] / norm, v[1] / norm, v[2] / norm])
}

/// In-plane bearing (radians, x towards 0) to a unit direction vector.
pub fn direction_from_azimuth(az_rad: f64) -> [f64; 3] {
    [az_rad.cos(), az_rad.sin(), 0.0]
}
