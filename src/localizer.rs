// src/localizer.rs

//! Per-frame direction-of-arrival energy estimation. For each candidate grid
//! direction the cross-spectrum of every microphone pair is phase-aligned by
//! the direction's expected delay and accumulated into a generalized
//! cross-correlation (GCC-PHAT) score.

use crate::direction_grid::DirectionGrid;
use crate::error::{Result, TrackerError};
use rustfft::num_complex::Complex32;

/// A bearing estimate reported to the outside world.
#[derive(Debug, Clone, Copy)]
pub struct Bearing {
    /// Unit vector pointing from the array toward the source.
    pub direction: [f32; 3],
    /// In [0, 1]; how much the estimator trusts the direction.
    pub confidence: f32,
}

impl Bearing {
    pub fn azimuth_degrees(&self) -> f32 {
        self.direction[1].atan2(self.direction[0]).to_degrees()
    }

    pub fn elevation_degrees(&self) -> f32 {
        self.direction[2]
            .clamp(-1.0, 1.0)
            .asin()
            .to_degrees()
    }
}

/// One estimator per update policy; the tracking variant composes the plain
/// distribution estimator with a particle filter.
pub trait DirectionEstimator {
    fn estimate(&mut self, spectra: &[Vec<Complex32>]) -> Bearing;
}

/// Energy over the full direction grid for one frame.
pub struct Distribution {
    pub directions: Vec<[f32; 3]>,
    pub energies: Vec<f32>,
}

impl Distribution {
    /// Index of the direction with maximal energy.
    pub fn argmax(&self) -> usize {
        let mut best = 0;
        for (m, &e) in self.energies.iter().enumerate() {
            if e > self.energies[best] {
                best = m;
            }
        }
        best
    }

    pub fn argmax_direction(&self) -> [f32; 3] {
        self.directions[self.argmax()]
    }

    /// 4 x M row-major packing (three coordinate rows plus one energy row),
    /// convenient for plotting front ends.
    pub fn to_packed(&self) -> Vec<f32> {
        let m = self.directions.len();
        let mut packed = vec![0.0; 4 * m];
        for (i, d) in self.directions.iter().enumerate() {
            packed[i] = d[0];
            packed[m + i] = d[1];
            packed[2 * m + i] = d[2];
            packed[3 * m + i] = self.energies[i];
        }
        packed
    }
}

pub struct EnergyDistributionEstimator {
    grid: DirectionGrid,
    fft_len: usize,
    sample_rate: f32,
}

impl EnergyDistributionEstimator {
    pub fn new(grid: DirectionGrid, fft_len: usize, sample_rate: f32) -> Result<Self> {
        if fft_len == 0 || sample_rate <= 0.0 {
            return Err(TrackerError::InvalidConfig(
                "fft length and sample rate must be positive".into(),
            ));
        }
        Ok(Self {
            grid,
            fft_len,
            sample_rate,
        })
    }

    pub fn grid(&self) -> &DirectionGrid {
        &self.grid
    }

    /// Steered GCC-PHAT energy for every grid direction. `spectra` holds one
    /// full complex spectrum per microphone channel; only the positive
    /// frequencies below Nyquist contribute.
    pub fn distribution(&self, spectra: &[Vec<Complex32>]) -> Distribution {
        assert!(
            spectra.len() >= self.pair_channel_count(),
            "expected a spectrum per microphone"
        );
        let half = self.fft_len / 2;
        let bin_hz = self.sample_rate / self.fft_len as f32;
        let mut energies = vec![0.0f32; self.grid.len()];

        for (p, &(i, j)) in self.grid.pairs().iter().enumerate() {
            for k in 1..half {
                let cross = spectra[i][k] * spectra[j][k].conj();
                let magnitude = cross.norm();
                if magnitude <= f32::EPSILON {
                    continue;
                }
                let phat = cross / magnitude;
                let omega = std::f32::consts::TAU * bin_hz * k as f32;
                for (m, energy) in energies.iter_mut().enumerate() {
                    // Counter-rotate by the expected pair delay; a matching
                    // direction turns the cross-spectrum real-positive.
                    let phase = -omega * self.grid.delays(m)[p];
                    *energy += phat.re * phase.cos() - phat.im * phase.sin();
                }
            }
        }

        Distribution {
            directions: self.grid.directions().to_vec(),
            energies,
        }
    }

    fn pair_channel_count(&self) -> usize {
        self.grid
            .pairs()
            .iter()
            .map(|&(_, j)| j + 1)
            .max()
            .unwrap_or(0)
    }
}

impl DirectionEstimator for EnergyDistributionEstimator {
    fn estimate(&mut self, spectra: &[Vec<Complex32>]) -> Bearing {
        let dist = self.distribution(spectra);
        let best = dist.argmax();
        let total: f32 = dist.energies.iter().map(|e| e.max(0.0)).sum();
        let confidence = if total > 0.0 {
            (dist.energies[best].max(0.0) / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Bearing {
            direction: dist.directions[best],
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthesizes per-channel spectra for a plane wave arriving from `d`:
    /// `X_m[k] = e^{+j omega_k (pos_m . d) / c}`.
    fn plane_wave_spectra(
        layout: &[[f32; 3]],
        d: [f32; 3],
        fft_len: usize,
        sample_rate: f32,
    ) -> Vec<Vec<Complex32>> {
        use crate::direction_grid::SPEED_OF_SOUND;
        let bin_hz = sample_rate / fft_len as f32;
        layout
            .iter()
            .map(|pos| {
                (0..fft_len)
                    .map(|k| {
                        let freq = bin_hz * k.min(fft_len - k) as f32;
                        let delay = (pos[0] * d[0] + pos[1] * d[1] + pos[2] * d[2])
                            / SPEED_OF_SOUND;
                        let phase = std::f32::consts::TAU * freq * delay;
                        Complex32::new(phase.cos(), phase.sin())
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn argmax_recovers_known_bearing() {
        let layout = vec![[-0.05, 0.0, 0.0], [0.05, 0.0, 0.0], [0.0, 0.05, 0.0]];
        let grid = DirectionGrid::new(&layout, 36, 1).unwrap();
        let fft_len = 512;
        let sample_rate = 16_000.0;
        let estimator = EnergyDistributionEstimator::new(grid, fft_len, sample_rate).unwrap();

        // Pick an exact grid direction as ground truth.
        let truth = estimator.grid().direction(9);
        let spectra = plane_wave_spectra(&layout, truth, fft_len, sample_rate);
        let dist = estimator.distribution(&spectra);
        assert_eq!(dist.argmax(), 9);
    }

    #[test]
    fn estimator_reports_confident_bearing() {
        let layout = vec![[-0.05, 0.0, 0.0], [0.05, 0.0, 0.0], [0.0, 0.05, 0.0]];
        let grid = DirectionGrid::new(&layout, 24, 1).unwrap();
        let mut estimator = EnergyDistributionEstimator::new(grid, 256, 16_000.0).unwrap();
        let truth = estimator.grid().direction(6);
        let spectra = plane_wave_spectra(&layout, truth, 256, 16_000.0);
        let bearing = estimator.estimate(&spectra);
        let dot = bearing.direction[0] * truth[0]
            + bearing.direction[1] * truth[1]
            + bearing.direction[2] * truth[2];
        assert!(dot > 0.999);
        assert!(bearing.confidence > 0.0);
    }

    #[test]
    fn packed_distribution_has_four_rows() {
        let layout = vec![[-0.05, 0.0, 0.0], [0.05, 0.0, 0.0]];
        let grid = DirectionGrid::new(&layout, 8, 1).unwrap();
        let estimator = EnergyDistributionEstimator::new(grid, 128, 16_000.0).unwrap();
        let spectra = vec![vec![Complex32::new(1.0, 0.0); 128]; 2];
        let dist = estimator.distribution(&spectra);
        let packed = dist.to_packed();
        assert_eq!(packed.len(), 4 * 8);
        assert_eq!(packed[0], dist.directions[0][0]);
        assert_eq!(packed[3 * 8 + 5], dist.energies[5]);
    }

    #[test]
    fn azimuth_and_elevation_conversions() {
        let b = Bearing {
            direction: [0.0, 1.0, 0.0],
            confidence: 1.0,
        };
        assert!((b.azimuth_degrees() - 90.0).abs() < 1e-4);
        assert!(b.elevation_degrees().abs() < 1e-4);
    }
}
