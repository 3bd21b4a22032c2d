// src/direction_grid.rs

//! Fixed discretization of candidate source directions with precomputed
//! steering delays for the microphone array geometry. Immutable after
//! construction.

use crate::error::{Result, TrackerError};

/// Propagation speed of sound in air, m/s.
pub const SPEED_OF_SOUND: f32 = 343.0;

pub struct DirectionGrid {
    n_theta: usize,
    n_phi: usize,
    /// Unit vectors pointing from the array toward each candidate source.
    directions: Vec<[f32; 3]>,
    /// Microphone index pairs (i < j) the delays are computed for.
    pairs: Vec<(usize, usize)>,
    /// `delays[m][p]`: expected arrival-time difference in seconds between
    /// pair `p`'s microphones for direction `m`, `(pos_i - pos_j) . d / c`.
    delays: Vec<Vec<f32>>,
}

impl DirectionGrid {
    /// Builds an `n_theta x n_phi` grid over the upper hemisphere; `n_phi == 1`
    /// collapses to the horizontal plane (elevation zero).
    pub fn new(mic_layout: &[[f32; 3]], n_theta: usize, n_phi: usize) -> Result<Self> {
        if mic_layout.len() < 2 {
            return Err(TrackerError::InvalidConfig(
                "at least two microphones are required".into(),
            ));
        }
        if n_theta == 0 || n_phi == 0 {
            return Err(TrackerError::InvalidConfig(
                "direction grid resolution must be positive".into(),
            ));
        }

        let mut directions = Vec::with_capacity(n_theta * n_phi);
        for p in 0..n_phi {
            // Elevations span [0, 90): stopping short of the pole keeps every
            // row of `n_theta` azimuths distinct (the zenith itself would
            // collapse a whole row into one duplicated direction).
            let elevation = std::f32::consts::FRAC_PI_2 * p as f32 / n_phi as f32;
            for t in 0..n_theta {
                let azimuth = std::f32::consts::TAU * t as f32 / n_theta as f32;
                directions.push([
                    elevation.cos() * azimuth.cos(),
                    elevation.cos() * azimuth.sin(),
                    elevation.sin(),
                ]);
            }
        }

        let mut pairs = Vec::new();
        for i in 0..mic_layout.len() {
            for j in (i + 1)..mic_layout.len() {
                pairs.push((i, j));
            }
        }

        let delays = directions
            .iter()
            .map(|d| {
                pairs
                    .iter()
                    .map(|&(i, j)| {
                        let baseline = [
                            mic_layout[i][0] - mic_layout[j][0],
                            mic_layout[i][1] - mic_layout[j][1],
                            mic_layout[i][2] - mic_layout[j][2],
                        ];
                        (baseline[0] * d[0] + baseline[1] * d[1] + baseline[2] * d[2])
                            / SPEED_OF_SOUND
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            n_theta,
            n_phi,
            directions,
            pairs,
            delays,
        })
    }

    pub fn len(&self) -> usize {
        self.directions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directions.is_empty()
    }

    pub fn is_planar(&self) -> bool {
        self.n_phi == 1
    }

    pub fn n_theta(&self) -> usize {
        self.n_theta
    }

    pub fn n_phi(&self) -> usize {
        self.n_phi
    }

    pub fn direction(&self, m: usize) -> [f32; 3] {
        self.directions[m]
    }

    pub fn directions(&self) -> &[[f32; 3]] {
        &self.directions
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    pub fn delays(&self, m: usize) -> &[f32] {
        &self.delays[m]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_layout() -> Vec<[f32; 3]> {
        vec![[-0.05, 0.0, 0.0], [0.05, 0.0, 0.0]]
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(DirectionGrid::new(&[[0.0; 3]], 8, 1).is_err());
        assert!(DirectionGrid::new(&stereo_layout(), 0, 1).is_err());
        assert!(DirectionGrid::new(&stereo_layout(), 8, 0).is_err());
    }

    #[test]
    fn planar_grid_lies_in_plane_with_unit_norm() {
        let grid = DirectionGrid::new(&stereo_layout(), 16, 1).unwrap();
        assert_eq!(grid.len(), 16);
        assert!(grid.is_planar());
        for m in 0..grid.len() {
            let d = grid.direction(m);
            assert_eq!(d[2], 0.0);
            let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn spherical_grid_covers_hemisphere() {
        let grid = DirectionGrid::new(&stereo_layout(), 8, 4).unwrap();
        assert_eq!(grid.len(), 32);
        assert!(!grid.is_planar());
        for m in 0..grid.len() {
            let d = grid.direction(m);
            assert!(d[2] >= -1e-6);
            // Below the pole: elevation stays under 90 degrees.
            assert!(d[2] < 1.0 - 1e-6);
        }
    }

    #[test]
    fn spherical_grid_has_no_duplicate_directions() {
        let grid = DirectionGrid::new(&stereo_layout(), 8, 4).unwrap();
        for a in 0..grid.len() {
            for b in (a + 1)..grid.len() {
                let da = grid.direction(a);
                let db = grid.direction(b);
                let dot = da[0] * db[0] + da[1] * db[1] + da[2] * db[2];
                assert!(
                    dot < 1.0 - 1e-6,
                    "directions {} and {} coincide: {:?}",
                    a,
                    b,
                    da
                );
            }
        }
    }

    #[test]
    fn delays_match_geometry() {
        let grid = DirectionGrid::new(&stereo_layout(), 4, 1).unwrap();
        // Direction 0 is along +x: mic 0 sits 0.1 m farther from the source
        // than mic 1, so the pair delay is -0.1 / c.
        assert_eq!(grid.pairs(), &[(0, 1)]);
        let expected = -0.1 / SPEED_OF_SOUND;
        assert!((grid.delays(0)[0] - expected).abs() < 1e-9);
        // Broadside (+y) direction has zero delay.
        assert!(grid.delays(1)[0].abs() < 1e-9);
    }
}
