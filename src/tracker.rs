// src/tracker.rs

//! Sequential Monte Carlo tracking of the source direction. State and
//! observation both live on the direction manifold and are modeled with von
//! Mises distributions:
//!
//!     x_t ~ VM(x_{t-1}, state_kappa)
//!     y_t ~ VM(x_t, observation_kappa)
//!
//! An optional spike-and-slab mixture down-weights observations that look
//! like they came from a near-uniform background instead of the source.

use crate::error::{Result, TrackerError};
use crate::localizer::{Bearing, DirectionEstimator, EnergyDistributionEstimator};
use crate::von_mises;
use log::warn;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustfft::num_complex::Complex32;

/// Background component of the outlier mixture: almost flat, anchored at an
/// arbitrary fixed direction.
const OUTLIER_KAPPA: f64 = 0.001;
/// Concentration of the initial particle cloud; small enough to be near
/// uniform.
const INIT_KAPPA: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct TrackerParams {
    pub n_particles: usize,
    pub state_kappa: f64,
    pub observation_kappa: f64,
    /// Prior probability that an observation is background noise. Zero
    /// disables the mixture and uses the direct weight update.
    pub outlier_prob: f64,
    /// Resample every this many updates.
    pub resample_interval: usize,
    /// 2 for planar tracking, 3 for spherical.
    pub dimensions: usize,
}

impl TrackerParams {
    fn validate(&self) -> Result<()> {
        if self.n_particles < 1 {
            return Err(TrackerError::InvalidConfig(
                "particle count must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.outlier_prob) {
            return Err(TrackerError::InvalidConfig(format!(
                "outlier probability {} must be within [0, 1]",
                self.outlier_prob
            )));
        }
        if self.state_kappa <= 0.0 || self.observation_kappa <= 0.0 {
            return Err(TrackerError::InvalidConfig(
                "concentration parameters must be positive".into(),
            ));
        }
        if self.resample_interval < 1 {
            return Err(TrackerError::InvalidConfig(
                "resample interval must be at least 1".into(),
            ));
        }
        if !(self.dimensions == 2 || self.dimensions == 3) {
            return Err(TrackerError::InvalidConfig(format!(
                "unsupported dimensionality {}",
                self.dimensions
            )));
        }
        Ok(())
    }
}

pub struct DirectionalParticleTracker {
    params: TrackerParams,
    particles: Vec<Vec<f64>>,
    weights: Vec<f64>,
    /// Posterior point estimate from the previous update; feeds the class
    /// posteriors of the mixture update.
    estimate: Vec<f64>,
    outlier_mu: Vec<f64>,
    rng: StdRng,
    update_count: usize,
    degenerate_count: u64,
}

impl DirectionalParticleTracker {
    pub fn new(params: TrackerParams) -> Result<Self> {
        Self::with_seed(params, rand::random())
    }

    /// Deterministic variant for tests and reproducible runs.
    pub fn with_seed(params: TrackerParams, seed: u64) -> Result<Self> {
        params.validate()?;
        let ndim = params.dimensions;
        let mut rng = StdRng::seed_from_u64(seed);

        let init_mu = vec![1.0 / (ndim as f64).sqrt(); ndim];
        let particles: Vec<Vec<f64>> = (0..params.n_particles)
            .map(|_| von_mises::sample(&mut rng, &init_mu, INIT_KAPPA))
            .collect();
        let weights = vec![1.0 / params.n_particles as f64; params.n_particles];

        // Fixed "no signal" anchor for the background component.
        let mut outlier_mu = vec![0.0; ndim];
        outlier_mu[1] = -1.0;

        let mut tracker = Self {
            params,
            particles,
            weights,
            estimate: init_mu,
            outlier_mu,
            rng,
            update_count: 0,
            degenerate_count: 0,
        };
        tracker.update_estimate();
        Ok(tracker)
    }

    pub fn estimate(&self) -> &[f64] {
        &self.estimate
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of times the weights collapsed and were reset to uniform.
    pub fn degenerate_count(&self) -> u64 {
        self.degenerate_count
    }

    /// One full filter step for the observed direction (unit vector of the
    /// configured dimensionality). Returns the updated posterior estimate.
    pub fn update(&mut self, observation: &[f64]) -> &[f64] {
        assert_eq!(observation.len(), self.params.dimensions);
        self.update_count += 1;
        if self.update_count % self.params.resample_interval == 0 {
            self.resample();
        }
        if self.params.outlier_prob > 0.0 {
            self.weighted_bayes(observation);
        } else {
            self.bayes(observation);
        }
        if let Err(err) = self.normalize_weights() {
            warn!("particle weights degenerated ({err}); resetting to uniform");
            self.degenerate_count += 1;
            let uniform = 1.0 / self.weights.len() as f64;
            self.weights.iter_mut().for_each(|w| *w = uniform);
        }
        self.update_estimate();
        &self.estimate
    }

    /// Direct update: propagate each particle through the state transition,
    /// then scale its weight by the observation likelihood.
    fn bayes(&mut self, observation: &[f64]) {
        let kappa_v = self.params.state_kappa;
        let kappa_w = self.params.observation_kappa;
        for (particle, weight) in self.particles.iter_mut().zip(&mut self.weights) {
            *particle = von_mises::sample(&mut self.rng, particle, kappa_v);
            *weight *= von_mises::log_density(particle, kappa_w, observation).exp();
        }
    }

    /// Spike-and-slab update. Class posteriors are computed against the
    /// previous posterior point estimate (one shared estimate, not
    /// per-particle); only the state-conditioned likelihood scaled by its
    /// class posterior multiplies the weight, the background component enters
    /// solely through the class-posterior normalization.
    fn weighted_bayes(&mut self, observation: &[f64]) {
        let kappa_v = self.params.state_kappa;
        let kappa_w = self.params.observation_kappa;
        let p_out = self.params.outlier_prob;
        let log_state_prior = (1.0 - p_out).ln();
        let log_outlier_prior = p_out.ln();
        for (particle, weight) in self.particles.iter_mut().zip(&mut self.weights) {
            *particle = von_mises::sample(&mut self.rng, particle, kappa_v);

            let state_ll = von_mises::log_density(particle, kappa_w, observation);
            let state_lp =
                von_mises::log_density(&self.estimate, kappa_w, particle) + log_state_prior;
            let outlier_lp = von_mises::log_density(&self.outlier_mu, OUTLIER_KAPPA, particle)
                + log_outlier_prior;
            let total_lp = log_sum_exp(state_lp, outlier_lp);
            let state_class_post = state_lp - total_lp;
            *weight *= (state_ll + state_class_post).exp();
        }
    }

    fn normalize_weights(&mut self) -> Result<()> {
        let sum: f64 = self.weights.iter().sum();
        if !(sum.is_finite() && sum > 0.0) {
            return Err(TrackerError::DegenerateWeights { sum });
        }
        self.weights.iter_mut().for_each(|w| *w /= sum);
        Ok(())
    }

    /// Systematic resampling; weights become uniform afterwards, so the
    /// weighted mean is preserved in expectation.
    fn resample(&mut self) {
        let n = self.particles.len();
        let step = 1.0 / n as f64;
        let mut offset: f64 = rand::Rng::gen_range(&mut self.rng, 0.0..step);
        let mut cumulative = self.weights[0];
        let mut index = 0;
        let mut resampled = Vec::with_capacity(n);
        for _ in 0..n {
            while cumulative < offset && index + 1 < n {
                index += 1;
                cumulative += self.weights[index];
            }
            resampled.push(self.particles[index].clone());
            offset += step;
        }
        self.particles = resampled;
        self.weights.iter_mut().for_each(|w| *w = step);
    }

    fn weighted_mean(&self) -> Vec<f64> {
        let ndim = self.params.dimensions;
        let mut mean = vec![0.0; ndim];
        for (particle, &weight) in self.particles.iter().zip(&self.weights) {
            for (m, &c) in mean.iter_mut().zip(particle.iter()) {
                *m += weight * c;
            }
        }
        mean
    }

    /// Weighted mean renormalized onto the manifold; the resultant length
    /// doubles as a confidence measure. A zero mean keeps the previous
    /// estimate.
    fn update_estimate(&mut self) {
        let mean = self.weighted_mean();
        let norm: f64 = mean.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm > 1e-12 {
            self.estimate = mean.iter().map(|c| c / norm).collect();
        }
    }

    /// Resultant length of the current particle cloud, in [0, 1].
    pub fn concentration(&self) -> f64 {
        let mean = self.weighted_mean();
        mean.iter().map(|c| c * c).sum::<f64>().sqrt().min(1.0)
    }
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Tracking estimator: per-frame GCC arg-max observations fed through the
/// particle filter. The reported confidence is the cloud's resultant length.
pub struct TrackingDirectionEstimator {
    estimator: EnergyDistributionEstimator,
    tracker: DirectionalParticleTracker,
}

impl TrackingDirectionEstimator {
    pub fn new(
        estimator: EnergyDistributionEstimator,
        params: TrackerParams,
    ) -> Result<Self> {
        Self::with_seed(estimator, params, rand::random())
    }

    pub fn with_seed(
        estimator: EnergyDistributionEstimator,
        params: TrackerParams,
        seed: u64,
    ) -> Result<Self> {
        let planar = estimator.grid().is_planar();
        if planar != (params.dimensions == 2) {
            return Err(TrackerError::InvalidConfig(
                "tracker dimensionality does not match the direction grid".into(),
            ));
        }
        let tracker = DirectionalParticleTracker::with_seed(params, seed)?;
        Ok(Self { estimator, tracker })
    }

    pub fn tracker(&self) -> &DirectionalParticleTracker {
        &self.tracker
    }
}

impl DirectionEstimator for TrackingDirectionEstimator {
    fn estimate(&mut self, spectra: &[Vec<Complex32>]) -> Bearing {
        let raw = self.estimator.distribution(spectra).argmax_direction();
        // Observations come from the f32 grid; the filter runs in f64.
        let ndim = self.tracker.params.dimensions;
        let observation: Vec<f64> = raw[..ndim].iter().map(|&c| c as f64).collect();
        let posterior = self.tracker.update(&observation);
        let mut direction = [0.0f32; 3];
        for (out, &c) in direction.iter_mut().zip(posterior.iter()) {
            *out = c as f32;
        }
        Bearing {
            direction,
            confidence: self.tracker.concentration() as f32,
        }
    }
}
