// src/von_mises.rs

//! Von Mises (circular) and von Mises-Fisher (spherical) sampling and
//! log-density evaluation. Directions are unit vectors; `dim` selects the
//! effective dimensionality (2 for planar tracking, 3 for spherical).
//! Densities are evaluated in log-space so large concentrations do not
//! underflow.

use rand::Rng;
use std::f64::consts::{PI, TAU};

/// `ln I0(kappa)` for the circular normalization constant, stable across the
/// whole kappa range (Abramowitz & Stegun 9.8.1 / 9.8.2).
fn log_bessel_i0(kappa: f64) -> f64 {
    let ax = kappa.abs();
    if ax < 3.75 {
        let t = (ax / 3.75).powi(2);
        let i0 = 1.0
            + t * (3.515_622_9
                + t * (3.089_942_4
                    + t * (1.206_749_2
                        + t * (0.265_973_2 + t * (0.036_076_8 + t * 0.004_581_3)))));
        i0.ln()
    } else {
        let t = 3.75 / ax;
        let poly = 0.398_942_28
            + t * (0.013_285_92
                + t * (0.002_253_19
                    + t * (-0.001_575_65
                        + t * (0.009_162_81
                            + t * (-0.020_577_06
                                + t * (0.026_355_37
                                    + t * (-0.016_476_33 + t * 0.003_923_77)))))));
        ax + poly.ln() - 0.5 * ax.ln()
    }
}

/// Log normalization constant of the density over the unit circle (dim 2) or
/// unit sphere (dim 3).
fn log_norm_constant(kappa: f64, dim: usize) -> f64 {
    match dim {
        2 => -(TAU.ln() + log_bessel_i0(kappa)),
        3 => {
            if kappa < 1e-8 {
                // kappa -> 0 limit is the uniform density 1 / 4pi.
                -(4.0 * PI).ln()
            } else {
                // ln( kappa / (4 pi sinh kappa) ) without evaluating sinh.
                let log_sinh = kappa + (-(-2.0 * kappa).exp()).ln_1p() - 2.0_f64.ln();
                kappa.ln() - (4.0 * PI).ln() - log_sinh
            }
        }
        other => panic!("unsupported dimensionality {other}"),
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Log-density of unit vector `x` under a von Mises(-Fisher) distribution with
/// mean direction `mu` and concentration `kappa`. `mu` and `x` must have the
/// same length (2 or 3).
pub fn log_density(mu: &[f64], kappa: f64, x: &[f64]) -> f64 {
    debug_assert_eq!(mu.len(), x.len());
    kappa * dot(mu, x) + log_norm_constant(kappa, mu.len())
}

/// Draws a unit vector from the distribution centered at `mu` with
/// concentration `kappa`.
pub fn sample<R: Rng + ?Sized>(rng: &mut R, mu: &[f64], kappa: f64) -> Vec<f64> {
    match mu.len() {
        2 => {
            let mean_angle = mu[1].atan2(mu[0]);
            let angle = sample_angle(rng, mean_angle, kappa);
            vec![angle.cos(), angle.sin()]
        }
        3 => sample_sphere(rng, mu, kappa),
        other => panic!("unsupported dimensionality {other}"),
    }
}

/// Best & Fisher rejection sampler with a wrapped-Cauchy envelope. Valid for
/// any non-negative kappa; kappa near zero degenerates to a uniform angle.
fn sample_angle<R: Rng + ?Sized>(rng: &mut R, mean: f64, kappa: f64) -> f64 {
    if kappa < 1e-8 {
        return rng.gen_range(-PI..PI) + mean;
    }
    let a = 1.0 + (1.0 + 4.0 * kappa * kappa).sqrt();
    let b = (a - (2.0 * a).sqrt()) / (2.0 * kappa);
    let r = (1.0 + b * b) / (2.0 * b);
    loop {
        let u1: f64 = rng.gen();
        let u2: f64 = rng.gen();
        let z = (PI * u1).cos();
        let f = (1.0 + r * z) / (r + z);
        let c = kappa * (r - f);
        if c * (2.0 - c) - u2 > 0.0 || (c / u2).ln() + 1.0 - c >= 0.0 {
            let sign = if rng.gen::<f64>() < 0.5 { -1.0 } else { 1.0 };
            return mean + sign * f.clamp(-1.0, 1.0).acos();
        }
    }
}

/// Von Mises-Fisher draw on the unit sphere via the exact inverse-CDF of the
/// cosine W against the mean direction, then a uniform tangent angle.
fn sample_sphere<R: Rng + ?Sized>(rng: &mut R, mu: &[f64], kappa: f64) -> Vec<f64> {
    let w = if kappa < 1e-8 {
        rng.gen_range(-1.0..1.0)
    } else {
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        // W = 1 + ln(u + (1 - u) e^{-2 kappa}) / kappa, numerically fine for
        // large kappa because the e^{-2 kappa} term vanishes.
        1.0 + (u + (1.0 - u) * (-2.0 * kappa).exp()).ln() / kappa
    };
    let w = w.clamp(-1.0, 1.0);
    let v = rng.gen_range(0.0..TAU);
    let s = (1.0 - w * w).sqrt();

    // Orthonormal basis of the tangent plane at mu.
    let pivot: [f64; 3] = if mu[2].abs() < 0.9 {
        [0.0, 0.0, 1.0]
    } else {
        [1.0, 0.0, 0.0]
    };
    let mut e1 = [
        pivot[1] * mu[2] - pivot[2] * mu[1],
        pivot[2] * mu[0] - pivot[0] * mu[2],
        pivot[0] * mu[1] - pivot[1] * mu[0],
    ];
    let norm = (e1[0] * e1[0] + e1[1] * e1[1] + e1[2] * e1[2]).sqrt();
    for c in &mut e1 {
        *c /= norm;
    }
    let e2 = [
        mu[1] * e1[2] - mu[2] * e1[1],
        mu[2] * e1[0] - mu[0] * e1[2],
        mu[0] * e1[1] - mu[1] * e1[0],
    ];

    (0..3)
        .map(|i| s * (v.cos() * e1[i] + v.sin() * e2[i]) + w * mu[i])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn normalize(v: &mut [f64]) {
        let norm = dot(v, v).sqrt();
        for c in v.iter_mut() {
            *c /= norm;
        }
    }

    #[test]
    fn circular_density_integrates_to_one() {
        for &kappa in &[1e-3, 1.0, 10.0, 100.0] {
            let mu = [1.0, 0.0];
            let steps = 20_000;
            let mut sum = 0.0;
            for i in 0..steps {
                let angle = TAU * i as f64 / steps as f64;
                let x = [angle.cos(), angle.sin()];
                sum += log_density(&mu, kappa, &x).exp();
            }
            let integral = sum * TAU / steps as f64;
            assert!(
                (integral - 1.0).abs() < 1e-2,
                "kappa {kappa}: integral {integral}"
            );
        }
    }

    #[test]
    fn spherical_density_integrates_to_one() {
        for &kappa in &[1e-3, 1.0, 10.0, 50.0] {
            let mu = [0.0, 0.0, 1.0];
            let n_polar = 400;
            let n_az = 200;
            let mut integral = 0.0;
            for i in 0..n_polar {
                let polar = PI * (i as f64 + 0.5) / n_polar as f64;
                for j in 0..n_az {
                    let az = TAU * j as f64 / n_az as f64;
                    let x = [polar.sin() * az.cos(), polar.sin() * az.sin(), polar.cos()];
                    integral += log_density(&mu, kappa, &x).exp()
                        * polar.sin()
                        * (PI / n_polar as f64)
                        * (TAU / n_az as f64);
                }
            }
            assert!(
                (integral - 1.0).abs() < 2e-2,
                "kappa {kappa}: integral {integral}"
            );
        }
    }

    #[test]
    fn concentrated_samples_cluster_around_mean() {
        let mut rng = StdRng::seed_from_u64(7);
        for mu in [vec![0.6, 0.8], vec![0.0, 0.6, 0.8]] {
            let mut mean = vec![0.0; mu.len()];
            for _ in 0..2000 {
                let x = sample(&mut rng, &mu, 100.0);
                let norm = dot(&x, &x).sqrt();
                assert!((norm - 1.0).abs() < 1e-9);
                for (m, c) in mean.iter_mut().zip(&x) {
                    *m += c;
                }
            }
            normalize(&mut mean);
            assert!(dot(&mean, &mu) > 0.99, "mean {mean:?} vs mu {mu:?}");
        }
    }

    #[test]
    fn tiny_kappa_samples_spread_out() {
        let mut rng = StdRng::seed_from_u64(11);
        let mu = [1.0, 0.0];
        let mut mean = [0.0, 0.0];
        for _ in 0..4000 {
            let x = sample(&mut rng, &mu, 1e-6);
            mean[0] += x[0];
            mean[1] += x[1];
        }
        let resultant = (mean[0] * mean[0] + mean[1] * mean[1]).sqrt() / 4000.0;
        assert!(resultant < 0.05, "resultant {resultant}");
    }
}
