// src/stft.rs

//! Windowed forward/inverse transform with overlap-add state carried across
//! calls. Analysis applies a periodic Hann window; with hop = window / 2 the
//! shifted windows sum to one, so an unmodified spectrum reconstructs the
//! input exactly after the initial `window - hop` transient.

use crate::error::{Result, TrackerError};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::TAU;
use std::sync::Arc;

pub struct StftPipeline {
    window_len: usize,
    hop_len: usize,
    channels: usize,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
    /// Most recent per-channel complex spectra, `window_len` bins each.
    spectra: Vec<Vec<Complex32>>,
    /// Per-channel overlap-add carry, `window_len - hop_len` samples each.
    tail: Vec<Vec<f32>>,
}

impl StftPipeline {
    pub fn new(window_len: usize, hop_len: usize, channels: usize) -> Result<Self> {
        if window_len == 0 || hop_len == 0 || channels == 0 {
            return Err(TrackerError::InvalidConfig(
                "window length, hop length and channel count must be positive".into(),
            ));
        }
        if hop_len > window_len {
            return Err(TrackerError::InvalidConfig(format!(
                "hop length {} exceeds window length {}",
                hop_len, window_len
            )));
        }
        if window_len % hop_len != 0 {
            return Err(TrackerError::InvalidConfig(format!(
                "window length {} is not a multiple of hop length {}",
                window_len, hop_len
            )));
        }
        let window: Vec<f32> = (0..window_len)
            .map(|n| 0.5 * (1.0 - (TAU * n as f32 / window_len as f32).cos()))
            .collect();
        // Constant-overlap-add check: windows shifted by the hop must sum to
        // the same constant at every sample offset.
        let shifts = window_len / hop_len;
        let ola_sum = |offset: usize| -> f32 {
            (0..shifts).map(|k| window[offset + k * hop_len]).sum()
        };
        let reference = ola_sum(0);
        for offset in 0..hop_len {
            if (ola_sum(offset) - reference).abs() > 1e-3 {
                return Err(TrackerError::InvalidConfig(format!(
                    "window/hop pair {}/{} does not satisfy constant overlap-add",
                    window_len, hop_len
                )));
            }
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window_len);
        let ifft = planner.plan_fft_inverse(window_len);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        Ok(Self {
            window_len,
            hop_len,
            channels,
            window,
            fft,
            ifft,
            scratch: vec![Complex32::default(); scratch_len],
            spectra: vec![vec![Complex32::default(); window_len]; channels],
            tail: vec![vec![0.0; window_len - hop_len]; channels],
        })
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn hop_len(&self) -> usize {
        self.hop_len
    }

    /// Transforms one interleaved frame of `window_len` samples per channel
    /// and stores the per-channel spectra. A length mismatch is a caller bug.
    pub fn forward(&mut self, frame: &[f32]) {
        assert_eq!(
            frame.len(),
            self.window_len * self.channels,
            "forward() expects exactly one window of samples per channel"
        );
        for ch in 0..self.channels {
            let spectrum = &mut self.spectra[ch];
            for n in 0..self.window_len {
                spectrum[n] = Complex32::new(frame[n * self.channels + ch] * self.window[n], 0.0);
            }
            self.fft.process_with_scratch(spectrum, &mut self.scratch);
        }
    }

    /// Read-only view of the most recent per-channel spectra.
    pub fn spectra(&self) -> &[Vec<Complex32>] {
        &self.spectra
    }

    /// Applies a per-bin transformation in place to every channel's stored
    /// spectrum before the next inverse transform.
    pub fn apply_spectral_hook<F>(&mut self, hook: F)
    where
        F: Fn(usize, &mut Complex32),
    {
        for spectrum in &mut self.spectra {
            for (bin, value) in spectrum.iter_mut().enumerate() {
                hook(bin, value);
            }
        }
    }

    /// Inverse-transforms the stored spectra, overlap-adds against the carried
    /// tail and emits exactly `hop_len` interleaved frames.
    pub fn inverse(&mut self) -> Vec<f32> {
        let l = self.window_len;
        let h = self.hop_len;
        let scale = 1.0 / l as f32;
        let mut out = vec![0.0; h * self.channels];
        let mut time = vec![Complex32::default(); l];
        for ch in 0..self.channels {
            time.copy_from_slice(&self.spectra[ch]);
            self.ifft.process_with_scratch(&mut time, &mut self.scratch);
            let tail = &mut self.tail[ch];
            let mut acc: Vec<f32> = time.iter().map(|c| c.re * scale).collect();
            for (n, carried) in tail.iter().enumerate() {
                acc[n] += carried;
            }
            for n in 0..h {
                out[n * self.channels + ch] = acc[n];
            }
            tail.copy_from_slice(&acc[h..]);
        }
        out
    }

    /// Spectral hook that zeroes every bin above `fft_len / 16`, mirroring the
    /// negative frequencies so the inverse transform stays real. Useful as a
    /// crude low-pass on the re-synthesized signal.
    pub fn low_pass_hook(fft_len: usize) -> impl Fn(usize, &mut Complex32) {
        let cutoff = fft_len / 16;
        move |bin, value| {
            let folded = bin.min(fft_len - bin);
            if folded > cutoff {
                *value = Complex32::default();
            }
        }
    }
}
