// src/engine.rs

//! The processing thread: waits on captured audio, runs the STFT, estimates
//! and tracks the bearing, and optionally re-synthesizes the signal to the
//! output ring buffer. Owns all filter state; the only data shared with the
//! audio callbacks are the ring buffers and the cancellation token.

use crate::localizer::{Bearing, DirectionEstimator};
use crate::ring_buffer::RingBuffer;
use crate::settings::Config;
use crate::stft::StftPipeline;
use anyhow::Result;
use log::{debug, info, warn};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the processing loop sleeps on an empty input buffer before
/// re-checking the cancellation flag.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared stop flag handed to every execution context at construction.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Latest bearing estimate, for presentation layers outside the core.
pub type SharedBearing = Arc<Mutex<Option<Bearing>>>;

pub struct ProcessingEngine {
    config: Config,
    stft: StftPipeline,
    estimator: Box<dyn DirectionEstimator + Send>,
    in_buf: Arc<RingBuffer>,
    out_buf: Arc<RingBuffer>,
    cancel: CancellationToken,
    latest_bearing: SharedBearing,
}

impl ProcessingEngine {
    pub fn new(
        config: Config,
        estimator: Box<dyn DirectionEstimator + Send>,
        in_buf: Arc<RingBuffer>,
        out_buf: Arc<RingBuffer>,
        cancel: CancellationToken,
        latest_bearing: SharedBearing,
    ) -> Result<Self> {
        let stft = StftPipeline::new(config.fft_len, config.hop_len, config.channels_in)?;
        Ok(Self {
            config,
            stft,
            estimator,
            in_buf,
            out_buf,
            cancel,
            latest_bearing,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("processing".into())
            .spawn(move || self.run())
            .expect("failed to spawn processing thread")
    }

    fn run(mut self) {
        let window = self.config.fft_len;
        let hop = self.config.hop_len;
        let channels = self.config.channels_in;
        let overlap = window - hop;
        info!(
            "Processing loop started (window {} frames, hop {})",
            window, hop
        );
        // Sliding analysis window. The first wake fills it whole; afterwards
        // only `hop` new frames are consumed per cycle, so successive
        // forward/inverse calls line up with the overlap-add tail and the
        // output rate equals the input rate.
        let mut frame = vec![0.0f32; window * channels];
        let mut primed = false;
        while !self.cancel.is_cancelled() {
            let needed = if primed { hop } else { window };
            if !self.in_buf.wait_for_readable(needed, WAIT_TIMEOUT) {
                // Timeout without data is steady state, not an error.
                continue;
            }
            let read_result = if primed {
                frame.copy_within(hop * channels.., 0);
                self.in_buf.read_into(hop, &mut frame[overlap * channels..])
            } else {
                self.in_buf.read_into(window, &mut frame)
            };
            if let Err(err) = read_result {
                debug!("input buffer raced: {err}");
                continue;
            }
            primed = true;

            self.stft.forward(&frame);
            let bearing = self.estimator.estimate(self.stft.spectra());
            debug!(
                "bearing: azimuth {:.1} deg, elevation {:.1} deg, confidence {:.2}",
                bearing.azimuth_degrees(),
                bearing.elevation_degrees(),
                bearing.confidence
            );
            *self.latest_bearing.lock().unwrap() = Some(bearing);

            if self.config.playback {
                if self.config.low_pass {
                    self.stft
                        .apply_spectral_hook(StftPipeline::low_pass_hook(self.config.fft_len));
                }
                let synthesized = self.stft.inverse();
                let out = RingBuffer::downmix(
                    &synthesized,
                    self.config.channels_in,
                    self.config.channels_out,
                );
                let frames = out.len() / self.config.channels_out;
                // Skip-if-full rather than blocking on the render side: the
                // render callback zero-fills when it runs dry, so dropping a
                // hop here degrades to a moment of silence instead of
                // stalling the capture path.
                if self.out_buf.available_to_write() >= frames {
                    self.out_buf.write(&out);
                } else {
                    warn!("output buffer full, dropping {} frames", frames);
                }
            }
        }
        info!("Processing loop exiting");
    }
}

/// Console listener whose only job is to turn a `q` line into a cancellation.
pub fn spawn_quit_listener(cancel: CancellationToken) -> JoinHandle<()> {
    thread::Builder::new()
        .name("quit-listener".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) if line.trim() == "q" => {
                        info!("User has chosen to quit.");
                        cancel.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        })
        .expect("failed to spawn quit listener")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction_grid::DirectionGrid;
    use crate::localizer::EnergyDistributionEstimator;
    use crate::settings::AppSettings;

    #[test]
    fn cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn engine_processes_and_stops() {
        let mut settings = AppSettings::default();
        settings.fft_len = 256;
        settings.hop_len = 128;
        settings.playback = true;
        let config = crate::settings::Config::from_settings(&settings).unwrap();

        let in_buf = Arc::new(RingBuffer::new(config.buffer_capacity, config.channels_in));
        let out_buf = Arc::new(RingBuffer::new(config.buffer_capacity, config.channels_out));
        let cancel = CancellationToken::new();
        let latest: SharedBearing = Arc::new(Mutex::new(None));

        let grid = DirectionGrid::new(&config.mic_layout, config.n_theta, config.n_phi).unwrap();
        let estimator = EnergyDistributionEstimator::new(
            grid,
            config.fft_len,
            config.sample_rate as f32,
        )
        .unwrap();

        let engine = ProcessingEngine::new(
            config.clone(),
            Box::new(estimator),
            in_buf.clone(),
            out_buf.clone(),
            cancel.clone(),
            latest.clone(),
        )
        .unwrap();
        let handle = engine.spawn();

        // Feed a couple of windows of a test tone.
        let samples: Vec<f32> = (0..config.fft_len * 3 * config.channels_in)
            .map(|i| (0.05 * (i / config.channels_in) as f32).sin())
            .collect();
        in_buf.write(&samples);

        assert!(out_buf.wait_for_readable(config.hop_len, Duration::from_secs(5)));
        assert!(latest.lock().unwrap().is_some());

        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn playback_output_matches_input_stream() {
        let mut settings = AppSettings::default();
        settings.fft_len = 256;
        settings.hop_len = 128;
        // Room for the whole fixture so nothing is dropped mid-test.
        settings.buffer_windows = 16;
        let config = crate::settings::Config::from_settings(&settings).unwrap();

        let in_buf = Arc::new(RingBuffer::new(config.buffer_capacity, config.channels_in));
        let out_buf = Arc::new(RingBuffer::new(config.buffer_capacity, config.channels_out));
        let cancel = CancellationToken::new();
        let latest: SharedBearing = Arc::new(Mutex::new(None));

        let grid = DirectionGrid::new(&config.mic_layout, config.n_theta, config.n_phi).unwrap();
        let estimator = EnergyDistributionEstimator::new(
            grid,
            config.fft_len,
            config.sample_rate as f32,
        )
        .unwrap();
        let engine = ProcessingEngine::new(
            config.clone(),
            Box::new(estimator),
            in_buf.clone(),
            out_buf.clone(),
            cancel.clone(),
            latest,
        )
        .unwrap();
        let handle = engine.spawn();

        // A 440 Hz tone on both capture channels.
        let total = config.fft_len * 6;
        let input: Vec<f32> = (0..total * config.channels_in)
            .map(|i| {
                let n = i / config.channels_in;
                (std::f32::consts::TAU * 440.0 * n as f32 / config.sample_rate as f32).sin()
            })
            .collect();
        assert_eq!(in_buf.write(&input), total);

        // One window primes the pipeline, every following hop is emitted, so
        // the output runs at the input rate minus one overlap of latency.
        let expected = total - (config.fft_len - config.hop_len);
        assert!(
            out_buf.wait_for_readable(expected, Duration::from_secs(10)),
            "engine produced fewer frames than it consumed"
        );
        cancel.cancel();
        handle.join().unwrap();

        let output = out_buf.read(expected).unwrap();
        // Skip the first emitted hop (single-window transient), then the
        // re-synthesized stream must match the input sample for sample.
        let settle = config.hop_len;
        for n in settle..expected {
            for ch in 0..config.channels_out {
                let got = output[n * config.channels_out + ch];
                let want = input[n * config.channels_in + ch];
                assert!(
                    (got - want).abs() < 1e-3,
                    "frame {} ch {} diverged: {} vs {}",
                    n,
                    ch,
                    got,
                    want
                );
            }
        }
    }
}
