// src/main.rs

mod audio_io;
mod direction_grid;
mod engine;
mod error;
mod localizer;
mod ring_buffer;
mod settings;
mod stft;
mod tracker;
mod von_mises;

use crate::direction_grid::DirectionGrid;
use crate::engine::{CancellationToken, ProcessingEngine, SharedBearing};
use crate::localizer::EnergyDistributionEstimator;
use crate::ring_buffer::RingBuffer;
use crate::settings::Config;
use crate::tracker::{TrackerParams, TrackingDirectionEstimator};
use cpal::traits::StreamTrait;
use log::{info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app_settings = settings::load_settings();
    let config = Config::from_settings(&app_settings)?;

    let in_buf = Arc::new(RingBuffer::new(config.buffer_capacity, config.channels_in));
    let out_buf = Arc::new(RingBuffer::new(config.buffer_capacity, config.channels_out));
    let cancel = CancellationToken::new();
    let latest_bearing: SharedBearing = Arc::new(Mutex::new(None));
    let xrun_count = Arc::new(AtomicUsize::new(0));

    let grid = DirectionGrid::new(&config.mic_layout, config.n_theta, config.n_phi)?;
    let distribution_estimator =
        EnergyDistributionEstimator::new(grid, config.fft_len, config.sample_rate as f32)?;
    let estimator = TrackingDirectionEstimator::new(
        distribution_estimator,
        TrackerParams {
            n_particles: config.n_particles,
            state_kappa: config.state_kappa,
            observation_kappa: config.observation_kappa,
            outlier_prob: config.outlier_prob,
            resample_interval: config.resample_interval,
            dimensions: config.tracker_dimensions(),
        },
    )?;

    let (input_stream, output_stream) = audio_io::init_and_run_streams(
        &config,
        in_buf.clone(),
        out_buf.clone(),
        cancel.clone(),
        xrun_count.clone(),
    )?;

    let engine = ProcessingEngine::new(
        config,
        Box::new(estimator),
        in_buf,
        out_buf,
        cancel.clone(),
        latest_bearing,
    )?;
    let processing_handle = engine.spawn();
    engine::spawn_quit_listener(cancel.clone());
    info!("Tracking started. Press q then Enter to quit.");

    // The processing thread exits once the token is set.
    if processing_handle.join().is_err() {
        warn!("Processing thread panicked");
    }

    // Two-phase shutdown: the flag is already set, so the callbacks are
    // already draining; now stop the streams before the buffers go away.
    cancel.cancel();
    if let Err(e) = input_stream.pause() {
        warn!("Failed to pause input stream: {e}");
    }
    if let Err(e) = output_stream.pause() {
        warn!("Failed to pause output stream: {e}");
    }
    drop(input_stream);
    drop(output_stream);

    let xruns = xrun_count.load(Ordering::Relaxed);
    if xruns > 0 {
        warn!("{xruns} stream errors were reported during the session");
    }
    settings::save_settings(&app_settings);
    info!("Done");
    Ok(())
}
