// src/settings.rs

use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// On-disk settings; every field has a default so partial files load fine.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AppSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub fft_len: usize,
    pub hop_len: usize,
    pub channels_in: usize,
    pub channels_out: usize,
    /// Microphone coordinates in meters, one `[x, y, z]` per capture channel.
    pub mic_layout: Vec<[f32; 3]>,
    pub n_theta: usize,
    pub n_phi: usize,
    pub n_particles: usize,
    pub state_kappa: f64,
    pub observation_kappa: f64,
    pub outlier_prob: f64,
    pub resample_interval: usize,
    /// Re-synthesize the (optionally filtered) input to the output stream.
    pub playback: bool,
    /// Apply the demo low-pass spectral hook before re-synthesis.
    pub low_pass: bool,
    /// Ring buffers hold this many windows of audio.
    pub buffer_windows: usize,
}

/// Seven-microphone array used for development: one mic raised on the z axis,
/// six on a horizontal ring.
fn default_mic_layout() -> Vec<[f32; 3]> {
    let r = 0.0375f32;
    let h = 0.07f32;
    let c60 = (std::f32::consts::PI / 3.0).cos();
    let s60 = (std::f32::consts::PI / 3.0).sin();
    vec![
        [0.0, 0.0, h],
        [r, 0.0, 0.0],
        [r * c60, r * s60, 0.0],
        [-r * c60, r * s60, 0.0],
        [-r, 0.0, 0.0],
        [-r * c60, -r * s60, 0.0],
        [r * c60, -r * s60, 0.0],
    ]
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: 16_000,
            fft_len: 1024,
            hop_len: 512,
            channels_in: 2,
            channels_out: 2,
            mic_layout: default_mic_layout(),
            n_theta: 20,
            n_phi: 1,
            n_particles: 100,
            state_kappa: 25.0,
            observation_kappa: 8.0,
            outlier_prob: 0.1,
            resample_interval: 1,
            playback: true,
            low_pass: false,
            buffer_windows: 4,
        }
    }
}

/// Immutable, validated runtime configuration. There is no runtime
/// reconfiguration; anything invalid is rejected here, never clamped.
#[derive(Debug, Clone)]
pub struct Config {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub fft_len: usize,
    pub hop_len: usize,
    pub channels_in: usize,
    pub channels_out: usize,
    pub mic_layout: Vec<[f32; 3]>,
    pub n_theta: usize,
    pub n_phi: usize,
    pub n_particles: usize,
    pub state_kappa: f64,
    pub observation_kappa: f64,
    pub outlier_prob: f64,
    pub resample_interval: usize,
    pub playback: bool,
    pub low_pass: bool,
    pub buffer_capacity: usize,
}

impl Config {
    pub fn from_settings(settings: &AppSettings) -> Result<Self> {
        if settings.sample_rate == 0 {
            return Err(TrackerError::InvalidConfig(
                "sample rate must be positive".into(),
            ));
        }
        if settings.channels_in == 0 || settings.channels_out == 0 {
            return Err(TrackerError::InvalidConfig(
                "channel counts must be positive".into(),
            ));
        }
        if settings.hop_len > settings.fft_len {
            return Err(TrackerError::InvalidConfig(format!(
                "hop length {} exceeds window length {}",
                settings.hop_len, settings.fft_len
            )));
        }
        if settings.channels_in % settings.channels_out != 0 {
            return Err(TrackerError::InvalidConfig(format!(
                "cannot downmix {} capture channels to {} output channels",
                settings.channels_in, settings.channels_out
            )));
        }
        if settings.mic_layout.len() < settings.channels_in {
            return Err(TrackerError::InvalidConfig(format!(
                "{} capture channels but only {} microphone positions",
                settings.channels_in,
                settings.mic_layout.len()
            )));
        }
        if !(0.0..=1.0).contains(&settings.outlier_prob) {
            return Err(TrackerError::InvalidConfig(format!(
                "outlier probability {} must be within [0, 1]",
                settings.outlier_prob
            )));
        }
        if settings.n_particles < 1 {
            return Err(TrackerError::InvalidConfig(
                "particle count must be at least 1".into(),
            ));
        }
        if settings.buffer_windows < 1 {
            return Err(TrackerError::InvalidConfig(
                "buffer size must be at least one window".into(),
            ));
        }
        Ok(Self {
            input_device: settings.input_device.clone(),
            output_device: settings.output_device.clone(),
            sample_rate: settings.sample_rate,
            fft_len: settings.fft_len,
            hop_len: settings.hop_len,
            channels_in: settings.channels_in,
            channels_out: settings.channels_out,
            // Only the mics that actually have a capture channel matter.
            mic_layout: settings.mic_layout[..settings.channels_in].to_vec(),
            n_theta: settings.n_theta,
            n_phi: settings.n_phi,
            n_particles: settings.n_particles,
            state_kappa: settings.state_kappa,
            observation_kappa: settings.observation_kappa,
            outlier_prob: settings.outlier_prob,
            resample_interval: settings.resample_interval,
            playback: settings.playback,
            low_pass: settings.low_pass,
            buffer_capacity: settings.buffer_windows * settings.fft_len,
        })
    }

    /// 2 for a planar grid, 3 for a spherical one.
    pub fn tracker_dimensions(&self) -> usize {
        if self.n_phi == 1 {
            2
        } else {
            3
        }
    }
}

pub fn get_config_path() -> Option<PathBuf> {
    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            return Some(exe_dir.join("settings.json"));
        }
    }
    eprintln!("Could not determine application directory.");
    None
}

pub fn save_settings(settings: &AppSettings) {
    if let Some(path) = get_config_path() {
        match serde_json::to_string_pretty(settings) {
            Ok(json_string) => {
                if let Err(e) = fs::write(&path, json_string) {
                    eprintln!("Failed to write settings to {}: {}", path.display(), e);
                }
            }
            Err(e) => {
                eprintln!("Failed to serialize settings: {}", e);
            }
        }
    }
}

pub fn load_settings() -> AppSettings {
    if let Some(path) = get_config_path() {
        if path.exists() {
            return match fs::read_to_string(&path) {
                Ok(json_string) => match serde_json::from_str(&json_string) {
                    Ok(settings) => settings,
                    Err(e) => {
                        eprintln!("Failed to parse settings file, using defaults. Error: {}", e);
                        AppSettings::default()
                    }
                },
                Err(e) => {
                    eprintln!("Failed to read settings file, using defaults. Error: {}", e);
                    AppSettings::default()
                }
            };
        }
    }
    AppSettings::default()
}
