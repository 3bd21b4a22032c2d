// src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("insufficient data: requested {requested} frames, only {available} available")]
    InsufficientData { requested: usize, available: usize },
    #[error("degenerate particle weights (sum = {sum})")]
    DegenerateWeights { sum: f64 },
}

pub type Result<T> = std::result::Result<T, TrackerError>;
