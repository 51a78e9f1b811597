//! Error types for the rover.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoverError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config: {0}")]
    Config(String),

    #[error("Serial: {0}")]
    Serial(String),

    #[error("NTRIP handshake: {0}")]
    Handshake(String),

    #[error("NTRIP stream: {0}")]
    Stream(String),

    #[error("Mount point selection: {0}")]
    AutoSelect(String),
}

pub type Result<T> = std::result::Result<T, RoverError>;
