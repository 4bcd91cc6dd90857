//! Error types for the inference server

use std::time::Duration;

use thiserror::Error;

use crate::backend::{InferenceError, ModelLoadError};
use crate::framer::FrameError;
use crate::gate::GateError;
use crate::protocol::{Command, DecodeError};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Incomplete message: received {received} of {expected} bytes")]
    IncompleteMessage { received: usize, expected: usize },

    #[error("Connection timed out after receiving {received} bytes")]
    ConnectionTimeout { received: usize },

    #[error("Unsupported command: {0:?}")]
    UnsupportedCommand(Command),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Backend gate not acquired within {0:?}")]
    GateTimeout(Duration),

    #[error("Backend gate closed")]
    GateClosed,

    #[error("Model load error: {0}")]
    ModelLoad(#[from] ModelLoadError),

    #[error("Accept error: {0}")]
    Accept(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    /// Stable code used in logs and metrics
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Decode(_) => "DECODE_ERROR",
            ServerError::IncompleteMessage { .. } => "INCOMPLETE_MESSAGE",
            ServerError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            ServerError::UnsupportedCommand(_) => "UNSUPPORTED_COMMAND",
            ServerError::Inference(_) => "INFERENCE_ERROR",
            ServerError::GateTimeout(_) => "GATE_TIMEOUT",
            ServerError::GateClosed => "GATE_CLOSED",
            ServerError::ModelLoad(_) => "MODEL_LOAD_ERROR",
            ServerError::Accept(_) => "ACCEPT_ERROR",
            ServerError::Config(_) => "CONFIG_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl From<FrameError> for ServerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Incomplete { received, expected } => {
                ServerError::IncompleteMessage { received, expected }
            }
            FrameError::TimedOut { received } => ServerError::ConnectionTimeout { received },
            FrameError::Io(e) => ServerError::Io(e),
        }
    }
}

impl From<GateError> for ServerError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Timeout(waited) => ServerError::GateTimeout(waited),
            GateError::Inference(e) => ServerError::Inference(e),
            GateError::Closed => ServerError::GateClosed,
        }
    }
}
