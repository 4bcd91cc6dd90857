//! Inference backend boundary
//!
//! The server treats the model executor as a black box: it hands over a
//! `[1, 28, 28, 1]` tensor of pixels and gets back one score per class.
//! Backends are single-threaded by contract (`&mut self`); concurrent
//! access is serialized by [`crate::gate::BackendGate`].

mod linear;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::protocol::{InferenceInput, CLASS_COUNT, DIGIT_LEN};

pub use linear::LinearModel;

/// One score per digit class.
pub type Scores = [f32; CLASS_COUNT];

/// Height/width of the input image.
pub const IMAGE_SIDE: usize = 28;

/// NHWC shape the backend consumes.
pub const INPUT_SHAPE: [usize; 4] = [1, IMAGE_SIDE, IMAGE_SIDE, 1];

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Backend produced non-finite score for class {0}")]
    NonFinite(usize),
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Model file not found: {0}")]
    NotFound(PathBuf),

    #[error("Corrupt model file: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pixels reshaped to `[1, 28, 28, 1]`.
///
/// Reshaping is a view over the same bytes: no sample is altered or
/// reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputTensor {
    data: [u8; DIGIT_LEN],
}

impl InputTensor {
    pub fn shape(&self) -> [usize; 4] {
        INPUT_SHAPE
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Element at batch `n`, row `y`, column `x`, channel `c`.
    pub fn at(&self, n: usize, y: usize, x: usize, c: usize) -> Option<u8> {
        let [batch, height, width, channels] = INPUT_SHAPE;
        if n >= batch || y >= height || x >= width || c >= channels {
            return None;
        }
        Some(self.data[((n * height + y) * width + x) * channels + c])
    }
}

impl From<InferenceInput> for InputTensor {
    fn from(input: InferenceInput) -> Self {
        Self { data: input.digit }
    }
}

/// A model executor that can run one inference at a time.
pub trait InferenceBackend: Send {
    fn infer(&mut self, input: &InputTensor) -> Result<Scores, InferenceError>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn infer(&mut self, input: &InputTensor) -> Result<Scores, InferenceError> {
        (**self).infer(input)
    }
}

/// Backends that can be constructed from a model file.
pub trait ModelLoader: Sized {
    fn load_model(path: &Path) -> Result<Self, ModelLoadError>;
}
