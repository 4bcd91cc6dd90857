//! Dense softmax classifier backend.
//!
//! # File Layout
//!
//! ```text
//! Offset  Size        Field
//! 0       4           magic: b"MNLM"
//! 4       4           version: u32 = 1
//! 8       4           inputs: u32 = 784
//! 12      4           classes: u32 = 10
//! 16      7840 * 4    weights: f32, row-major [class][input]
//! 31376   10 * 4      biases: f32
//! ```
//!
//! All values little-endian.

use std::io::Write;
use std::path::Path;

use tracing::info;

use super::{InferenceBackend, InferenceError, InputTensor, ModelLoadError, ModelLoader, Scores};
use crate::protocol::{CLASS_COUNT, DIGIT_LEN};

/// Magic bytes for model files.
pub const MODEL_MAGIC: [u8; 4] = *b"MNLM";

/// Model file format version.
pub const MODEL_VERSION: u32 = 1;

const HEADER_LEN: usize = 16;
const WEIGHT_COUNT: usize = DIGIT_LEN * CLASS_COUNT;
const MODEL_FILE_LEN: usize = HEADER_LEN + (WEIGHT_COUNT + CLASS_COUNT) * 4;

/// Single dense layer followed by softmax.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Vec<f32>,
    biases: Scores,
    fingerprint: String,
}

fn read_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_f32_at(data: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32_at(data, offset))
}

impl LinearModel {
    /// Build from raw parameters. `weights` is row-major `[class][input]`.
    pub fn new(weights: Vec<f32>, biases: Scores) -> Result<Self, ModelLoadError> {
        if weights.len() != WEIGHT_COUNT {
            return Err(ModelLoadError::Corrupt(format!(
                "expected {} weights, got {}",
                WEIGHT_COUNT,
                weights.len()
            )));
        }
        if let Some(i) = weights.iter().chain(biases.iter()).position(|w| !w.is_finite()) {
            return Err(ModelLoadError::Corrupt(format!("non-finite parameter at index {}", i)));
        }
        let mut model = Self { weights, biases, fingerprint: String::new() };
        model.fingerprint = blake3::hash(&model.to_bytes()).to_hex().to_string();
        Ok(model)
    }

    /// Parse the on-disk format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelLoadError> {
        if bytes.len() < HEADER_LEN {
            return Err(ModelLoadError::Corrupt(format!(
                "file too small for header: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..4] != MODEL_MAGIC {
            return Err(ModelLoadError::Corrupt(format!(
                "not a model file: expected MNLM, got {:?}",
                &bytes[0..4]
            )));
        }
        let version = read_u32_at(bytes, 4);
        if version != MODEL_VERSION {
            return Err(ModelLoadError::Corrupt(format!("unsupported model version: {}", version)));
        }
        let inputs = read_u32_at(bytes, 8) as usize;
        let classes = read_u32_at(bytes, 12) as usize;
        if inputs != DIGIT_LEN || classes != CLASS_COUNT {
            return Err(ModelLoadError::Corrupt(format!(
                "model shape {}x{} does not match {}x{}",
                inputs, classes, DIGIT_LEN, CLASS_COUNT
            )));
        }
        if bytes.len() != MODEL_FILE_LEN {
            return Err(ModelLoadError::Corrupt(format!(
                "expected {} bytes, got {}",
                MODEL_FILE_LEN,
                bytes.len()
            )));
        }

        let weights = (0..WEIGHT_COUNT)
            .map(|i| read_f32_at(bytes, HEADER_LEN + i * 4))
            .collect();
        let mut biases = [0f32; CLASS_COUNT];
        let bias_start = HEADER_LEN + WEIGHT_COUNT * 4;
        for (c, b) in biases.iter_mut().enumerate() {
            *b = read_f32_at(bytes, bias_start + c * 4);
        }
        Self::new(weights, biases)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MODEL_FILE_LEN);
        out.extend_from_slice(&MODEL_MAGIC);
        out.extend_from_slice(&MODEL_VERSION.to_le_bytes());
        out.extend_from_slice(&(DIGIT_LEN as u32).to_le_bytes());
        out.extend_from_slice(&(CLASS_COUNT as u32).to_le_bytes());
        for w in self.weights.iter().chain(self.biases.iter()) {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelLoadError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// BLAKE3 hex digest of the serialized parameters.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl ModelLoader for LinearModel {
    fn load_model(path: &Path) -> Result<Self, ModelLoadError> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ModelLoadError::NotFound(path.to_path_buf()),
            _ => ModelLoadError::Io(e),
        })?;
        let model = Self::from_bytes(&bytes)?;
        info!(
            path = %path.display(),
            fingerprint = &model.fingerprint[..16],
            "Loaded linear model"
        );
        Ok(model)
    }
}

impl InferenceBackend for LinearModel {
    fn infer(&mut self, input: &InputTensor) -> Result<Scores, InferenceError> {
        let pixels = input.as_slice();
        let mut logits = self.biases;
        for (c, logit) in logits.iter_mut().enumerate() {
            let row = &self.weights[c * DIGIT_LEN..(c + 1) * DIGIT_LEN];
            *logit += row
                .iter()
                .zip(pixels)
                .map(|(w, &px)| w * (px as f32 / 255.0))
                .sum::<f32>();
        }

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0;
        for logit in logits.iter_mut() {
            *logit = (*logit - max).exp();
            total += *logit;
        }
        for (c, score) in logits.iter_mut().enumerate() {
            *score /= total;
            if !score.is_finite() {
                return Err(InferenceError::NonFinite(c));
            }
        }
        Ok(logits)
    }
}
