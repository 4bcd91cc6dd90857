//! mnistd - single-backend digit inference server
//!
//! Accepts TCP connections carrying one MnistProt `INFERENCE_INPUT`
//! envelope each, runs the digit through the backend under an exclusive
//! gate, and answers with one `INFERENCE_OUTPUT` envelope.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod framer;
pub mod gate;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;

pub use backend::{InferenceBackend, InputTensor, LinearModel, ModelLoader, Scores};
pub use client::{ClientError, InferenceClient, InferenceReply};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use gate::{BackendGate, Prediction};
pub use handler::{Connection, ConnectionHandler, ConnectionOutcome, ConnectionState};
pub use protocol::{Envelope, InferenceInput, InferenceOutput};
pub use server::{Server, ShutdownHandle};
