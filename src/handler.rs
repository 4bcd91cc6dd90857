//! Per-connection request handling
//!
//! One connection carries exactly one request. The handler walks it
//! through an explicit state machine:
//!
//! ```text
//! AwaitingMessage -> Decoding -> Dispatching -> Encoding -> Sending -> Closed
//!        |              |            |                         |
//!        +--------------+------------+-------------------------+--> Failed -> Closed
//! ```
//!
//! Every path ends in `Closed`, and reaching `Closed` always closes the
//! transport. Failures close the connection without writing a response.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{InferenceBackend, InputTensor};
use crate::error::ServerError;
use crate::framer::{read_frame, write_frame};
use crate::gate::{BackendGate, Prediction};
use crate::metrics::Metrics;
use crate::protocol::{argmax, Envelope, InferenceOutput, REQUEST_FRAME_LEN};
use crate::session::ConnectionSession;

/// A bidirectional byte stream the handler can explicitly close.
pub trait Connection: Read + Write {
    fn close(&mut self) -> io::Result<()>;
}

impl Connection for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionOutcome {
    /// Response written.
    Served {
        handler_ms: f64,
        inference_ms: f32,
        predicted: usize,
    },
    /// Closed without a response; `code` is `ServerError::code()`.
    Rejected { code: &'static str },
}

#[derive(Debug)]
pub enum ConnectionState {
    AwaitingMessage,
    Decoding(Vec<u8>),
    Dispatching(InputTensor),
    Encoding(Prediction),
    Sending { frame: Vec<u8>, prediction: Prediction },
    Failed(ServerError),
    Closed(ConnectionOutcome),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingMessage => "AWAITING_MESSAGE",
            ConnectionState::Decoding(_) => "DECODING",
            ConnectionState::Dispatching(_) => "DISPATCHING",
            ConnectionState::Encoding(_) => "ENCODING",
            ConnectionState::Sending { .. } => "SENDING",
            ConnectionState::Failed(_) => "ERROR",
            ConnectionState::Closed(_) => "CLOSED",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

pub struct ConnectionHandler<B> {
    gate: Arc<BackendGate<B>>,
    metrics: Option<Arc<Metrics>>,
    session: ConnectionSession,
}

impl<B: InferenceBackend> ConnectionHandler<B> {
    pub fn new(
        gate: Arc<BackendGate<B>>,
        metrics: Option<Arc<Metrics>>,
        session: ConnectionSession,
    ) -> Self {
        Self { gate, metrics, session }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Drive the connection from `AwaitingMessage` to `Closed`.
    pub fn run<C: Connection>(mut self, conn: &mut C) -> ConnectionOutcome {
        let mut state = ConnectionState::AwaitingMessage;
        loop {
            state = self.step(state, conn);
            if let ConnectionState::Closed(outcome) = state {
                self.record(&outcome);
                return outcome;
            }
        }
    }

    /// Perform exactly one transition.
    pub fn step<C: Connection>(&mut self, state: ConnectionState, conn: &mut C) -> ConnectionState {
        let id = self.session.id;
        let from = state.name();

        let next = match state {
            ConnectionState::AwaitingMessage => match read_frame(conn, REQUEST_FRAME_LEN) {
                Ok(frame) => {
                    self.session.bytes_received = frame.len();
                    ConnectionState::Decoding(frame)
                }
                Err(e) => ConnectionState::Failed(e.into()),
            },

            ConnectionState::Decoding(frame) => match Envelope::decode(&frame) {
                Ok(Envelope::InferenceInput(input)) => {
                    ConnectionState::Dispatching(InputTensor::from(input))
                }
                Ok(other) => ConnectionState::Failed(ServerError::UnsupportedCommand(other.command())),
                Err(e) => ConnectionState::Failed(e.into()),
            },

            ConnectionState::Dispatching(tensor) => match self.gate.invoke(&tensor) {
                Ok(prediction) => ConnectionState::Encoding(prediction),
                Err(e) => ConnectionState::Failed(e.into()),
            },

            ConnectionState::Encoding(prediction) => {
                let reply = Envelope::InferenceOutput(InferenceOutput {
                    scores: prediction.scores,
                    timer_ms: prediction.elapsed_ms,
                });
                ConnectionState::Sending { frame: reply.encode(), prediction }
            }

            ConnectionState::Sending { frame, prediction } => match write_frame(conn, &frame) {
                Ok(()) => {
                    self.session.bytes_sent = frame.len();
                    self.close(conn);
                    let predicted = argmax(&prediction.scores);
                    let handler_ms = self.session.elapsed_ms();
                    info!(
                        conn = id,
                        handler_ms,
                        inference_ms = prediction.elapsed_ms,
                        predicted,
                        "Inference served"
                    );
                    debug!(conn = id, scores = ?prediction.scores, "Prediction results");
                    ConnectionState::Closed(ConnectionOutcome::Served {
                        handler_ms,
                        inference_ms: prediction.elapsed_ms,
                        predicted,
                    })
                }
                Err(e) => ConnectionState::Failed(e.into()),
            },

            ConnectionState::Failed(err) => {
                let code = err.code();
                match &err {
                    ServerError::IncompleteMessage { received: 0, .. } => {
                        debug!(conn = id, "Client disconnected before sending a request");
                    }
                    _ => {
                        warn!(
                            conn = id,
                            peer = %self.session.peer_label(),
                            code,
                            error = %err,
                            "Closing connection without response"
                        );
                    }
                }
                self.close(conn);
                ConnectionState::Closed(ConnectionOutcome::Rejected { code })
            }

            closed @ ConnectionState::Closed(_) => closed,
        };

        debug!(conn = id, from, to = next.name(), "Connection state transition");
        next
    }

    fn close<C: Connection>(&self, conn: &mut C) {
        if let Err(e) = conn.close() {
            // Peer may already be gone.
            debug!(conn = self.session.id, error = %e, "Close failed");
        }
    }

    fn record(&self, outcome: &ConnectionOutcome) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match outcome {
            ConnectionOutcome::Served { handler_ms, inference_ms, .. } => {
                metrics.record_served(
                    (handler_ms * 1000.0) as u64,
                    (*inference_ms as f64 * 1000.0) as u64,
                );
            }
            ConnectionOutcome::Rejected { code } => metrics.record_rejected(code),
        }
    }
}
