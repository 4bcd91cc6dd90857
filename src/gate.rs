//! BackendGate - exclusive access to the single inference backend
//!
//! The backend instance lives in a one-slot channel. Acquiring the gate
//! takes the instance out of the slot; the returned [`GatePermit`] puts it
//! back when dropped. At most one caller can hold the backend at any
//! instant, and release happens on every exit path (success, error,
//! early return, or unwinding panic) because it is tied to `Drop`.
//!
//! This is a mutual-exclusion section, not a fair queue: waiters are
//! served in whatever order the channel wakes them.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::{InferenceBackend, InferenceError, InputTensor, Scores};

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Gate not acquired within {0:?}")]
    Timeout(Duration),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Gate closed")]
    Closed,
}

/// Backend result plus the time spent inside the backend call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub scores: Scores,
    pub elapsed_ms: f32,
}

/// Serializes all calls into one backend instance.
///
/// Shared between connection handlers as `Arc<BackendGate<B>>`.
#[derive(Debug)]
pub struct BackendGate<B> {
    slot_tx: Sender<B>,
    slot_rx: Receiver<B>,
    acquire_timeout: Duration,
    invocations: AtomicU64,
    failures: AtomicU64,
}

/// Exclusive hold on the backend. Dropping it releases the gate.
#[derive(Debug)]
pub struct GatePermit<'a, B> {
    backend: Option<B>,
    home: &'a Sender<B>,
}

impl<B> Deref for GatePermit<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        // Only `Drop` takes the backend out.
        self.backend.as_ref().unwrap_or_else(|| unreachable!("permit already released"))
    }
}

impl<B> DerefMut for GatePermit<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.backend.as_mut().unwrap_or_else(|| unreachable!("permit already released"))
    }
}

impl<B> Drop for GatePermit<'_, B> {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            // The slot has capacity 1 and this permit holds the only
            // instance, so the send cannot block; it can only fail if the
            // gate itself is gone.
            if self.home.try_send(backend).is_err() {
                warn!("Backend gate dropped while a permit was outstanding");
            }
        }
    }
}

impl<B: InferenceBackend> BackendGate<B> {
    pub fn new(backend: B, acquire_timeout: Duration) -> Self {
        let (slot_tx, slot_rx) = bounded(1);
        let seeded = slot_tx.try_send(backend).is_ok();
        debug_assert!(seeded, "fresh gate slot must accept the backend");
        Self {
            slot_tx,
            slot_rx,
            acquire_timeout,
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Wait up to the configured timeout for exclusive access.
    pub fn acquire(&self) -> Result<GatePermit<'_, B>, GateError> {
        match self.slot_rx.recv_timeout(self.acquire_timeout) {
            Ok(backend) => Ok(GatePermit { backend: Some(backend), home: &self.slot_tx }),
            Err(RecvTimeoutError::Timeout) => Err(GateError::Timeout(self.acquire_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(GateError::Closed),
        }
    }

    /// Run one inference under the gate.
    ///
    /// The gate is held only for the backend call and released before the
    /// result is returned, whatever the outcome.
    pub fn invoke(&self, input: &InputTensor) -> Result<Prediction, GateError> {
        let wait_start = Instant::now();
        let result = {
            let mut permit = self.acquire()?;
            debug!(waited_us = wait_start.elapsed().as_micros() as u64, "Backend gate acquired");
            self.invocations.fetch_add(1, Ordering::Relaxed);

            let started = Instant::now();
            let scores = permit.infer(input);
            let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
            scores.map(|scores| Prediction { scores, elapsed_ms })
            // permit dropped here
        };

        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result?)
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
