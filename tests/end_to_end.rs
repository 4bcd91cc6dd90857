//! Integration test: full request/response cycles over real TCP sockets.
//!
//! Validates that:
//! - A well-formed request gets exactly one 96-byte reply, then close
//! - Malformed, unknown-tag and short requests are closed without a reply
//! - Concurrent clients each get the reply for their own digit
//! - Shutdown waits for in-flight connections

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mnistd::backend::{InferenceError, LinearModel, ModelLoader};
use mnistd::protocol::{CLASS_COUNT, DIGIT_LEN, REQUEST_FRAME_LEN, RESPONSE_FRAME_LEN};
use mnistd::{
    BackendGate, Envelope, InferenceBackend, InferenceClient, InferenceInput,
    InputTensor, Scores, Server, ServerConfig, ShutdownHandle,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TIMEOUT: Duration = Duration::from_secs(5);

/// Scores depend on the first pixel: class `px % 10` wins.
struct FirstPixel;

impl InferenceBackend for FirstPixel {
    fn infer(&mut self, input: &InputTensor) -> Result<Scores, InferenceError> {
        let mut scores = [0.0; CLASS_COUNT];
        scores[input.as_slice()[0] as usize % CLASS_COUNT] = 1.0;
        thread::sleep(Duration::from_millis(5));
        Ok(scores)
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: JoinHandle<mnistd::Result<()>>,
}

impl Running {
    fn stop(self) {
        self.shutdown.trigger();
        self.thread.join().unwrap().unwrap();
    }
}

fn start<B: InferenceBackend + 'static>(backend: B) -> Running {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        read_timeout_ms: 2_000,
        write_timeout_ms: 2_000,
        ..Default::default()
    };
    let gate = Arc::new(BackendGate::new(backend, config.gate_timeout()));
    let server = Server::bind(&config, gate).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let thread = thread::spawn(move || server.run());
    Running { addr, shutdown, thread }
}

fn zero_model() -> LinearModel {
    LinearModel::new(vec![0.0; DIGIT_LEN * CLASS_COUNT], [0.0; CLASS_COUNT]).unwrap()
}

fn digit_with_first(px: u8) -> [u8; DIGIT_LEN] {
    let mut digit = [0u8; DIGIT_LEN];
    digit[0] = px;
    digit
}

/// Write `bytes`, half-close, and collect whatever comes back.
fn send_and_drain(addr: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect_timeout(&addr, TIMEOUT).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(bytes).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    reply
}

// ---------------------------------------------------------------------------
// Tests: Request Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn zero_digit_gets_uniform_scores() {
    let server = start(zero_model());

    let reply = InferenceClient::connect(server.addr, TIMEOUT)
        .unwrap()
        .infer(&[0; DIGIT_LEN])
        .unwrap();

    assert_eq!(reply.scores, [0.1; CLASS_COUNT]);
    assert!(reply.timer_ms >= 0.0);

    server.stop();
}

#[test]
fn reply_is_exactly_one_frame_then_close() {
    let server = start(zero_model());

    let request = Envelope::InferenceInput(InferenceInput::new([0; DIGIT_LEN])).encode();
    assert_eq!(request.len(), REQUEST_FRAME_LEN);
    let reply = send_and_drain(server.addr, &request);

    assert_eq!(reply.len(), RESPONSE_FRAME_LEN);
    assert!(matches!(Envelope::decode(&reply), Ok(Envelope::InferenceOutput(_))));

    server.stop();
}

#[test]
fn unknown_tag_closes_without_reply() {
    let server = start(zero_model());

    let mut request = Envelope::InferenceInput(InferenceInput::new([0; DIGIT_LEN])).encode();
    // cmd byte of the Commands table
    request[25] = 9;
    let reply = send_and_drain(server.addr, &request);
    assert!(reply.is_empty());

    server.stop();
}

#[test]
fn short_request_closes_without_hanging() {
    let server = start(zero_model());

    let request = Envelope::InferenceInput(InferenceInput::new([0; DIGIT_LEN])).encode();
    let start = Instant::now();
    let reply = send_and_drain(server.addr, &request[..1000]);

    assert!(reply.is_empty());
    assert!(start.elapsed() < TIMEOUT);

    server.stop();
}

#[test]
fn out_of_range_sample_is_rejected() {
    let server = start(zero_model());

    let request = Envelope::InferenceInput(InferenceInput::new([0; DIGIT_LEN])).encode();
    // First sample follows the vector's length prefix.
    let len_pos = request
        .windows(4)
        .position(|w| w == (DIGIT_LEN as u32).to_le_bytes())
        .unwrap();
    let mut bad = request.clone();
    bad[len_pos + 4..len_pos + 8].copy_from_slice(&300.0f32.to_le_bytes());

    assert!(send_and_drain(server.addr, &bad).is_empty());

    server.stop();
}

#[test]
fn server_keeps_serving_after_rejection() {
    let server = start(zero_model());

    let mut request = Envelope::InferenceInput(InferenceInput::new([0; DIGIT_LEN])).encode();
    request[25] = 200;
    let client = InferenceClient::connect(server.addr, TIMEOUT).unwrap();
    assert!(client.send_raw(&request).unwrap().is_empty());

    // A valid client request afterwards is still served.
    let reply = InferenceClient::connect(server.addr, TIMEOUT).unwrap().infer(&[0; DIGIT_LEN]);
    assert!(reply.is_ok());

    server.stop();
}

// ---------------------------------------------------------------------------
// Tests: Concurrency
// ---------------------------------------------------------------------------

#[test]
fn simultaneous_clients_get_their_own_results() {
    let server = start(FirstPixel);
    let addr = server.addr;

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            thread::spawn(move || {
                let reply = InferenceClient::connect(addr, TIMEOUT)
                    .unwrap()
                    .infer(&digit_with_first(i))
                    .unwrap();
                (i, reply.predicted_class())
            })
        })
        .collect();

    for h in handles {
        let (sent, predicted) = h.join().unwrap();
        assert_eq!(predicted, sent as usize % CLASS_COUNT);
    }

    server.stop();
}

#[test]
fn shutdown_waits_for_in_flight_connection() {
    let server = start(FirstPixel);

    // Open a connection and send half a request so a handler is parked
    // in its read.
    let request = Envelope::InferenceInput(InferenceInput::new(digit_with_first(3))).encode();
    let mut stream = TcpStream::connect_timeout(&server.addr, TIMEOUT).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(&request[..REQUEST_FRAME_LEN / 2]).unwrap();
    thread::sleep(Duration::from_millis(100));

    server.shutdown.trigger();
    stream.write_all(&request[REQUEST_FRAME_LEN / 2..]).unwrap();

    let mut reply = vec![0u8; RESPONSE_FRAME_LEN];
    stream.read_exact(&mut reply).unwrap();
    match Envelope::decode(&reply).unwrap() {
        Envelope::InferenceOutput(out) => assert_eq!(out.scores[3], 1.0),
        other => panic!("Expected InferenceOutput, got {:?}", other),
    }

    server.thread.join().unwrap().unwrap();
    // Listener is gone once run() returns.
    assert!(TcpStream::connect_timeout(&server.addr, Duration::from_millis(200)).is_err());
}

// ---------------------------------------------------------------------------
// Tests: Model Files
// ---------------------------------------------------------------------------

#[test]
fn served_model_loaded_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("digits.mnlm");

    let mut weights = vec![0.0; DIGIT_LEN * CLASS_COUNT];
    // class 6 responds to the first pixel
    weights[6 * DIGIT_LEN] = 20.0;
    LinearModel::new(weights, [0.0; CLASS_COUNT]).unwrap().save(&path).unwrap();

    let model = LinearModel::load_model(&path).unwrap();
    let server = start(model);

    let reply = InferenceClient::connect(server.addr, TIMEOUT)
        .unwrap()
        .infer(&digit_with_first(255))
        .unwrap();
    assert_eq!(reply.predicted_class(), 6);
    let total: f32 = reply.scores.iter().sum();
    assert!((total - 1.0).abs() < 1e-5);

    server.stop();
}

// ---------------------------------------------------------------------------
// Tests: Latency
// ---------------------------------------------------------------------------

#[test]
fn idle_server_accepts_without_polling_delay() {
    let server = start(zero_model());

    let mut round_trips: Vec<Duration> = (0..20)
        .map(|_| {
            // Let the server go idle before each request.
            thread::sleep(Duration::from_millis(10));
            let start = Instant::now();
            InferenceClient::connect(server.addr, TIMEOUT)
                .unwrap()
                .infer(&[0; DIGIT_LEN])
                .unwrap();
            start.elapsed()
        })
        .collect();
    round_trips.sort();

    let median = round_trips[round_trips.len() / 2];
    assert!(median < Duration::from_millis(15), "median round trip {:?}", median);

    server.stop();
}
