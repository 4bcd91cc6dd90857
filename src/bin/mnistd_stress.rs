//! mnistd-stress - fire N concurrent inference requests at a server
//!
//! Usage:
//!   mnistd-stress 127.0.0.1:32001 64

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mnistd::protocol::DIGIT_LEN;
use mnistd::InferenceClient;

#[derive(Parser, Debug)]
#[command(name = "mnistd-stress", version)]
#[command(about = "Spawn concurrent clients against an mnistd server")]
struct Args {
    /// Server address
    addr: SocketAddr,

    /// Number of concurrent clients
    clients: usize,

    /// Seed for generated digits
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Connect/read/write timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Random but valid digit, reproducible from `seed`.
fn random_digit(seed: u64) -> [u8; DIGIT_LEN] {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut digit = [0u8; DIGIT_LEN];
    rng.fill(&mut digit[..]);
    digit
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    if args.clients == 0 {
        bail!("clients must be greater than zero");
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    info!(addr = %args.addr, clients = args.clients, "Spawning clients");

    let start = Instant::now();
    let handles: Vec<_> = (0..args.clients)
        .map(|i| {
            let addr = args.addr;
            let digit = random_digit(args.seed.wrapping_add(i as u64));
            thread::spawn(move || {
                let reply = InferenceClient::connect(addr, timeout)?.infer(&digit)?;
                info!(
                    client = i,
                    timer_ms = reply.timer_ms,
                    predicted = reply.predicted_class(),
                    "Reply received"
                );
                Ok::<f32, mnistd::ClientError>(reply.timer_ms)
            })
        })
        .collect();

    let mut timings = Vec::with_capacity(args.clients);
    let mut failures = 0usize;
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(ms)) => timings.push(ms),
            Ok(Err(e)) => {
                warn!(client = i, error = %e, "Request failed");
                failures += 1;
            }
            Err(_) => {
                warn!(client = i, "Client thread panicked");
                failures += 1;
            }
        }
    }
    let elapsed = start.elapsed();

    let avg_server_ms = if timings.is_empty() {
        0.0
    } else {
        timings.iter().sum::<f32>() / timings.len() as f32
    };

    println!("----------------------");
    println!("Total elapsed time: {:.3} ms", elapsed.as_secs_f64() * 1000.0);
    println!("Average server inference time: {:.3} ms", avg_server_ms);
    println!("Failures: {}/{}", failures, args.clients);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_digit_is_deterministic() {
        assert_eq!(random_digit(7), random_digit(7));
        assert_ne!(random_digit(7), random_digit(8));
        assert!(random_digit(0).iter().any(|&px| px != 0));
    }

    #[test]
    fn test_random_digit_decodes_as_valid_request() {
        use mnistd::Envelope;

        let digit = random_digit(1234);
        let bytes = Envelope::InferenceInput(mnistd::InferenceInput::new(digit)).encode();
        match Envelope::decode(&bytes).unwrap() {
            Envelope::InferenceInput(input) => assert_eq!(input.digit, digit),
            other => panic!("Expected InferenceInput, got {:?}", other),
        }
    }
}
