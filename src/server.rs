//! TCP listener and accept loop
//!
//! A dedicated accept thread blocks in `accept` and hands each stream to
//! the run loop over a channel, so a connection reaching an idle server
//! is picked up as soon as it arrives. The run loop starts one thread per
//! connection running a [`ConnectionHandler`] and never blocks on a
//! handler, so it keeps accepting while handlers wait on the backend gate.
//!
//! Shutdown is explicit: [`ShutdownHandle::trigger`] wakes the run loop,
//! which stops taking connections, joins the outstanding handlers, then
//! wakes and joins the accept thread and only then drops the listener.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::backend::InferenceBackend;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::gate::BackendGate;
use crate::handler::ConnectionHandler;
use crate::metrics::Metrics;
use crate::session::{ConnectionId, ConnectionSession};

/// How long the shutdown path waits on its own wake-up connection.
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

type Accepted = io::Result<(TcpStream, SocketAddr)>;

/// Cloneable trigger that stops a running [`Server`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Sender<()>,
}

impl ShutdownHandle {
    /// Ask the server to stop. Safe to call more than once.
    pub fn trigger(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => debug!("Shutdown already pending"),
            Err(TrySendError::Disconnected(())) => debug!("Server already stopped"),
        }
    }
}

enum Event {
    Accepted(Accepted),
    AcceptorGone,
    Shutdown,
}

pub struct Server<B> {
    listener: TcpListener,
    gate: Arc<BackendGate<B>>,
    metrics: Option<Arc<Metrics>>,
    read_timeout: Duration,
    write_timeout: Duration,
    next_id: AtomicU64,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl<B: InferenceBackend + 'static> Server<B> {
    pub fn bind(config: &ServerConfig, gate: Arc<BackendGate<B>>) -> Result<Self> {
        config.validate()?;
        let addr = config.bind_addr()?;
        let listener = TcpListener::bind(addr)?;

        let metrics = config.metrics.then(|| Arc::new(Metrics::new()));
        let (shutdown_tx, shutdown_rx) = bounded(1);

        info!(addr = %listener.local_addr()?, "Listening");

        Ok(Self {
            listener,
            gate,
            metrics,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            next_id: AtomicU64::new(1),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: self.shutdown_tx.clone() }
    }

    pub fn metrics(&self) -> Option<Arc<Metrics>> {
        self.metrics.clone()
    }

    /// Accept connections until shutdown is triggered or accept fails
    /// with a non-transient error.
    pub fn run(self) -> Result<()> {
        let local_addr = self.listener.local_addr()?;
        let (conn_tx, conn_rx) = bounded::<Accepted>(0);
        let acceptor_listener = self.listener.try_clone()?;
        let acceptor = thread::Builder::new()
            .name("mnistd-accept".to_string())
            .spawn(move || accept_loop(acceptor_listener, conn_tx))?;

        let mut handlers: Vec<JoinHandle<()>> = Vec::new();

        let result = loop {
            let event = select! {
                recv(conn_rx) -> msg => match msg {
                    Ok(accepted) => Event::Accepted(accepted),
                    Err(_) => Event::AcceptorGone,
                },
                recv(self.shutdown_rx) -> _ => Event::Shutdown,
            };

            match event {
                Event::Accepted(Ok((stream, peer))) => {
                    match self.spawn_handler(stream, peer) {
                        Ok(handle) => handlers.push(handle),
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to start connection handler")
                        }
                    }
                    handlers.retain(|h| !h.is_finished());
                }
                Event::Accepted(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    break Err(ServerError::Accept(e));
                }
                Event::AcceptorGone => {
                    error!("Accept thread exited unexpectedly");
                    break Err(ServerError::Accept(io::Error::new(
                        io::ErrorKind::Other,
                        "accept thread exited",
                    )));
                }
                Event::Shutdown => break Ok(()),
            }
        };

        // The acceptor fails its next hand-off and exits.
        drop(conn_rx);

        info!(outstanding = handlers.len(), "Shutting down, waiting for connections");
        for handle in handlers {
            if handle.join().is_err() {
                warn!("Connection handler panicked");
            }
        }

        wake_acceptor(local_addr);
        if acceptor.join().is_err() {
            warn!("Accept thread panicked");
        }
        info!("Server stopped");
        // Listener dropped with self.
        result
    }

    fn spawn_handler(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<JoinHandle<()>> {
        let id: ConnectionId = self.next_id.fetch_add(1, Ordering::Relaxed);

        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        stream.set_nodelay(true)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_connection();
        }
        debug!(conn = id, peer = %peer, "Connection accepted");

        let handler = ConnectionHandler::new(
            Arc::clone(&self.gate),
            self.metrics.clone(),
            ConnectionSession::new(id, Some(peer)),
        );

        thread::Builder::new()
            .name(format!("mnistd-conn-{}", id))
            .spawn(move || {
                let mut stream = stream;
                handler.run(&mut stream);
            })
    }
}

/// Block in `accept` and forward every result until the run loop stops
/// listening or accept fails for good.
fn accept_loop(listener: TcpListener, tx: Sender<Accepted>) {
    loop {
        match listener.accept() {
            Ok(conn) => {
                if tx.send(Ok(conn)).is_err() {
                    break;
                }
            }
            Err(e) if is_transient(&e) => {
                debug!(error = %e, "Transient accept error");
            }
            Err(e) => {
                if let Err(unsent) = tx.send(Err(e)) {
                    debug!(error = ?unsent.into_inner(), "Accept failed after shutdown");
                }
                break;
            }
        }
    }
    debug!("Accept thread exiting");
}

/// Unblock the acceptor's pending `accept` with a throwaway connection.
fn wake_acceptor(local_addr: SocketAddr) {
    let target = match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), local_addr.port())
        }
        _ => local_addr,
    };
    if let Err(e) = TcpStream::connect_timeout(&target, WAKE_CONNECT_TIMEOUT) {
        // Acceptor already gone.
        debug!(error = %e, "Wake-up connect failed");
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InferenceError, InputTensor, Scores};
    use crate::protocol::CLASS_COUNT;
    use std::time::Instant;

    struct Zero;

    impl InferenceBackend for Zero {
        fn infer(&mut self, _input: &InputTensor) -> std::result::Result<Scores, InferenceError> {
            Ok([0.0; CLASS_COUNT])
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig { host: "127.0.0.1".into(), port: 0, ..Default::default() }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let gate = Arc::new(BackendGate::new(Zero, Duration::from_secs(1)));
        let server = Server::bind(&local_config(), gate).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(server.metrics().is_some());
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let gate = Arc::new(BackendGate::new(Zero, Duration::from_secs(1)));
        let config = ServerConfig { gate_timeout_ms: 0, ..local_config() };
        assert!(matches!(Server::bind(&config, gate), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_shutdown_before_run_returns_promptly() {
        let gate = Arc::new(BackendGate::new(Zero, Duration::from_secs(1)));
        let server = Server::bind(&local_config(), gate).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.shutdown_handle();
        handle.trigger();
        handle.trigger();

        let start = Instant::now();
        server.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_trigger_after_stop_is_harmless() {
        let gate = Arc::new(BackendGate::new(Zero, Duration::from_secs(1)));
        let server = Server::bind(&local_config(), gate).unwrap();
        let handle = server.shutdown_handle();
        handle.trigger();
        server.run().unwrap();
        handle.trigger();
    }

    #[test]
    fn test_acceptor_exits_when_run_loop_stops_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = bounded::<Accepted>(0);
        let acceptor = thread::spawn(move || accept_loop(listener, tx));

        drop(rx);
        wake_acceptor(addr);
        acceptor.join().unwrap();
    }

    #[test]
    fn test_wake_targets_loopback_for_unspecified_bind() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = bounded::<Accepted>(1);
        let acceptor = thread::spawn(move || accept_loop(listener, tx));

        wake_acceptor(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port));
        let (_, peer) = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert!(peer.ip().is_loopback());

        drop(rx);
        wake_acceptor(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port));
        acceptor.join().unwrap();
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
