//! The TCP accept loop, connection handler, and auto-save scheduler that
//! turn the [`Router`] into a runnable service.
//!
//! One OS thread is spawned per accepted connection (the parallel-thread
//! model from the concurrency design); a single additional thread runs the
//! periodic auto-save tick. Shutdown is cooperative: a Ctrl-C handler flips
//! an `AtomicBool`, the accept loop (polling a non-blocking listener) and
//! the auto-save thread (waiting on a timed channel recv) both observe it
//! within one tick, and `Server::run` persists every dirty document before
//! returning.

use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;
use crate::error::EngineError;
use crate::router::Router;
use crate::session::Session;
use crate::storage::FileDocumentStore;
use crate::users::FileUserStore;

/// Owns the router and the threads that drive it. Constructed once at
/// startup from a resolved [`Config`].
pub struct Server {
    router: Arc<Router>,
    config: Config,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, EngineError> {
        let users = Arc::new(FileUserStore::open(config.users_file.clone())?);
        let storage = Arc::new(FileDocumentStore::new(config.documents_dir.clone(), config.max_file_size));
        let router = Arc::new(Router::new(users, storage, config.clone()));
        Ok(Self {
            router,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Binds the listener, installs the Ctrl-C handler, starts the auto-save
    /// thread, and accepts connections until shutdown is requested. Blocks
    /// until every spawned thread has wound down.
    pub fn run(self) -> Result<(), EngineError> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port))?;
        listener.set_nonblocking(true)?;
        tracing::info!(port = self.config.port, "listening");

        let shutdown = self.shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown requested");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| crate::error::internal(format!("failed to install signal handler: {e}")))?;

        let (autosave_stop_tx, autosave_stop_rx) = flume::bounded::<()>(0);
        let autosave_handle = {
            let router = self.router.clone();
            let interval = Duration::from_millis(self.config.auto_save_interval_ms);
            std::thread::spawn(move || autosave_loop(router, interval, autosave_stop_rx))
        };

        let mut worker_handles = Vec::new();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((socket, addr)) => {
                    if self.active_connections.load(Ordering::SeqCst) >= self.config.max_connections {
                        tracing::warn!(%addr, "rejecting connection: max_connections reached");
                        reject_connection(socket);
                        continue;
                    }
                    let router = self.router.clone();
                    let active = self.active_connections.clone();
                    let read_timeout = Duration::from_millis(self.config.socket_read_timeout_ms);
                    active.fetch_add(1, Ordering::SeqCst);
                    worker_handles.push(std::thread::spawn(move || {
                        handle_connection(router, socket, addr.to_string(), read_timeout);
                        active.fetch_sub(1, Ordering::SeqCst);
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        tracing::info!("shutting down: persisting all dirty documents");
        self.router.save_all_dirty();

        drop(autosave_stop_tx);
        if wait_with_deadline(autosave_handle, Duration::from_secs(5)).is_err() {
            tracing::warn!("auto-save thread did not terminate within the shutdown deadline");
        }

        for handle in worker_handles {
            let _ = handle.join();
        }

        Ok(())
    }
}

fn wait_with_deadline(handle: std::thread::JoinHandle<()>, deadline: Duration) -> Result<(), ()> {
    let (done_tx, done_rx) = flume::bounded::<()>(0);
    std::thread::spawn(move || {
        let _ = handle.join();
        let _ = done_tx.send(());
    });
    done_rx.recv_timeout(deadline).map_err(|_| ())
}

/// Periodically persists dirty documents until `stop` fires (the sender is
/// dropped during shutdown, which disconnects every pending `recv_timeout`).
fn autosave_loop(router: Arc<Router>, interval: Duration, stop: flume::Receiver<()>) {
    loop {
        match stop.recv_timeout(interval) {
            Ok(()) => return,
            Err(flume::RecvTimeoutError::Disconnected) => return,
            Err(flume::RecvTimeoutError::Timeout) => {
                tracing::debug!("auto-save tick");
                router.save_all_dirty();
            }
        }
    }
}

/// Writes a single ERROR frame and closes the socket immediately, used when
/// `max_connections` is already at capacity.
fn reject_connection(socket: TcpStream) {
    use crate::codec::{Codec, Message};
    let codec = Codec::new(4096, 0);
    let line = codec.encode(None, &Message::Error { message: "server at max_connections capacity".to_string() });
    let mut socket = socket;
    let _ = std::io::Write::write_all(&mut socket, format!("{line}\n").as_bytes());
}

/// Runs one connection's whole lifecycle: accept a [`Session`], read
/// length-framed lines until disconnect or a fatal I/O error, dispatching
/// each through the router. Cleanup (closing every open file, unregistering
/// the session) always runs via [`Router::close_session`] before returning.
fn handle_connection(router: Arc<Router>, socket: TcpStream, peer_addr: String, read_timeout: Duration) {
    if let Err(e) = socket.set_read_timeout(Some(read_timeout)) {
        tracing::warn!(%peer_addr, error = %e, "failed to set read timeout");
    }

    let session = match Session::new(&socket, Uuid::new_v4().to_string()) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(%peer_addr, error = %e, "failed to initialize session");
            return;
        }
    };

    tracing::info!(%peer_addr, temp_id = %session.temp_id, "connection accepted");
    let mut reader = BufReader::new(socket);
    let mut line = String::new();

    loop {
        if !session.is_connected() {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if trimmed.is_empty() {
                    continue;
                }
                dispatch_line(&router, &session, trimmed);
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                crate::error::log_boundary(session.user_id().as_ref(), None, &EngineError::IoFailure { source: e });
                break;
            }
        }
    }

    router.close_session(&session);
    tracing::info!(%peer_addr, temp_id = %session.temp_id, "connection closed");
}

/// Decodes and dispatches one line, catching panics at the session boundary
/// per the `Internal` error kind and replying with an ERROR frame for every
/// non-fatal outcome.
fn dispatch_line(router: &Arc<Router>, session: &Arc<Session>, line: &str) {
    let codec = router.codec();
    let decoded = match codec.decode(line) {
        Ok(message) => message,
        Err(e) => {
            crate::error::log_boundary(session.user_id().as_ref(), None, &e);
            let _ = session.send_line(&codec.encode(None, &crate::codec::Message::Error { message: e.wire_message() }));
            return;
        }
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| router.dispatch(session, decoded)));

    let result = match outcome {
        Ok(result) => result,
        Err(_) => Err(crate::error::internal("handler panicked")),
    };

    match result {
        Ok(Some(reply)) => {
            let _ = session.send_line(&codec.encode(session.user_id(), &reply));
        }
        Ok(None) => {}
        Err(e) => {
            crate::error::log_boundary(session.user_id().as_ref(), None, &e);
            if e.is_fatal() {
                session.begin_close();
                return;
            }
            let _ = session.send_line(&codec.encode(session.user_id(), &crate::codec::Message::Error { message: e.wire_message() }));
        }
    }
}
