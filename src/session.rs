//! Per-connection state machine: `Connecting -> Authenticated -> Closing`.
//!
//! A [`Session`] is split into a read half (owned by the connection thread,
//! which calls `read_line` in a loop) and a write half that can be reached
//! from any thread — the router uses it to broadcast TEXT_UPDATE to other
//! open sessions without routing back through the originating thread.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::{FileId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Closing,
}

/// Shared, thread-safe session handle. Stored in the router's sessions table
/// keyed by `UserId` once authentication succeeds; held by the connection
/// thread for its whole lifetime.
pub struct Session {
    pub temp_id: String,
    write_half: Mutex<TcpStream>,
    state: Mutex<SessionState>,
    user_id: Mutex<Option<UserId>>,
    open_files: Mutex<HashSet<FileId>>,
    connected: AtomicBool,
}

impl Session {
    /// Wraps an accepted socket. `write_half` is an independent clone of the
    /// descriptor so broadcast writes never contend with the connection
    /// thread's blocking reads.
    pub fn new(socket: &TcpStream, temp_id: String) -> Result<Arc<Self>, EngineError> {
        let write_half = socket.try_clone()?;
        Ok(Arc::new(Self {
            temp_id,
            write_half: Mutex::new(write_half),
            state: Mutex::new(SessionState::Connecting),
            user_id: Mutex::new(None),
            open_files: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(true),
        }))
    }

    pub fn reader(socket: TcpStream) -> BufReader<TcpStream> {
        BufReader::new(socket)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Transitions `Connecting -> Authenticated` and records the assigned
    /// user id. A no-op if already authenticated as the same user (LOGIN is
    /// not re-entrant in this design, but idempotent calls shouldn't panic).
    pub fn authenticate(&self, user_id: UserId) {
        *self.state.lock() = SessionState::Authenticated;
        *self.user_id.lock() = Some(user_id);
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.lock().clone()
    }

    pub fn open_file(&self, file_id: FileId) {
        self.open_files.lock().insert(file_id);
    }

    pub fn close_file(&self, file_id: &FileId) {
        self.open_files.lock().remove(file_id);
    }

    pub fn has_open(&self, file_id: &FileId) -> bool {
        self.open_files.lock().contains(file_id)
    }

    pub fn open_files(&self) -> Vec<FileId> {
        self.open_files.lock().iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Marks the session as closing; idempotent. Does not itself close the
    /// socket — the connection thread's read loop observes this flag and
    /// tears down after running its own cleanup.
    pub fn begin_close(&self) {
        self.connected.store(false, Ordering::Release);
        *self.state.lock() = SessionState::Closing;
    }

    /// Writes one line (without the trailing newline) plus `\n` to the
    /// session's socket. Never called while any document lock is held.
    pub fn send_line(&self, line: &str) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Ok(());
        }
        let mut socket = self.write_half.lock();
        socket.write_all(line.as_bytes())?;
        socket.write_all(b"\n")?;
        socket.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn starts_in_connecting_state() {
        let (_client, server) = socket_pair();
        let session = Session::new(&server, "temp-1".into()).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_authenticated());
    }

    #[test]
    fn authenticate_transitions_state_and_records_user() {
        let (_client, server) = socket_pair();
        let session = Session::new(&server, "temp-1".into()).unwrap();
        session.authenticate("alice".into());
        assert!(session.is_authenticated());
        assert_eq!(session.user_id(), Some("alice".to_string()));
    }

    #[test]
    fn open_files_tracks_membership() {
        let (_client, server) = socket_pair();
        let session = Session::new(&server, "temp-1".into()).unwrap();
        session.open_file("f1".into());
        assert!(session.has_open(&"f1".to_string()));
        session.close_file(&"f1".to_string());
        assert!(!session.has_open(&"f1".to_string()));
    }

    #[test]
    fn begin_close_flips_connected_and_state() {
        let (_client, server) = socket_pair();
        let session = Session::new(&server, "temp-1".into()).unwrap();
        session.begin_close();
        assert!(!session.is_connected());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn send_line_after_close_is_a_silent_noop() {
        let (_client, server) = socket_pair();
        let session = Session::new(&server, "temp-1".into()).unwrap();
        session.begin_close();
        assert!(session.send_line("hello").is_ok());
    }
}
