//! Progress and lifecycle reporting surface for external shells.
//!
//! The engines never assume a specific frontend; everything observable
//! flows through an [`EventSink`] supplied by the caller. A CLI wires
//! these to progress bars, a GUI to its event bus.

use std::fmt;
use std::net::SocketAddr;

use crate::error::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One per-chunk progress snapshot. Byte counts are measured from the
/// negotiated resume offset, so `total_bytes` is what this session
/// will actually move.
#[derive(Debug, Clone)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub file_name: String,
    pub peer_addr: SocketAddr,
    pub direction: Direction,
}

/// Capability interface between the engines and their shell. Sinks may
/// be called from several handler tasks at once.
pub trait EventSink: Send + Sync {
    fn on_progress(&self, _progress: &Progress) {}

    fn on_complete(&self, _file_name: &str, _peer_addr: SocketAddr, _direction: Direction) {}

    fn on_error(&self, _error: &TransferError, _peer_addr: SocketAddr, _direction: Direction) {}

    /// Consulted before the first header byte is written; returning
    /// false closes the connection without sending anything.
    fn approve_connection(&self, _peer_addr: SocketAddr) -> bool {
        true
    }
}

/// Sink that discards everything and approves every connection.
pub struct NullSink;

impl EventSink for NullSink {}
