//! HTTP/1.1 ingestion layer
//!
//! This module owns a connection from readiness notification to completed
//! request: incremental header parsing, multipart body streaming, response
//! writing, keep-alive looping and the retry protocol for operations that
//! fail transiently on a shared backend resource.
//!
//! # Architecture
//!
//! The layer is driven from the outside by a readiness dispatcher:
//!
//! - `SocketOps` abstracts a non-blocking socket (read/write only)
//! - `ConnectionContext` is the per-connection state machine
//! - `RequestProcessor` is the request-specific business logic callback
//! - `Dispatcher` / `Rescheduler` are the readiness and retry queues the
//!   context hands itself back to whenever it must suspend
//!
//! Every suspension is expressed as an `Error` variant returned from a
//! processing call; the caller branches on the variant instead of relying
//! on non-local control flow.

pub mod chunked;
pub mod context;
pub mod headers;
pub mod multipart;
pub mod parser;
pub mod processor;
pub mod response;
pub mod retry;

pub use context::{ConnectionContext, IngestConfig};
pub use headers::Headers;
pub use multipart::{MultipartListener, MultipartParser};
pub use parser::HeaderParser;
pub use processor::{
    ConnToken, Dispatcher, IoOperation, ProcessorRegistry, ProcessorSelector, RequestProcessor,
};
pub use response::{Reply, ResponseSink};
pub use retry::{Rescheduler, RetryAttemptAttributes, RetryQueue};

use std::io;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ingestion errors and suspension signals
///
/// The first group are true errors; the rest are control signals the
/// connection context branches on. `PeerIsSlowToRead` in particular is not
/// a failure - it means "park the request and wait for write readiness",
/// and `RetryOperation` means "hand this context to the reschedule queue".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Header block exceeds buffer capacity of {capacity} bytes")]
    HeaderTooLarge { capacity: usize },

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Peer is slow to read")]
    PeerIsSlowToRead,

    #[error("Server disconnect")]
    ServerDisconnect,

    #[error("Transient backend resource conflict")]
    RetryOperation,

    #[error("Retry rejected: {0}")]
    RetryFailed(String),

    #[error("Receive buffer too small for contiguous data")]
    ReceiveBufferTooSmall,
}

impl Error {
    /// True for outcomes that tear the connection down rather than suspend it.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::PeerIsSlowToRead | Error::RetryOperation)
    }
}

/// Maximum number of headers per header block
pub const MAX_HEADERS: usize = 64;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Non-blocking socket operations
///
/// Semantics follow the standard library's non-blocking contract:
/// `Ok(0)` means the peer closed the connection and
/// `ErrorKind::WouldBlock` means no data (or no space) right now.
pub trait SocketOps {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
}
