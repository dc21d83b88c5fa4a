//! Response writing
//!
//! `ResponseSink` stages outgoing bytes and pushes them to a non-blocking
//! socket. A send that would block surfaces as `PeerIsSlowToRead`; the
//! staged tail stays in the sink and `resume_send` drains it when the
//! dispatcher reports write readiness.
//!
//! Three paths are exposed to processors through [`Reply`]: a simple
//! status+body response, a chunked streamed response, and a raw path for
//! pre-built response bytes.

use bytes::{Buf, BufMut, BytesMut};
use log::debug;

use super::chunked::ChunkedEncoder;
use super::{Error, Result, SocketOps, CRLF};

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Staged response output for one connection
#[derive(Default)]
pub struct ResponseSink {
    out: BytesMut,
    total_sent: u64,
    started: bool,
}

impl ResponseSink {
    pub fn new() -> Self {
        ResponseSink {
            out: BytesMut::with_capacity(8192),
            total_sent: 0,
            started: false,
        }
    }

    /// Bytes actually written to the socket for the current request.
    pub fn bytes_sent(&self) -> u64 {
        self.total_sent
    }

    /// True once any response bytes have been staged. After this point a
    /// failure can no longer be reported as a well-formed error response.
    pub fn response_started(&self) -> bool {
        self.started
    }

    /// Reset between requests. Pending bytes are dropped, so this must only
    /// run after a flush completed or the connection is being torn down.
    pub fn clear(&mut self) {
        self.out.clear();
        self.total_sent = 0;
        self.started = false;
    }

    /// Stage a complete simple response with a text body.
    pub fn put_simple(&mut self, status: u16, body: &str) {
        self.started = true;
        let out = &mut self.out;
        out.put_slice(format!("HTTP/1.1 {} {}{}", status, reason_phrase(status), CRLF).as_bytes());
        out.put_slice(format!("Content-Length: {}{}", body.len(), CRLF).as_bytes());
        out.put_slice(b"Content-Type: text/plain\r\n");
        out.put_slice(CRLF.as_bytes());
        out.put_slice(body.as_bytes());
    }

    /// Stage the header block of a chunked streamed response.
    pub fn put_chunked_header(&mut self, status: u16, content_type: &str) {
        self.started = true;
        let out = &mut self.out;
        out.put_slice(format!("HTTP/1.1 {} {}{}", status, reason_phrase(status), CRLF).as_bytes());
        out.put_slice(format!("Content-Type: {}{}", content_type, CRLF).as_bytes());
        out.put_slice(b"Transfer-Encoding: chunked\r\n");
        out.put_slice(CRLF.as_bytes());
    }

    /// Stage one chunk of a streamed response body.
    pub fn put_chunk(&mut self, data: &[u8]) -> Result<()> {
        let mut encoder = ChunkedEncoder::new((&mut self.out).writer());
        encoder.write_chunk(data)
    }

    /// Stage the chunked body terminator.
    pub fn put_chunk_end(&mut self) -> Result<()> {
        let mut encoder = ChunkedEncoder::new((&mut self.out).writer());
        encoder.finish()
    }

    /// Stage pre-built response bytes verbatim.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.started = true;
        self.out.put_slice(data);
    }

    /// Push staged bytes to the socket until done or the socket would
    /// block. A blocked send leaves the tail staged and reports
    /// `PeerIsSlowToRead` so the caller parks the request.
    pub fn flush(&mut self, socket: &mut dyn SocketOps) -> Result<()> {
        while !self.out.is_empty() {
            match socket.send(&self.out) {
                Ok(0) => return Err(Error::PeerDisconnected),
                Ok(n) => {
                    self.total_sent += n as u64;
                    self.out.advance(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    debug!("send would block [pending={}]", self.out.len());
                    return Err(Error::PeerIsSlowToRead);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::BrokenPipe
                        || e.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    return Err(Error::PeerDisconnected);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Continue a send interrupted by write-readiness suspension.
    pub fn resume_send(&mut self, socket: &mut dyn SocketOps) -> Result<()> {
        self.flush(socket)
    }

    /// Stage and flush a simple response in one step.
    pub fn send_simple(&mut self, socket: &mut dyn SocketOps, status: u16, body: &str) -> Result<()> {
        self.put_simple(status, body);
        self.flush(socket)
    }
}

/// Processor-facing response handle
///
/// Bundles the sink with the connection's socket so processors can stream
/// without seeing either directly. Every method may report
/// `PeerIsSlowToRead` or `PeerDisconnected`; processors propagate those to
/// the connection context.
pub struct Reply<'a> {
    sink: &'a mut ResponseSink,
    socket: &'a mut dyn SocketOps,
}

impl<'a> Reply<'a> {
    pub fn new(sink: &'a mut ResponseSink, socket: &'a mut dyn SocketOps) -> Self {
        Reply { sink, socket }
    }

    /// Send a complete status+body response.
    pub fn send_status(&mut self, status: u16, body: &str) -> Result<()> {
        self.sink.put_simple(status, body);
        self.sink.flush(self.socket)
    }

    /// Start a chunked streamed response.
    pub fn begin_chunked(&mut self, status: u16, content_type: &str) -> Result<()> {
        self.sink.put_chunked_header(status, content_type);
        self.sink.flush(self.socket)
    }

    /// Send one chunk of a streamed response.
    pub fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.sink.put_chunk(data)?;
        self.sink.flush(self.socket)
    }

    /// Terminate a streamed response.
    pub fn finish(&mut self) -> Result<()> {
        self.sink.put_chunk_end()?;
        self.sink.flush(self.socket)
    }

    /// Send pre-built response bytes verbatim.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.sink.put_raw(data);
        self.sink.flush(self.socket)
    }

    /// True once any response bytes have been staged for this request.
    pub fn response_started(&self) -> bool {
        self.sink.response_started()
    }
}
