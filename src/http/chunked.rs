//! Chunked transfer-encoding writer
//!
//! Streamed replies (query results, import summaries) are framed with
//! chunked transfer encoding. Only the writer side lives here; request
//! bodies on the ingestion path are multipart, never chunked.

use super::{Result, CRLF};
use std::io::Write;

/// Chunked encoder
///
/// Frames data in HTTP chunked transfer encoding.
pub struct ChunkedEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedEncoder<W> {
    pub fn new(writer: W) -> Self {
        ChunkedEncoder { writer }
    }

    /// Write one chunk. Empty chunks are skipped - a zero-sized chunk
    /// would terminate the body.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        write!(self.writer, "{:x}{}", data.len(), CRLF)?;
        self.writer.write_all(data)?;
        self.writer.write_all(CRLF.as_bytes())?;
        Ok(())
    }

    /// Write the terminating zero-sized chunk.
    pub fn finish(&mut self) -> Result<()> {
        write!(self.writer, "0{}{}", CRLF, CRLF)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
