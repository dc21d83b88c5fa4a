//! Incremental header-block parsing
//!
//! `HeaderParser` consumes bytes as they arrive off a non-blocking socket
//! and reports "incomplete" until it has seen a full header block. It is
//! used twice per multipart request: once for the request headers (with a
//! request line) and once per part (headers only).
//!
//! The parser accumulates at most `capacity` bytes; a header block that
//! does not fit is a fatal, non-retryable error - never a truncation.

use super::headers::{header_param, media_type};
use super::{Error, Headers, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Accumulating,
    Complete,
}

/// Incremental, bounded HTTP header-block parser
pub struct HeaderParser {
    capacity: usize,
    buf: Vec<u8>,
    state: ParserState,
    method: Option<String>,
    url: Option<String>,
    version: Option<String>,
    headers: Headers,
}

impl HeaderParser {
    /// Create a parser that accepts header blocks up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        HeaderParser {
            capacity,
            buf: Vec::new(),
            state: ParserState::Accumulating,
            method: None,
            url: None,
            version: None,
            headers: Headers::new(),
        }
    }

    /// Feed bytes to the parser.
    ///
    /// Returns the number of bytes consumed from `input`. Consumption stops
    /// immediately after the blank line that terminates the header block;
    /// anything beyond it belongs to the message body and stays with the
    /// caller. Feeding a parser that is already complete consumes nothing.
    ///
    /// `with_request_line` selects between request headers (first line is
    /// `METHOD URL VERSION`) and bare header blocks (multipart parts).
    pub fn parse(&mut self, input: &[u8], with_request_line: bool) -> Result<usize> {
        if self.state == ParserState::Complete {
            return Ok(0);
        }

        let mut consumed = 0;
        for &b in input {
            if self.buf.len() == self.capacity {
                return Err(Error::HeaderTooLarge {
                    capacity: self.capacity,
                });
            }
            self.buf.push(b);
            consumed += 1;

            if self.terminator_reached() {
                self.finalize(with_request_line)?;
                return Ok(consumed);
            }
        }
        Ok(consumed)
    }

    /// True until a complete header block has been parsed.
    pub fn is_incomplete(&self) -> bool {
        self.state != ParserState::Complete
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Media type of the Content-Type header, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type").map(media_type)
    }

    /// Multipart boundary token, prefixed with `\r\n--` as the multipart
    /// parser expects it.
    pub fn boundary(&self) -> Option<Vec<u8>> {
        let value = self.headers.get("Content-Type")?;
        let token = header_param(value, "boundary")?;
        let mut boundary = Vec::with_capacity(4 + token.len());
        boundary.extend_from_slice(b"\r\n--");
        boundary.extend_from_slice(token.as_bytes());
        Some(boundary)
    }

    /// `name` parameter of the Content-Disposition header (part field name).
    pub fn content_disposition_name(&self) -> Option<&str> {
        header_param(self.headers.get("Content-Disposition")?, "name")
    }

    /// `filename` parameter of the Content-Disposition header.
    pub fn content_disposition_filename(&self) -> Option<&str> {
        header_param(self.headers.get("Content-Disposition")?, "filename")
    }

    /// Reset for the next header block. Capacity is retained.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.state = ParserState::Accumulating;
        self.method = None;
        self.url = None;
        self.version = None;
        self.headers.clear();
    }

    fn terminator_reached(&self) -> bool {
        self.buf.ends_with(b"\r\n\r\n") || self.buf == b"\r\n"
    }

    fn finalize(&mut self, with_request_line: bool) -> Result<()> {
        let raw = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&raw);
        let mut lines = text.split("\r\n");

        if with_request_line {
            let line = lines.next().unwrap_or("");
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 3 {
                return Err(Error::Parse(format!(
                    "Invalid request line: expected 3 parts, got {}",
                    parts.len()
                )));
            }
            self.method = Some(parts[0].to_string());
            self.url = Some(parts[1].to_string());
            self.version = Some(parts[2].to_string());
        }

        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = Headers::parse_header_line(line)?;
            self.headers.insert(name, value);
        }

        self.state = ParserState::Complete;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers_single_feed() {
        let mut parser = HeaderParser::new(1024);
        let data = b"POST /imp HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/csv\r\n\r\n";
        let consumed = parser.parse(data, true).unwrap();

        assert_eq!(consumed, data.len());
        assert!(!parser.is_incomplete());
        assert_eq!(parser.method(), Some("POST"));
        assert_eq!(parser.url(), Some("/imp"));
        assert_eq!(parser.version(), Some("HTTP/1.1"));
        assert_eq!(parser.header("Host"), Some("localhost"));
        assert_eq!(parser.content_type(), Some("text/csv"));
    }

    #[test]
    fn test_consumption_stops_at_blank_line() {
        let mut parser = HeaderParser::new(1024);
        let data = b"GET / HTTP/1.1\r\n\r\nleftover-body-bytes";
        let consumed = parser.parse(data, true).unwrap();

        assert!(!parser.is_incomplete());
        assert_eq!(&data[consumed..], b"leftover-body-bytes");
    }

    #[test]
    fn test_incremental_feed() {
        let mut parser = HeaderParser::new(1024);
        let data = b"GET /status HTTP/1.1\r\nHost: a\r\n\r\n";

        // one byte at a time
        let mut fed = 0;
        for chunk in data.chunks(1) {
            fed += parser.parse(chunk, true).unwrap();
            if !parser.is_incomplete() {
                break;
            }
        }
        assert_eq!(fed, data.len());
        assert_eq!(parser.url(), Some("/status"));
    }

    #[test]
    fn test_complete_parser_consumes_nothing() {
        let mut parser = HeaderParser::new(1024);
        parser.parse(b"GET / HTTP/1.1\r\n\r\n", true).unwrap();
        assert_eq!(parser.parse(b"more", true).unwrap(), 0);
    }

    #[test]
    fn test_part_headers_without_request_line() {
        let mut parser = HeaderParser::new(256);
        let data = b"Content-Disposition: form-data; name=\"data\"; filename=\"x.csv\"\r\n\r\n";
        parser.parse(data, false).unwrap();

        assert!(!parser.is_incomplete());
        assert_eq!(parser.content_disposition_name(), Some("data"));
        assert_eq!(parser.content_disposition_filename(), Some("x.csv"));
    }

    #[test]
    fn test_empty_part_header_block() {
        let mut parser = HeaderParser::new(256);
        let consumed = parser.parse(b"\r\nbody", false).unwrap();
        assert_eq!(consumed, 2);
        assert!(!parser.is_incomplete());
        assert!(parser.headers().is_empty());
    }

    #[test]
    fn test_boundary_is_crlf_dash_dash_prefixed() {
        let mut parser = HeaderParser::new(1024);
        parser
            .parse(
                b"POST /imp HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=9Ab3x\r\n\r\n",
                true,
            )
            .unwrap();

        assert_eq!(parser.content_type(), Some("multipart/form-data"));
        assert_eq!(parser.boundary().unwrap(), b"\r\n--9Ab3x".to_vec());
    }

    #[test]
    fn test_header_block_exceeding_capacity_is_fatal() {
        let mut parser = HeaderParser::new(32);
        let data = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let err = parser.parse(data, true).unwrap_err();
        assert!(matches!(err, Error::HeaderTooLarge { capacity: 32 }));
    }

    #[test]
    fn test_capacity_error_at_every_split() {
        // feeding in two chunks at any split must still fail, never truncate
        let data = b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        for split in 0..data.len() {
            let mut parser = HeaderParser::new(32);
            let first = parser.parse(&data[..split], true);
            let failed = match first {
                Err(Error::HeaderTooLarge { .. }) => true,
                Ok(_) => matches!(
                    parser.parse(&data[split..], true),
                    Err(Error::HeaderTooLarge { .. })
                ),
                Err(e) => panic!("unexpected error: {}", e),
            };
            assert!(failed, "split at {} did not report overflow", split);
        }
    }

    #[test]
    fn test_clear_resets_state() {
        let mut parser = HeaderParser::new(1024);
        parser.parse(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n", true).unwrap();
        parser.clear();

        assert!(parser.is_incomplete());
        assert_eq!(parser.url(), None);
        parser.parse(b"GET /b HTTP/1.1\r\n\r\n", true).unwrap();
        assert_eq!(parser.url(), Some("/b"));
    }

    #[test]
    fn test_malformed_request_line() {
        let mut parser = HeaderParser::new(1024);
        let err = parser.parse(b"BROKEN\r\n\r\n", true).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
