//! Multipart/form-data body streaming
//!
//! A resumable boundary scanner over caller-owned byte ranges. `parse` is
//! invoked repeatedly as bytes arrive off the socket; the boundary token, a
//! part's header block or a part's body may be split across arbitrarily
//! many invocations. Listener callbacks receive borrowed slices of the
//! caller's buffer - nothing is copied and nothing is buffered beyond the
//! bounded part-header parser.
//!
//! When a listener callback reports a transient backend conflict the parser
//! rolls its state back so that re-invoking `parse` over the same logical
//! stream position (see [`MultipartParser::resume_offset`]) re-delivers the
//! failed callback and continues identically.

use log::debug;

use super::parser::HeaderParser;
use super::{Error, Result};

/// Callbacks emitted while streaming a multipart body.
///
/// Per part the sequence is strictly
/// `on_part_begin (on_chunk)* on_part_end`; no callback is invoked after
/// the terminal boundary has been seen. Chunk slices are valid only for the
/// duration of the call.
pub trait MultipartListener {
    fn on_part_begin(&mut self, headers: &HeaderParser) -> Result<()>;
    fn on_chunk(&mut self, data: &[u8]) -> Result<()>;
    fn on_part_end(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartParsing,
    StartBoundary,
    PartialStartBoundary,
    PreHeaders,
    StartPreHeaders,
    Headers,
    StartHeaders,
    PartialHeaders,
    Body,
    BodyBroken,
    PotentialBoundary,
    Done,
}

/// Result of matching input bytes against the boundary token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundaryMatch {
    /// Full token matched; payload is the number of input bytes consumed.
    Match(usize),
    /// Input ran out mid-token; the cursor is preserved for the next call.
    Incomplete,
    /// A byte mismatched; provisionally matched bytes are body content.
    NoMatch,
}

/// Resumable multipart boundary scanner
pub struct MultipartParser {
    header_parser: HeaderParser,
    boundary: Vec<u8>,
    boundary_cursor: usize,
    state: State,
    resume_at: usize,
}

impl MultipartParser {
    /// `header_capacity` bounds each part's header block.
    pub fn new(header_capacity: usize) -> Self {
        MultipartParser {
            header_parser: HeaderParser::new(header_capacity),
            boundary: Vec::new(),
            boundary_cursor: 0,
            state: State::StartParsing,
            resume_at: 0,
        }
    }

    /// Bind the boundary for the next message. The token must carry the
    /// `\r\n--` prefix, as produced by [`HeaderParser::boundary`].
    pub fn bind_boundary(&mut self, boundary: &[u8]) {
        self.boundary.clear();
        self.boundary.extend_from_slice(boundary);
    }

    /// Offset into the most recent `parse` input of the first byte that has
    /// not been durably delivered. Valid after `parse` returns an error;
    /// re-invoking over a buffer reconstructed at this offset reproduces
    /// the interrupted callback and continues identically.
    pub fn resume_offset(&self) -> usize {
        self.resume_at
    }

    /// Reset for a new message. The bound boundary is kept; the connection
    /// context re-binds it per request.
    pub fn clear(&mut self) {
        self.state = State::StartParsing;
        self.boundary_cursor = 0;
        self.resume_at = 0;
        self.header_parser.clear();
    }

    /// Scan `input`, emitting listener events.
    ///
    /// Returns `Ok(true)` once the terminal boundary has been seen - the
    /// message is fully parsed and later calls keep returning `Ok(true)`.
    /// `Ok(false)` means the input ran out mid-message: feed the
    /// continuation of the same logical stream next.
    pub fn parse<L: MultipartListener + ?Sized>(
        &mut self,
        input: &[u8],
        listener: &mut L,
    ) -> Result<bool> {
        if self.state == State::Done {
            return Ok(true);
        }

        let hi = input.len();
        let mut pos = 0;
        // start of the body region not yet emitted as a chunk
        let mut part_lo = usize::MAX;
        self.resume_at = 0;

        while pos < hi {
            match self.state {
                State::BodyBroken => {
                    part_lo = pos;
                    self.state = State::Body;
                }

                State::StartParsing => {
                    self.state = State::StartBoundary;
                }

                State::StartBoundary => {
                    // the first boundary has no preceding CRLF; skip the
                    // \r\n-- prefix's CRLF when matching
                    self.boundary_cursor = 2;
                    self.state = State::PartialStartBoundary;
                }

                State::PartialStartBoundary => match self.match_boundary(input, pos) {
                    BoundaryMatch::Incomplete => {
                        self.resume_at = pos;
                        return Ok(false);
                    }
                    BoundaryMatch::Match(consumed) => {
                        self.state = State::StartPreHeaders;
                        pos += consumed;
                    }
                    BoundaryMatch::NoMatch => {
                        return Err(Error::Protocol("Malformed start boundary".to_string()));
                    }
                },

                State::PreHeaders => match input[pos] {
                    b'\n' => {
                        self.state = State::Headers;
                        pos += 1;
                    }
                    b'\r' => {
                        pos += 1;
                    }
                    b'-' => {
                        self.resume_at = pos;
                        listener.on_part_end()?;
                        debug!("multipart done");
                        self.state = State::Done;
                        return Ok(true);
                    }
                    _ => {
                        // matched a full boundary token that turned out to
                        // be body content; re-emit it verbatim
                        self.resume_at = pos;
                        listener.on_chunk(&self.boundary)?;
                        part_lo = pos;
                        self.state = State::Body;
                    }
                },

                State::StartPreHeaders => match input[pos] {
                    b'\n' => {
                        self.state = State::StartHeaders;
                        pos += 1;
                    }
                    b'\r' => {
                        pos += 1;
                    }
                    b'-' => {
                        // empty multipart message
                        self.state = State::Done;
                        return Ok(true);
                    }
                    _ => {
                        return Err(Error::Protocol("Malformed start boundary".to_string()));
                    }
                },

                State::Headers => {
                    self.resume_at = pos;
                    listener.on_part_end()?;
                    self.state = State::StartHeaders;
                }

                State::StartHeaders => {
                    self.header_parser.clear();
                    self.state = State::PartialHeaders;
                }

                State::PartialHeaders => {
                    pos += self.header_parser.parse(&input[pos..hi], false)?;
                    if self.header_parser.is_incomplete() {
                        self.resume_at = pos;
                        return Ok(false);
                    }
                    // state is left as-is while the listener runs: a failed
                    // on_part_begin re-enters here, the completed header
                    // parser consumes nothing and the callback is re-issued
                    self.resume_at = pos;
                    listener.on_part_begin(&self.header_parser)?;
                    part_lo = pos;
                    self.state = State::Body;
                }

                State::Body => {
                    let b = input[pos];
                    pos += 1;
                    if b == self.boundary[0] {
                        self.boundary_cursor = 1;
                        match self.match_boundary(input, pos) {
                            BoundaryMatch::Incomplete => {
                                self.emit_body(input, part_lo, pos - 1, listener)?;
                                self.state = State::PotentialBoundary;
                                self.resume_at = pos;
                                return Ok(false);
                            }
                            BoundaryMatch::Match(consumed) => {
                                self.emit_body(input, part_lo, pos - 1, listener)?;
                                self.state = State::PreHeaders;
                                pos += consumed;
                            }
                            BoundaryMatch::NoMatch => {}
                        }
                    }
                }

                State::PotentialBoundary => {
                    let prefix_len = self.boundary_cursor;
                    match self.match_boundary(input, pos) {
                        BoundaryMatch::Incomplete => {
                            self.resume_at = pos;
                            return Ok(false);
                        }
                        BoundaryMatch::Match(consumed) => {
                            pos += consumed;
                            self.state = State::PreHeaders;
                        }
                        BoundaryMatch::NoMatch => {
                            // the bytes that looked like a boundary at the
                            // end of the previous buffer were body content
                            self.resume_at = pos;
                            listener.on_chunk(&self.boundary[..prefix_len])?;
                            self.state = State::BodyBroken;
                        }
                    }
                }

                State::Done => return Ok(true),
            }
        }

        if self.state == State::Body && part_lo != usize::MAX {
            self.resume_at = part_lo;
            if pos > part_lo {
                if let Err(e) = listener.on_chunk(&input[part_lo..pos]) {
                    self.state = State::BodyBroken;
                    return Err(e);
                }
            }
            self.state = State::BodyBroken;
            self.resume_at = pos;
        }

        Ok(false)
    }

    /// Emit `input[lo..hi]` as a body chunk, rolling back to `BodyBroken`
    /// at the chunk start if the listener fails so a later re-parse from
    /// [`resume_offset`](Self::resume_offset) re-delivers it.
    fn emit_body<L: MultipartListener + ?Sized>(
        &mut self,
        input: &[u8],
        lo: usize,
        hi: usize,
        listener: &mut L,
    ) -> Result<()> {
        if hi > lo {
            self.resume_at = lo;
            if let Err(e) = listener.on_chunk(&input[lo..hi]) {
                self.state = State::BodyBroken;
                return Err(e);
            }
        }
        Ok(())
    }

    fn match_boundary(&mut self, input: &[u8], mut lo: usize) -> BoundaryMatch {
        let start = lo;
        let mut cursor = self.boundary_cursor;

        while lo < input.len() && cursor < self.boundary.len() {
            if input[lo] != self.boundary[cursor] {
                return BoundaryMatch::NoMatch;
            }
            lo += 1;
            cursor += 1;
        }

        self.boundary_cursor = cursor;

        if cursor < self.boundary.len() {
            BoundaryMatch::Incomplete
        } else {
            BoundaryMatch::Match(lo - start)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &[u8] = b"\r\n--9Ab3x";

    /// Records the callback sequence; optionally fails one chunk delivery.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        bodies: Vec<Vec<u8>>,
        fail_on_chunk: Option<usize>,
        chunks_seen: usize,
    }

    impl Recorder {
        fn with_fault(n: usize) -> Self {
            Recorder {
                fail_on_chunk: Some(n),
                ..Default::default()
            }
        }
    }

    impl MultipartListener for Recorder {
        fn on_part_begin(&mut self, headers: &HeaderParser) -> Result<()> {
            self.events.push(format!(
                "begin:{}",
                headers.content_disposition_name().unwrap_or("?")
            ));
            self.bodies.push(Vec::new());
            Ok(())
        }

        fn on_chunk(&mut self, data: &[u8]) -> Result<()> {
            if self.fail_on_chunk == Some(self.chunks_seen) {
                self.fail_on_chunk = None;
                return Err(Error::RetryOperation);
            }
            self.chunks_seen += 1;
            self.bodies.last_mut().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn on_part_end(&mut self) -> Result<()> {
            self.events.push("end".to_string());
            Ok(())
        }
    }

    fn two_part_message() -> Vec<u8> {
        let mut m = Vec::new();
        m.extend_from_slice(b"--9Ab3x\r\n");
        m.extend_from_slice(b"Content-Disposition: form-data; name=\"schema\"\r\n\r\n");
        m.extend_from_slice(b"col1:INT,col2:STRING");
        m.extend_from_slice(b"\r\n--9Ab3x\r\n");
        m.extend_from_slice(b"Content-Disposition: form-data; name=\"data\"\r\n\r\n");
        m.extend_from_slice(b"1,a\n2,b\n3,c");
        m.extend_from_slice(b"\r\n--9Ab3x--\r\n");
        m
    }

    fn parse_in_chunks(message: &[u8], splits: &[usize]) -> Recorder {
        let mut parser = MultipartParser::new(256);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::default();

        // the terminal boundary may complete before trailing CRLF bytes
        // are fed; stop once the parser reports done
        let mut done = false;
        let mut at = 0;
        for &next in splits {
            if done {
                break;
            }
            done = parser.parse(&message[at..next], &mut rec).unwrap();
            at = next;
        }
        if !done && at < message.len() {
            done = parser.parse(&message[at..], &mut rec).unwrap();
        }
        assert!(done, "message should be fully parsed");
        rec
    }

    fn assert_two_parts(rec: &Recorder) {
        assert_eq!(rec.events, vec!["begin:schema", "end", "begin:data", "end"]);
        assert_eq!(rec.bodies[0], b"col1:INT,col2:STRING");
        assert_eq!(rec.bodies[1], b"1,a\n2,b\n3,c");
    }

    #[test]
    fn test_single_invocation() {
        let rec = parse_in_chunks(&two_part_message(), &[]);
        assert_two_parts(&rec);
    }

    #[test]
    fn test_every_two_way_split() {
        let message = two_part_message();
        for split in 1..message.len() {
            let rec = parse_in_chunks(&message, &[split]);
            assert_two_parts(&rec);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let message = two_part_message();
        let splits: Vec<usize> = (1..message.len()).collect();
        let rec = parse_in_chunks(&message, &splits);
        assert_two_parts(&rec);
    }

    #[test]
    fn test_boundary_straddles_every_position() {
        // split inside the inter-part boundary specifically
        let message = two_part_message();
        let boundary_at = message
            .windows(BOUNDARY.len())
            .position(|w| w == BOUNDARY)
            .unwrap();
        for offset in 0..=BOUNDARY.len() {
            let rec = parse_in_chunks(&message, &[boundary_at + offset]);
            assert_two_parts(&rec);
        }
    }

    #[test]
    fn test_false_boundary_prefix_is_body_content() {
        let mut m = Vec::new();
        m.extend_from_slice(b"--9Ab3x\r\n\r\n");
        // \r\n--9Ab is a boundary prefix, 'Q' breaks it
        m.extend_from_slice(b"before\r\n--9AbQafter");
        m.extend_from_slice(b"\r\n--9Ab3x--\r\n");

        let mut parser = MultipartParser::new(256);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::default();
        assert!(parser.parse(&m, &mut rec).unwrap());
        assert_eq!(rec.bodies[0], b"before\r\n--9AbQafter");
    }

    #[test]
    fn test_false_prefix_split_across_reads() {
        let mut m = Vec::new();
        m.extend_from_slice(b"--9Ab3x\r\n\r\n");
        m.extend_from_slice(b"before\r\n--9AbQafter");
        m.extend_from_slice(b"\r\n--9Ab3x--\r\n");

        // cut in the middle of the false prefix so the parser suspends in
        // PotentialBoundary and must re-emit the prefix on the next call
        let q = m.iter().position(|&b| b == b'Q').unwrap();
        for split in q - 6..=q {
            let rec = parse_in_chunks(&m, &[split]);
            assert_eq!(rec.bodies[0], b"before\r\n--9AbQafter", "split {}", split);
        }
    }

    #[test]
    fn test_empty_multipart_message() {
        let mut parser = MultipartParser::new(256);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::default();
        assert!(parser.parse(b"--9Ab3x--\r\n", &mut rec).unwrap());
        assert!(rec.events.is_empty());
        assert!(rec.bodies.is_empty());
    }

    #[test]
    fn test_done_is_terminal() {
        let mut parser = MultipartParser::new(256);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::default();
        assert!(parser.parse(&two_part_message(), &mut rec).unwrap());
        let before = rec.events.len();
        assert!(parser.parse(b"ignored", &mut rec).unwrap());
        assert_eq!(rec.events.len(), before);
    }

    #[test]
    fn test_malformed_start_boundary() {
        let mut parser = MultipartParser::new(256);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::default();
        let err = parser.parse(b"--WRONG\r\n", &mut rec).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_part_header_overflow_is_fatal() {
        let mut m = Vec::new();
        m.extend_from_slice(b"--9Ab3x\r\n");
        m.extend_from_slice(b"Content-Disposition: form-data; name=\"x\"\r\n\r\nbody");

        let mut parser = MultipartParser::new(16);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::default();
        let err = parser.parse(&m, &mut rec).unwrap_err();
        assert!(matches!(err, Error::HeaderTooLarge { .. }));
    }

    #[test]
    fn test_retry_mid_part_redelivers_from_resume_offset() {
        let message = two_part_message();

        // fail the first delivery of every chunk position in turn
        for fault in 0..4 {
            let mut parser = MultipartParser::new(256);
            parser.bind_boundary(BOUNDARY);
            let mut rec = Recorder::with_fault(fault);

            let mut input = message.clone();
            let mut done = false;
            while !done {
                match parser.parse(&input, &mut rec) {
                    Ok(d) => done = d,
                    Err(Error::RetryOperation) => {
                        // reconstruct the buffer at the resume offset, as
                        // the connection context does after a retry
                        input = input[parser.resume_offset()..].to_vec();
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }

            if rec.bodies.len() == 2 {
                assert_two_parts(&rec);
            } else {
                // fault hit before the second part began; first body intact
                assert_eq!(rec.bodies[0], b"col1:INT,col2:STRING");
            }
        }
    }

    #[test]
    fn test_retry_with_fragmented_redelivery() {
        // fault on the second chunk, then feed the reconstructed stream in
        // two halves to make sure redelivery survives refragmentation
        let message = two_part_message();
        let mut parser = MultipartParser::new(256);
        parser.bind_boundary(BOUNDARY);
        let mut rec = Recorder::with_fault(1);

        let err = parser.parse(&message, &mut rec).unwrap_err();
        assert!(matches!(err, Error::RetryOperation));

        let pending = message[parser.resume_offset()..].to_vec();
        let half = pending.len() / 2;
        let mut done = parser.parse(&pending[..half], &mut rec).unwrap();
        if !done {
            done = parser.parse(&pending[half..], &mut rec).unwrap();
        }
        assert!(done);
        assert_two_parts(&rec);
    }
}
