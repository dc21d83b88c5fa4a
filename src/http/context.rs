//! Per-connection request/response state machine
//!
//! One `ConnectionContext` exists per pooled connection slot. The event
//! loop hands it readiness events via `handle_client_operation`; the
//! context drives header parsing, multipart streaming, processor callbacks
//! and response writing until the request completes or must suspend.
//!
//! A context is in exactly one of four modes at any time: idle,
//! awaiting-read, awaiting-write (a send blocked mid-response) or
//! awaiting-retry (parked on the reschedule queue after a transient
//! backend conflict). Every suspension re-enters the flow at the exact
//! step it left off.

use log::{debug, error, info};

use super::multipart::MultipartParser;
use super::parser::HeaderParser;
use super::processor::{ConnToken, Dispatcher, IoOperation, ProcessorSelector, RequestProcessor};
use super::response::{Reply, ResponseSink};
use super::retry::Rescheduler;
use super::{Error, Result, SocketOps};

/// Buffer and behavior limits for the ingestion layer.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Capacity for the request header block.
    pub header_buffer_size: usize,
    /// Capacity for each multipart part's header block.
    pub multipart_header_buffer_size: usize,
    /// Receive buffer capacity per connection.
    pub recv_buffer_size: usize,
    /// Process further requests on the same connection after completion.
    pub keep_alive: bool,
    /// How many empty reads to spin through mid-multipart before yielding
    /// back to the dispatcher. Bounded busy-wait trades a little CPU for
    /// not re-entering the event loop between closely spaced packets.
    pub multipart_idle_spin_count: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            header_buffer_size: 4096,
            multipart_header_buffer_size: 1024,
            recv_buffer_size: 8192,
            keep_alive: true,
            multipart_idle_spin_count: 10_000,
        }
    }
}

enum Recv {
    Data(usize),
    WouldBlock,
    Closed,
}

enum MultipartProgress {
    /// Terminal boundary seen; the request body is fully streamed.
    Complete,
    /// Out of input; the caller registers for read readiness.
    AwaitingRead,
}

/// Per-connection state machine
///
/// Generic over the socket so tests can script one; the rest of the
/// collaborators are trait objects resolved per call, which keeps the
/// context free of references into the selector or queues.
pub struct ConnectionContext<S: SocketOps> {
    token: ConnToken,
    socket: Option<S>,
    keep_alive: bool,
    idle_spin_count: u32,

    recv_buffer: Box<[u8]>,
    header_parser: HeaderParser,
    multipart: MultipartParser,
    sink: ResponseSink,

    /// URL of the in-flight request, kept for re-resolving the processor
    /// on resume paths.
    current_url: Option<String>,
    /// A multipart body is in flight; read events continue it.
    receiving_multipart: bool,
    /// A send blocked; the processor is parked awaiting writability.
    parked_for_write: bool,
    /// Parked on the reschedule queue.
    pending_retry: bool,
    /// The retry was raised inside the multipart parse, so the rerun must
    /// re-drive the parser over the carried bytes below.
    multipart_retry: bool,
    /// Unconsumed multipart bytes shifted to the front of the receive
    /// buffer while a retry is pending.
    carried_bytes: usize,

    completed_requests: u64,
    total_bytes_sent: u64,
}

impl<S: SocketOps> ConnectionContext<S> {
    pub fn new(token: ConnToken, config: &IngestConfig) -> Self {
        ConnectionContext {
            token,
            socket: None,
            keep_alive: config.keep_alive,
            idle_spin_count: config.multipart_idle_spin_count,
            recv_buffer: vec![0u8; config.recv_buffer_size].into_boxed_slice(),
            header_parser: HeaderParser::new(config.header_buffer_size),
            multipart: MultipartParser::new(config.multipart_header_buffer_size),
            sink: ResponseSink::new(),
            current_url: None,
            receiving_multipart: false,
            parked_for_write: false,
            pending_retry: false,
            multipart_retry: false,
            carried_bytes: 0,
            completed_requests: 0,
            total_bytes_sent: 0,
        }
    }

    pub fn token(&self) -> ConnToken {
        self.token
    }

    /// True while no socket is bound; events on an invalid context are
    /// ignored.
    pub fn invalid(&self) -> bool {
        self.socket.is_none()
    }

    pub fn completed_requests(&self) -> u64 {
        self.completed_requests
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    /// Bind a freshly accepted socket to this slot. All request state and
    /// counters reset; the receive buffer is reused as-is.
    pub fn bind(&mut self, socket: S) {
        self.clear();
        self.completed_requests = 0;
        self.total_bytes_sent = 0;
        self.socket = Some(socket);
    }

    /// Release the socket, leaving the slot reusable via `bind`.
    pub fn unbind(&mut self) -> Option<S> {
        self.clear();
        self.socket.take()
    }

    /// Reset all per-request state.
    pub fn clear(&mut self) {
        self.clear_request();
        self.pending_retry = false;
    }

    /// Entry point for the event loop: drive the connection as far as it
    /// will go for one readiness event. After a synchronous completion on
    /// a keep-alive connection the next request is attempted immediately,
    /// without returning to the dispatcher.
    pub fn handle_client_operation(
        &mut self,
        operation: IoOperation,
        selector: &mut dyn ProcessorSelector,
        dispatcher: &mut dyn Dispatcher,
        rescheduler: &mut dyn Rescheduler,
    ) {
        let mut keep_going = match operation {
            IoOperation::Read => self.handle_client_recv(selector, dispatcher, rescheduler),
            IoOperation::Write => self.handle_client_send(selector, dispatcher, rescheduler),
        };
        while keep_going {
            keep_going = self.handle_client_recv(selector, dispatcher, rescheduler);
        }
    }

    /// Rerun entry point, invoked by the retry queue owner. Returns false
    /// when the request is still blocked on the backend and must be
    /// requeued; true in every other case (completed, suspended elsewhere
    /// or torn down).
    pub fn try_rerun(
        &mut self,
        selector: &mut dyn ProcessorSelector,
        dispatcher: &mut dyn Dispatcher,
    ) -> bool {
        if self.invalid() || !self.pending_retry {
            return true;
        }
        self.pending_retry = false;
        let url = self.resolved_url();
        let processor = selector.select(&url);
        debug!("rerunning request [token={}, url={}]", self.token.0, url);

        // the retry entry point runs first, whatever phase the request
        // was suspended in, so the processor can re-acquire its backend
        let entered = match self.socket.as_mut() {
            Some(socket) => processor.on_request_retry(Reply::new(&mut self.sink, socket)),
            None => return true,
        };
        if let Err(e) = entered {
            return match e {
                Error::RetryOperation => {
                    // carried bytes stay put for the next rerun
                    self.pending_retry = true;
                    false
                }
                e => {
                    self.react(e, processor, dispatcher);
                    true
                }
            };
        }

        let outcome = if self.multipart_retry {
            self.multipart_retry = false;
            let carried = std::mem::take(&mut self.carried_bytes);
            match self.consume_multipart(processor, 0, carried) {
                Ok(MultipartProgress::Complete) => self
                    .complete_request(processor)
                    .map(|_| MultipartProgress::Complete),
                other => other,
            }
        } else {
            self.complete_request(processor)
                .map(|_| MultipartProgress::Complete)
        };

        match outcome {
            Ok(MultipartProgress::Complete) => {
                self.finish_request();
                if self.keep_alive {
                    dispatcher.register_read(self.token);
                } else {
                    dispatcher.disconnect(self.token);
                }
                true
            }
            Ok(MultipartProgress::AwaitingRead) => {
                dispatcher.register_read(self.token);
                true
            }
            Err(Error::RetryOperation) => {
                // drive_multipart re-captured the resume coordinates
                self.pending_retry = true;
                false
            }
            Err(e) => {
                self.react(e, processor, dispatcher);
                true
            }
        }
    }

    /// Fail the in-flight request from outside the normal event flow, for
    /// example when the reschedule queue cannot take the connection back.
    /// Suspension signals are not failures and are ignored.
    pub fn fail(
        &mut self,
        error: &Error,
        selector: &mut dyn ProcessorSelector,
        dispatcher: &mut dyn Dispatcher,
    ) {
        if self.invalid() || !error.is_terminal() {
            return;
        }
        self.pending_retry = false;
        let url = self.resolved_url();
        let processor = selector.select(&url);
        self.do_fail(error, processor, dispatcher);
    }

    // Returns true when a request completed synchronously and the
    // keep-alive loop should immediately attempt the next one.
    fn handle_client_recv(
        &mut self,
        selector: &mut dyn ProcessorSelector,
        dispatcher: &mut dyn Dispatcher,
        rescheduler: &mut dyn Rescheduler,
    ) -> bool {
        if self.invalid() || self.pending_retry || self.parked_for_write {
            return false;
        }

        // continuation of an in-flight multipart body; carried bytes are
        // the tail a listener has not accepted yet
        if !self.header_parser.is_incomplete() && self.receiving_multipart {
            let url = self.resolved_url();
            let processor = selector.select(&url);
            let carried = std::mem::take(&mut self.carried_bytes);
            return self.drive_multipart_to_completion(processor, 0, carried, dispatcher, rescheduler);
        }

        // header phase; body bytes read alongside the final header chunk
        // stay in [body_start, body_high)
        let mut body_start = 0;
        let mut body_high = 0;
        while self.header_parser.is_incomplete() {
            match self.recv_some(0) {
                Err(e) => {
                    self.react(e, selector.select("/"), dispatcher);
                    return false;
                }
                Ok(Recv::Closed) => {
                    debug!("peer disconnected mid-headers [token={}]", self.token.0);
                    self.teardown(dispatcher);
                    return false;
                }
                Ok(Recv::WouldBlock) => {
                    dispatcher.register_read(self.token);
                    return false;
                }
                Ok(Recv::Data(n)) => {
                    let consumed = match self.header_parser.parse(&self.recv_buffer[..n], true) {
                        Ok(c) => c,
                        Err(e) => return self.reject_malformed(&e, dispatcher),
                    };
                    if !self.header_parser.is_incomplete() {
                        body_start = consumed;
                        body_high = n;
                    }
                }
            }
        }

        let url = self.header_parser.url().unwrap_or("/").to_string();
        self.current_url = Some(url.clone());
        let processor = selector.select(&url);

        let boundary = self.header_parser.boundary();
        let is_multipart =
            self.header_parser.content_type() == Some("multipart/form-data") && boundary.is_some();
        let wants_multipart = processor.multipart_listener().is_some();

        if is_multipart != wants_multipart {
            let reason = if wants_multipart {
                "Bad request. Multipart POST expected."
            } else {
                "Bad request. Non-multipart request expected."
            };
            return self.reject_request(400, reason, dispatcher);
        }

        if let Some(boundary) = boundary {
            self.multipart.clear();
            self.multipart.bind_boundary(&boundary);
            self.receiving_multipart = true;
            if let Err(e) = processor.on_headers_ready(&self.header_parser) {
                return self.react(e, processor, dispatcher);
            }
            return self.drive_multipart_to_completion(
                processor,
                body_start,
                body_high,
                dispatcher,
                rescheduler,
            );
        }

        // a request with no body must not be followed by unsolicited
        // bytes; either in the same read or waiting on the socket
        if body_high > body_start {
            debug!("unexpected bytes after request [token={}]", self.token.0);
            self.teardown(dispatcher);
            return false;
        }
        if let Err(e) = self.probe_extra_byte() {
            return self.react(e, processor, dispatcher);
        }

        if let Err(e) = processor.on_headers_ready(&self.header_parser) {
            return self.react(e, processor, dispatcher);
        }
        match self.complete_request(processor) {
            Ok(()) => {
                self.finish_request();
                self.continue_or_close(dispatcher)
            }
            Err(Error::RetryOperation) => {
                self.schedule_retry(processor, dispatcher, rescheduler);
                false
            }
            Err(e) => self.react(e, processor, dispatcher),
        }
    }

    fn handle_client_send(
        &mut self,
        selector: &mut dyn ProcessorSelector,
        dispatcher: &mut dyn Dispatcher,
        rescheduler: &mut dyn Rescheduler,
    ) -> bool {
        if self.invalid() || !self.parked_for_write {
            return false;
        }

        let flushed = match self.socket.as_mut() {
            Some(socket) => self.sink.resume_send(socket),
            None => return false,
        };
        match flushed {
            Ok(()) => {
                self.parked_for_write = false;
                let url = self.resolved_url();
                let processor = selector.select(&url);
                let outcome = match self.socket.as_mut() {
                    Some(socket) => processor.resume_send(Reply::new(&mut self.sink, socket)),
                    None => return false,
                };
                match outcome {
                    Ok(()) => {
                        self.finish_request();
                        self.keep_alive
                    }
                    Err(Error::RetryOperation) => {
                        self.schedule_retry(processor, dispatcher, rescheduler);
                        false
                    }
                    Err(e) => self.react(e, processor, dispatcher),
                }
            }
            Err(Error::PeerIsSlowToRead) => {
                dispatcher.register_write(self.token);
                false
            }
            Err(e) => {
                debug!("send failed [token={}, error={}]", self.token.0, e);
                self.teardown(dispatcher);
                false
            }
        }
    }

    // Parse buffered bytes, then keep receiving until the terminal
    // boundary, a suspension or an error. When a listener needs a larger
    // contiguous chunk than one read produced, the undelivered tail is
    // retained at the front of the buffer and later reads append after
    // it, so the chunk grows until it is accepted or fills the buffer.
    fn consume_multipart(
        &mut self,
        processor: &mut dyn RequestProcessor,
        mut start: usize,
        mut high: usize,
    ) -> Result<MultipartProgress> {
        processor.resume_recv();
        let mut spins: u32 = 0;
        loop {
            if high > start {
                match self.drive_multipart(processor, start, high) {
                    Ok(true) => return Ok(MultipartProgress::Complete),
                    Ok(false) => {
                        start = 0;
                        high = 0;
                    }
                    Err(Error::ReceiveBufferTooSmall) => {
                        let resume = start + self.multipart.resume_offset();
                        if high - resume >= self.recv_buffer.len() {
                            // undelivered span already fills the buffer
                            return Err(Error::ReceiveBufferTooSmall);
                        }
                        self.recv_buffer.copy_within(resume..high, 0);
                        high -= resume;
                        start = 0;
                    }
                    Err(e) => return Err(e),
                }
            }
            let n = loop {
                match self.recv_some(high)? {
                    Recv::Closed => return Err(Error::PeerDisconnected),
                    Recv::Data(n) => break n,
                    Recv::WouldBlock => {
                        spins += 1;
                        if spins > self.idle_spin_count {
                            self.carried_bytes = high;
                            return Ok(MultipartProgress::AwaitingRead);
                        }
                    }
                }
            };
            spins = 0;
            high += n;
        }
    }

    // One parse pass over recv_buffer[start..high]. On a transient
    // backend conflict the undelivered tail is shifted to the front of
    // the buffer so the rerun can re-parse it from offset zero.
    fn drive_multipart(
        &mut self,
        processor: &mut dyn RequestProcessor,
        start: usize,
        high: usize,
    ) -> Result<bool> {
        let listener = processor
            .multipart_listener()
            .ok_or_else(|| Error::Protocol("processor does not accept multipart".to_string()))?;
        match self.multipart.parse(&self.recv_buffer[start..high], listener) {
            Ok(done) => Ok(done),
            Err(Error::RetryOperation) => {
                let resume = start + self.multipart.resume_offset();
                self.recv_buffer.copy_within(resume..high, 0);
                self.carried_bytes = high - resume;
                self.multipart_retry = true;
                Err(Error::RetryOperation)
            }
            Err(e) => Err(e),
        }
    }

    fn drive_multipart_to_completion(
        &mut self,
        processor: &mut dyn RequestProcessor,
        start: usize,
        high: usize,
        dispatcher: &mut dyn Dispatcher,
        rescheduler: &mut dyn Rescheduler,
    ) -> bool {
        match self.consume_multipart(processor, start, high) {
            Ok(MultipartProgress::Complete) => match self.complete_request(processor) {
                Ok(()) => {
                    self.finish_request();
                    self.continue_or_close(dispatcher)
                }
                Err(Error::RetryOperation) => {
                    self.schedule_retry(processor, dispatcher, rescheduler);
                    false
                }
                Err(e) => self.react(e, processor, dispatcher),
            },
            Ok(MultipartProgress::AwaitingRead) => {
                dispatcher.register_read(self.token);
                false
            }
            Err(Error::RetryOperation) => {
                self.schedule_retry(processor, dispatcher, rescheduler);
                false
            }
            Err(e) => self.react(e, processor, dispatcher),
        }
    }

    fn complete_request(&mut self, processor: &mut dyn RequestProcessor) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(Error::ServerDisconnect)?;
        processor.on_request_complete(Reply::new(&mut self.sink, socket))
    }

    fn finish_request(&mut self) {
        self.completed_requests += 1;
        self.total_bytes_sent += self.sink.bytes_sent();
        debug!(
            "request complete [token={}, completed={}]",
            self.token.0, self.completed_requests
        );
        self.clear_request();
    }

    fn continue_or_close(&mut self, dispatcher: &mut dyn Dispatcher) -> bool {
        if self.keep_alive {
            true
        } else {
            self.teardown(dispatcher);
            false
        }
    }

    // Branch on a processing outcome. Suspension signals re-arm the
    // relevant registration; everything else goes through the one
    // failure/teardown path.
    fn react(
        &mut self,
        e: Error,
        processor: &mut dyn RequestProcessor,
        dispatcher: &mut dyn Dispatcher,
    ) -> bool {
        match e {
            Error::PeerIsSlowToRead => {
                processor.park_request();
                self.parked_for_write = true;
                dispatcher.register_write(self.token);
            }
            Error::PeerDisconnected | Error::ServerDisconnect => {
                debug!("closing connection [token={}, reason={}]", self.token.0, e);
                self.teardown(dispatcher);
            }
            e => {
                self.do_fail(&e, processor, dispatcher);
            }
        }
        false
    }

    fn schedule_retry(
        &mut self,
        processor: &mut dyn RequestProcessor,
        dispatcher: &mut dyn Dispatcher,
        rescheduler: &mut dyn Rescheduler,
    ) {
        self.pending_retry = true;
        if let Err(e) = rescheduler.reschedule(self.token) {
            info!("retry rejected [token={}, error={}]", self.token.0, e);
            self.pending_retry = false;
            self.do_fail(&e, processor, dispatcher);
        }
    }

    // The only path that both notifies the processor of failure and
    // disconnects; used by direct failures and retry exhaustion alike.
    fn do_fail(
        &mut self,
        e: &Error,
        processor: &mut dyn RequestProcessor,
        dispatcher: &mut dyn Dispatcher,
    ) {
        error!("request failed [token={}, error={}]", self.token.0, e);
        if let Some(socket) = self.socket.as_mut() {
            if let Err(next) = processor.fail_request(Reply::new(&mut self.sink, socket), e) {
                debug!("failure response not delivered [token={}, error={}]", self.token.0, next);
            }
        }
        self.teardown(dispatcher);
    }

    // Header-phase framing errors have no resolved processor yet; answer
    // with a 400 directly, then tear down.
    fn reject_malformed(&mut self, e: &Error, dispatcher: &mut dyn Dispatcher) -> bool {
        error!("malformed request [token={}, error={}]", self.token.0, e);
        if let Some(socket) = self.socket.as_mut() {
            if let Err(send_err) = self.sink.send_simple(socket, 400, &e.to_string()) {
                debug!("rejection not delivered [token={}, error={}]", self.token.0, send_err);
            }
        }
        self.teardown(dispatcher);
        false
    }

    // Protocol rejection that keeps the connection open for the next
    // request.
    fn reject_request(&mut self, status: u16, reason: &str, dispatcher: &mut dyn Dispatcher) -> bool {
        info!("rejecting request [token={}, status={}, reason={}]", self.token.0, status, reason);
        let sent = match self.socket.as_mut() {
            Some(socket) => self.sink.send_simple(socket, status, reason),
            None => return false,
        };
        match sent {
            Ok(()) => {
                self.clear_request();
                dispatcher.register_read(self.token);
            }
            Err(e) => {
                debug!("rejection not delivered [token={}, error={}]", self.token.0, e);
                self.teardown(dispatcher);
            }
        }
        false
    }

    fn teardown(&mut self, dispatcher: &mut dyn Dispatcher) {
        self.clear();
        dispatcher.disconnect(self.token);
    }

    fn clear_request(&mut self) {
        self.header_parser.clear();
        self.multipart.clear();
        self.sink.clear();
        self.current_url = None;
        self.receiving_multipart = false;
        self.parked_for_write = false;
        self.multipart_retry = false;
        self.carried_bytes = 0;
    }

    fn resolved_url(&self) -> String {
        self.current_url.clone().unwrap_or_else(|| "/".to_string())
    }

    fn recv_some(&mut self, at: usize) -> Result<Recv> {
        if at >= self.recv_buffer.len() {
            return Err(Error::ReceiveBufferTooSmall);
        }
        let socket = self.socket.as_mut().ok_or(Error::ServerDisconnect)?;
        match socket.recv(&mut self.recv_buffer[at..]) {
            Ok(0) => Ok(Recv::Closed),
            Ok(n) => Ok(Recv::Data(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(Recv::WouldBlock),
            Err(e)
                if e.kind() == std::io::ErrorKind::ConnectionReset
                    || e.kind() == std::io::ErrorKind::BrokenPipe =>
            {
                Ok(Recv::Closed)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    // A bodyless request on a keep-alive connection must leave the socket
    // empty until the response goes out; anything already waiting is
    // protocol abuse.
    fn probe_extra_byte(&mut self) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(Error::ServerDisconnect)?;
        let mut probe = [0u8; 1];
        match socket.recv(&mut probe) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Ok(0) => Err(Error::PeerDisconnected),
            Ok(_) => {
                debug!("unsolicited bytes after bodyless request [token={}]", self.token.0);
                Err(Error::ServerDisconnect)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}
