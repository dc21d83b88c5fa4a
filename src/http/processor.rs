//! Request processing contracts
//!
//! The connection context is generic over three collaborators it never
//! implements itself: the readiness dispatcher, the reschedule queue (see
//! `retry`), and the request processor - the business logic invoked as a
//! callback once headers are ready. Multipart-capable processors
//! additionally expose a [`MultipartListener`](super::MultipartListener).

use std::collections::HashMap;

use super::multipart::MultipartListener;
use super::parser::HeaderParser;
use super::response::Reply;
use super::{Error, Result};

/// Opaque connection identity handed to the dispatcher and retry queue.
/// Typically a slot index or file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken(pub usize);

/// Readiness event kinds delivered by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    Read,
    Write,
}

/// Socket readiness dispatcher contract (consumed, never implemented here).
pub trait Dispatcher {
    /// Wake this connection when its socket becomes readable.
    fn register_read(&mut self, token: ConnToken);
    /// Wake this connection when its socket becomes writable.
    fn register_write(&mut self, token: ConnToken);
    /// Tear the connection down.
    fn disconnect(&mut self, token: ConnToken);
}

/// Request-specific business logic.
///
/// Any method returning `Result` may report the control signals from
/// [`Error`]: `RetryOperation` suspends the request onto the reschedule
/// queue, `PeerIsSlowToRead` parks it awaiting write readiness, and
/// `PeerDisconnected`/`ServerDisconnect` tear the connection down.
pub trait RequestProcessor {
    /// Called once the request header block is complete.
    fn on_headers_ready(&mut self, request: &HeaderParser) -> Result<()> {
        let _ = request;
        Ok(())
    }

    /// Called when the request (including any multipart body) is complete.
    /// This is where the response is produced.
    fn on_request_complete(&mut self, reply: Reply<'_>) -> Result<()>;

    /// Called first on every rerun when backend capacity may be available
    /// again, before any suspended multipart body is re-driven; the place
    /// to re-acquire whatever resource was contended. Response production
    /// stays in `on_request_complete`, which still runs once the request
    /// finishes.
    fn on_request_retry(&mut self, reply: Reply<'_>) -> Result<()> {
        let _ = reply;
        Ok(())
    }

    /// Called when the receive side of a multipart transfer resumes.
    fn resume_recv(&mut self) {}

    /// Continue producing a response after a write-readiness suspension.
    fn resume_send(&mut self, reply: Reply<'_>) -> Result<()> {
        let _ = reply;
        Ok(())
    }

    /// The request was suspended awaiting write readiness.
    fn park_request(&mut self) {}

    /// The request failed; send a failure response if none has started.
    /// This is the last callback before the connection is torn down.
    fn fail_request(&mut self, mut reply: Reply<'_>, error: &Error) -> Result<()> {
        if reply.response_started() {
            // nothing well-formed can be appended to a partial response
            return Ok(());
        }
        reply.send_status(500, &error.to_string())
    }

    /// Multipart capability probe: processors that stream multipart bodies
    /// return their listener here.
    fn multipart_listener(&mut self) -> Option<&mut dyn MultipartListener> {
        None
    }
}

/// Resolves a processor for a request URL. Implementations fall back to a
/// default processor for unknown URLs, so resolution never fails.
pub trait ProcessorSelector {
    fn select(&mut self, url: &str) -> &mut dyn RequestProcessor;
}

/// Registered-table processor lookup with a default fallback.
pub struct ProcessorRegistry {
    routes: HashMap<String, Box<dyn RequestProcessor>>,
    default: Box<dyn RequestProcessor>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        ProcessorRegistry {
            routes: HashMap::new(),
            default: Box::new(NotFoundProcessor),
        }
    }

    pub fn register(&mut self, url: impl Into<String>, processor: Box<dyn RequestProcessor>) {
        self.routes.insert(url.into(), processor);
    }

    pub fn set_default(&mut self, processor: Box<dyn RequestProcessor>) {
        self.default = processor;
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorSelector for ProcessorRegistry {
    fn select(&mut self, url: &str) -> &mut dyn RequestProcessor {
        if self.routes.contains_key(url) {
            self.routes.get_mut(url).unwrap().as_mut()
        } else {
            self.default.as_mut()
        }
    }
}

/// Default processor: responds 404 to anything.
struct NotFoundProcessor;

impl RequestProcessor for NotFoundProcessor {
    fn on_request_complete(&mut self, mut reply: Reply<'_>) -> Result<()> {
        reply.send_status(404, "Not Found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ResponseSink;
    use crate::http::SocketOps;
    use std::io;

    struct Sink(Vec<u8>);

    impl SocketOps for Sink {
        fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    struct Tagged(&'static str);

    impl RequestProcessor for Tagged {
        fn on_request_complete(&mut self, mut reply: Reply<'_>) -> Result<()> {
            reply.send_status(200, self.0)
        }
    }

    fn run(selector: &mut dyn ProcessorSelector, url: &str) -> String {
        let mut sink = ResponseSink::new();
        let mut socket = Sink(Vec::new());
        let processor = selector.select(url);
        processor
            .on_request_complete(Reply::new(&mut sink, &mut socket))
            .unwrap();
        String::from_utf8(socket.0).unwrap()
    }

    #[test]
    fn test_registry_routes_by_url() {
        let mut registry = ProcessorRegistry::new();
        registry.register("/imp", Box::new(Tagged("import")));
        registry.register("/exec", Box::new(Tagged("exec")));

        assert!(run(&mut registry, "/imp").ends_with("import"));
        assert!(run(&mut registry, "/exec").ends_with("exec"));
    }

    #[test]
    fn test_registry_falls_back_to_default() {
        let mut registry = ProcessorRegistry::new();
        registry.register("/imp", Box::new(Tagged("import")));

        let text = run(&mut registry, "/nope");
        assert!(text.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn test_default_fail_request_sends_500_once() {
        let mut p = Tagged("x");
        let mut sink = ResponseSink::new();
        let mut socket = Sink(Vec::new());
        p.fail_request(
            Reply::new(&mut sink, &mut socket),
            &Error::Protocol("bad".into()),
        )
        .unwrap();
        assert!(String::from_utf8(socket.0).unwrap().starts_with("HTTP/1.1 500"));

        // once a response has started, nothing further is appended
        let mut socket2 = Sink(Vec::new());
        p.fail_request(
            Reply::new(&mut sink, &mut socket2),
            &Error::Protocol("bad".into()),
        )
        .unwrap();
        assert!(socket2.0.is_empty());
    }
}
