//! TCP plumbing and the poll-driven serve loop
//!
//! `TcpSocketOps` adapts a non-blocking `TcpStream` to the socket seam the
//! connection contexts consume. `IngestServer` is a single-threaded
//! reference event loop: `poll(2)` for readiness, one context per
//! accepted connection, and a bounded retry queue drained between polls.
//! Production deployments can replace it with their own dispatcher; the
//! contexts only ever see the `Dispatcher`/`Rescheduler` traits.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::http::processor::{ConnToken, Dispatcher, IoOperation, ProcessorSelector};
use crate::http::retry::{Rescheduler, RetryQueue};
use crate::http::{ConnectionContext, IngestConfig, SocketOps};

/// Non-blocking TCP socket adapter.
pub struct TcpSocketOps {
    stream: TcpStream,
}

impl TcpSocketOps {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpSocketOps { stream })
    }

    pub fn raw_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl SocketOps for TcpSocketOps {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }
}

/// Create a non-blocking listener with address reuse.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// What a connection slot is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    None,
    Read,
    Write,
    Close,
}

/// Dispatcher implementation that records registration changes; the serve
/// loop applies them after the context returns.
#[derive(Default)]
pub struct Registrations {
    changes: Vec<(ConnToken, Interest)>,
}

impl Registrations {
    pub fn drain(&mut self) -> std::vec::Drain<'_, (ConnToken, Interest)> {
        self.changes.drain(..)
    }
}

impl Dispatcher for Registrations {
    fn register_read(&mut self, token: ConnToken) {
        self.changes.push((token, Interest::Read));
    }

    fn register_write(&mut self, token: ConnToken) {
        self.changes.push((token, Interest::Write));
    }

    fn disconnect(&mut self, token: ConnToken) {
        self.changes.push((token, Interest::Close));
    }
}

struct Slot {
    ctx: ConnectionContext<TcpSocketOps>,
    fd: i32,
    interest: Interest,
}

/// Single-threaded reference server.
pub struct IngestServer {
    listener: TcpListener,
    config: IngestConfig,
    slots: Vec<Option<Slot>>,
    retry_queue: RetryQueue,
}

impl IngestServer {
    pub fn bind(addr: SocketAddr, config: IngestConfig, retry_capacity: usize) -> io::Result<Self> {
        let listener = bind_listener(addr)?;
        Ok(IngestServer {
            listener,
            config,
            slots: Vec::new(),
            retry_queue: RetryQueue::new(retry_capacity),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `shutdown` flips. Drives readiness events into contexts
    /// and drains the retry queue between polls.
    pub fn serve(&mut self, selector: &mut dyn ProcessorSelector, shutdown: &AtomicBool) {
        info!("serving [addr={:?}]", self.listener.local_addr().ok());
        while !shutdown.load(Ordering::Relaxed) {
            let mut pollfds = vec![libc::pollfd {
                fd: self.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            }];
            let mut owners = vec![usize::MAX];
            for (idx, slot) in self.slots.iter().enumerate() {
                if let Some(slot) = slot {
                    let events = match slot.interest {
                        Interest::Read => libc::POLLIN,
                        Interest::Write => libc::POLLOUT,
                        _ => continue,
                    };
                    pollfds.push(libc::pollfd {
                        fd: slot.fd,
                        events,
                        revents: 0,
                    });
                    owners.push(idx);
                }
            }

            let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, 10) };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed: {}", e);
                break;
            }

            if pollfds[0].revents & libc::POLLIN != 0 {
                self.accept_ready();
            }

            for k in 1..pollfds.len() {
                if pollfds[k].revents == 0 {
                    continue;
                }
                let idx = owners[k];
                let op = if pollfds[k].revents & libc::POLLOUT != 0 {
                    IoOperation::Write
                } else {
                    // POLLIN, POLLHUP and POLLERR all surface through a recv
                    IoOperation::Read
                };
                let mut regs = Registrations::default();
                if let Some(slot) = self.slots[idx].as_mut() {
                    slot.interest = Interest::None;
                    slot.ctx
                        .handle_client_operation(op, selector, &mut regs, &mut self.retry_queue);
                }
                self.apply(&mut regs);
            }

            self.drain_retries(selector);
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match TcpSocketOps::new(stream) {
                    Ok(socket) => {
                        let fd = socket.raw_fd();
                        let idx = self.free_slot();
                        let mut ctx = ConnectionContext::new(ConnToken(idx), &self.config);
                        ctx.bind(socket);
                        self.slots[idx] = Some(Slot {
                            ctx,
                            fd,
                            interest: Interest::Read,
                        });
                        debug!("accepted connection [peer={}, token={}]", peer, idx);
                    }
                    Err(e) => warn!("dropping connection [peer={}, error={}]", peer, e),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn drain_retries(&mut self, selector: &mut dyn ProcessorSelector) {
        let mut still_blocked = Vec::new();
        while let Some((token, _attrs)) = self.retry_queue.next() {
            let mut regs = Registrations::default();
            let done = match self.slots.get_mut(token.0).and_then(Option::as_mut) {
                Some(slot) => slot.ctx.try_rerun(selector, &mut regs),
                None => true,
            };
            self.apply(&mut regs);
            if !done {
                still_blocked.push(token);
            }
        }
        for token in still_blocked {
            if let Err(e) = self.retry_queue.reschedule(token) {
                // queue saturated: the request fails visibly instead of
                // waiting forever
                let mut regs = Registrations::default();
                if let Some(slot) = self.slots.get_mut(token.0).and_then(Option::as_mut) {
                    slot.ctx.fail(&e, selector, &mut regs);
                }
                self.apply(&mut regs);
            }
        }
    }

    fn apply(&mut self, regs: &mut Registrations) {
        let changes: Vec<_> = regs.drain().collect();
        for (token, interest) in changes {
            match interest {
                Interest::Close => self.close_slot(token),
                other => {
                    if let Some(slot) = self.slots.get_mut(token.0).and_then(Option::as_mut) {
                        slot.interest = other;
                    }
                }
            }
        }
    }

    fn close_slot(&mut self, token: ConnToken) {
        if let Some(slot) = self.slots.get_mut(token.0).and_then(Option::take) {
            let mut ctx = slot.ctx;
            if let Some(socket) = ctx.unbind() {
                socket.shutdown();
            }
            self.retry_queue.remove(token);
            debug!("closed connection [token={}]", token.0);
        }
    }

    fn free_slot(&mut self) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_is_nonblocking() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
        // no pending connection: accept must not block
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_registrations_record_in_order() {
        let mut regs = Registrations::default();
        regs.register_read(ConnToken(1));
        regs.register_write(ConnToken(2));
        regs.disconnect(ConnToken(1));

        let changes: Vec<_> = regs.drain().collect();
        assert_eq!(
            changes,
            vec![
                (ConnToken(1), Interest::Read),
                (ConnToken(2), Interest::Write),
                (ConnToken(1), Interest::Close),
            ]
        );
    }
}
