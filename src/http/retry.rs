//! Retry rescheduling
//!
//! When a processor reports `RetryOperation` the connection context parks
//! the request and hands its token to a [`Rescheduler`]. The event loop
//! later pops parked tokens and drives `ConnectionContext::try_rerun`.
//! A rescheduler that cannot accept the token reports `RetryFailed`,
//! which the context turns into a failure response.

use std::collections::VecDeque;
use std::time::Instant;

use super::processor::ConnToken;
use super::{Error, Result};

/// Bookkeeping for one parked request.
#[derive(Debug, Clone, Copy)]
pub struct RetryAttemptAttributes {
    /// When the request first entered the queue.
    pub wait_start: Instant,
    /// When the request was last handed back for a rerun.
    pub last_run: Instant,
    /// Number of reruns so far.
    pub attempt: u32,
}

impl RetryAttemptAttributes {
    fn first() -> Self {
        let now = Instant::now();
        RetryAttemptAttributes {
            wait_start: now,
            last_run: now,
            attempt: 0,
        }
    }
}

/// Accepts parked requests for later rerun.
pub trait Rescheduler {
    /// Park `token` for a later rerun. `Err(RetryFailed)` means the request
    /// cannot be parked and must fail now.
    fn reschedule(&mut self, token: ConnToken) -> Result<()>;
}

/// Bounded FIFO retry queue.
///
/// Requeueing a token that is already parked keeps its queue position and
/// bumps the attempt counter instead of consuming another slot.
pub struct RetryQueue {
    capacity: usize,
    entries: VecDeque<(ConnToken, RetryAttemptAttributes)>,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        RetryQueue {
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop the next parked token, oldest first.
    pub fn next(&mut self) -> Option<(ConnToken, RetryAttemptAttributes)> {
        self.entries.pop_front()
    }

    /// Drop a parked token, typically because its connection went away.
    pub fn remove(&mut self, token: ConnToken) {
        self.entries.retain(|(t, _)| *t != token);
    }

    pub fn attributes(&self, token: ConnToken) -> Option<&RetryAttemptAttributes> {
        self.entries.iter().find(|(t, _)| *t == token).map(|(_, a)| a)
    }
}

impl Rescheduler for RetryQueue {
    fn reschedule(&mut self, token: ConnToken) -> Result<()> {
        if let Some((_, attrs)) = self.entries.iter_mut().find(|(t, _)| *t == token) {
            attrs.attempt += 1;
            attrs.last_run = Instant::now();
            return Ok(());
        }
        if self.entries.len() == self.capacity {
            return Err(Error::RetryFailed("retry queue is full".into()));
        }
        self.entries
            .push_back((token, RetryAttemptAttributes::first()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut q = RetryQueue::new(4);
        q.reschedule(ConnToken(3)).unwrap();
        q.reschedule(ConnToken(1)).unwrap();
        q.reschedule(ConnToken(2)).unwrap();

        assert_eq!(q.next().unwrap().0, ConnToken(3));
        assert_eq!(q.next().unwrap().0, ConnToken(1));
        assert_eq!(q.next().unwrap().0, ConnToken(2));
        assert!(q.next().is_none());
    }

    #[test]
    fn test_saturation_rejects() {
        let mut q = RetryQueue::new(2);
        q.reschedule(ConnToken(1)).unwrap();
        q.reschedule(ConnToken(2)).unwrap();

        let err = q.reschedule(ConnToken(3)).unwrap_err();
        assert!(matches!(err, Error::RetryFailed(_)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_requeue_bumps_attempt_without_new_slot() {
        let mut q = RetryQueue::new(2);
        q.reschedule(ConnToken(1)).unwrap();
        q.reschedule(ConnToken(2)).unwrap();

        // full, but an already-parked token is still accepted
        q.reschedule(ConnToken(1)).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.attributes(ConnToken(1)).unwrap().attempt, 1);
        assert_eq!(q.attributes(ConnToken(2)).unwrap().attempt, 0);
    }

    #[test]
    fn test_remove_disconnected() {
        let mut q = RetryQueue::new(4);
        q.reschedule(ConnToken(1)).unwrap();
        q.reschedule(ConnToken(2)).unwrap();
        q.remove(ConnToken(1));

        assert_eq!(q.len(), 1);
        assert_eq!(q.next().unwrap().0, ConnToken(2));
    }
}
