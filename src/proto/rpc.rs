//! In-flight request/response correlation.
//!
//! Every request that expects a correlated response is pushed onto a FIFO
//! queue of descriptors. The server answers in submission order, so a
//! response naming any queued expectation must match the queue head;
//! anything else is a protocol violation that kills the connection.

use std::collections::VecDeque;

use crate::error::{Error, Protocol};

/// An in-flight request awaiting its correlated response.
pub(crate) trait InFlight {
    /// The response command name this request is waiting for.
    fn expects(&self) -> &'static str;

    /// Consume the descriptor, rejecting its caller with `error`.
    fn reject(self, error: Error);
}

/// FIFO queue of in-flight requests with head-matching discipline.
pub(crate) struct RpcQueue<T> {
    queue: VecDeque<T>,
}

impl<T: InFlight> RpcQueue<T> {
    pub(crate) fn new() -> RpcQueue<T> {
        RpcQueue {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, rpc: T) {
        self.queue.push_back(rpc);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take the head descriptor for a response named `received`.
    ///
    /// A response frame only reaches this point when it is an RPC reply
    /// rather than an asynchronous notification; if the head is waiting for
    /// something else (or nothing is outstanding at all), the server has
    /// answered out of order.
    pub(crate) fn take_head(&mut self, received: &'static str) -> Result<T, Error> {
        match self.queue.front() {
            Some(head) if head.expects() == received => {
                Ok(self.queue.pop_front().expect("front() was Some"))
            }
            Some(head) => Err(Protocol::UnexpectedResponse {
                expected: head.expects(),
                received,
            }
            .into()),
            None => Err(Protocol::UnexpectedResponse {
                expected: "nothing",
                received,
            }
            .into()),
        }
    }

    /// Take the oldest outstanding request, if any, without matching.
    ///
    /// For rejection paths where the caller owes extra bookkeeping (e.g.
    /// rolling back a uniqueness reservation) before consuming the entry.
    pub(crate) fn pop_front(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Reject the head request (a server `ERROR` correlates with the oldest
    /// outstanding request). Returns false if nothing was outstanding.
    pub(crate) fn reject_head(&mut self, error: Error) -> bool {
        match self.queue.pop_front() {
            Some(head) => {
                head.reject(error);
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request, oldest first.
    pub(crate) fn reject_all(&mut self, mut error: impl FnMut() -> Error) {
        while let Some(rpc) = self.queue.pop_front() {
            rpc.reject(error());
        }
    }
}
