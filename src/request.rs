//! # Request/Reply Coordination
//!
//! A thin layer over [`Channel`]: each request carries its payload plus a
//! private reply queue, and the requester blocks on that queue with a
//! timeout. One reply or a stream of many both work on the same
//! primitive.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::{Channel, SubscriptionHandle};
use crate::fiber::Fiber;

struct HandshakeState<Rep> {
    replies: VecDeque<Rep>,
    disposed: bool,
}

struct Handshake<Rep> {
    state: Mutex<HandshakeState<Rep>>,
    arrived: Condvar,
}

impl<Rep> Handshake<Rep> {
    fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState {
                replies: VecDeque::new(),
                disposed: false,
            }),
            arrived: Condvar::new(),
        }
    }
}

/// The subscriber-side view of one outstanding request.
///
/// `send_reply` may be called zero, one, or many times; once the
/// requester disposes its handle, further replies are rejected and
/// handed back to the caller.
pub struct Request<Req, Rep> {
    payload: Req,
    handshake: Arc<Handshake<Rep>>,
}

impl<Req, Rep> Request<Req, Rep> {
    pub fn payload(&self) -> &Req {
        &self.payload
    }

    pub fn send_reply(&self, reply: Rep) -> Result<(), Rep> {
        let mut state = self.handshake.state.lock();
        if state.disposed {
            return Err(reply);
        }
        state.replies.push_back(reply);
        self.handshake.arrived.notify_one();
        Ok(())
    }
}

impl<Req: Clone, Rep> Clone for Request<Req, Rep> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            handshake: Arc::clone(&self.handshake),
        }
    }
}

/// The requester-side handle accumulating replies.
///
/// Dropping the handle disposes it, releasing any thread blocked in
/// [`receive`](Self::receive) and rejecting replies that arrive later.
pub struct Reply<Rep> {
    handshake: Arc<Handshake<Rep>>,
}

impl<Rep> Reply<Rep> {
    /// Return the next queued reply, waiting up to `timeout` for one to
    /// arrive. `None` means the timeout elapsed or the handshake was
    /// disposed with nothing queued.
    pub fn receive(&self, timeout: Duration) -> Option<Rep> {
        let deadline = Instant::now() + timeout;
        let mut state = self.handshake.state.lock();
        loop {
            if let Some(reply) = state.replies.pop_front() {
                return Some(reply);
            }
            if state.disposed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.handshake.arrived.wait_for(&mut state, deadline - now);
        }
    }

    /// Mark the interaction done. Idempotent; wakes blocked receivers.
    pub fn dispose(&self) {
        let mut state = self.handshake.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        self.handshake.arrived.notify_all();
    }

    pub fn is_disposed(&self) -> bool {
        self.handshake.state.lock().disposed
    }
}

impl<Rep> Drop for Reply<Rep> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Publishes requests to subscribers and hands the caller a blocking
/// reply handle per request.
pub struct RequestChannel<Req, Rep> {
    requests: Channel<Request<Req, Rep>>,
}

impl<Req, Rep> RequestChannel<Req, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            requests: Channel::new(),
        }
    }

    /// Publish a request and return the handle its replies arrive on.
    pub fn send_request(&self, payload: Req) -> Reply<Rep> {
        let handshake = Arc::new(Handshake::new());
        let request = Request {
            payload,
            handshake: Arc::clone(&handshake),
        };
        self.requests.publish(request);
        Reply { handshake }
    }

    /// Receive requests on the given fiber.
    pub fn subscribe<F>(&self, fiber: Arc<dyn Fiber>, handler: F) -> SubscriptionHandle
    where
        F: Fn(Request<Req, Rep>) + Send + Sync + 'static,
    {
        self.requests.subscribe(fiber, handler)
    }
}

impl<Req, Rep> Default for RequestChannel<Req, Rep>
where
    Req: Clone + Send + 'static,
    Rep: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Rep> Clone for RequestChannel<Req, Rep> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}
