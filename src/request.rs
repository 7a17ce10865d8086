//! # Request/Continuation Engine
//!
//! A [`Request`] wraps a transport request together with a chain of continuations.
//! Continuations carry the bookkeeping a non-blocking primitive cannot do at issue time:
//! decoding received bytes into the user buffer, registering fresh AD indices, recording
//! the completion-side action of the reverse sweep, or running a local reduction over
//! gathered data.
//!
//! ## Lifecycle
//!
//! ```text
//!  Active ──wait/test observes completion──▶ continuations run ──▶ Null
//!    │
//!    └──free──▶ Null (continuations dropped unrun)
//! ```
//!
//! *   Continuations only run inside `wait`/`test` family calls, on the caller's stack.
//!     The one exception is chaining onto a Null request: the operation is already
//!     complete, so [`Request::chain`] runs the continuation right away and returns its
//!     error, if any.
//! *   Each continuation runs exactly once, in the order they were chained: the one
//!     installed by the primitive first, later layers after it.
//! *   Every call on a Null request is a no-op returning success.
//!
//! ```rust
//! use admpi_rs::request::Request;
//!
//! let mut request = Request::null();
//! assert!(request.wait().is_ok());
//! assert!(request.test().unwrap().is_some());
//! assert!(request.free().is_ok());
//! assert_eq!(request, Request::null());
//! ```

use crate::error::{Error, Result};
use crate::transport::{RawCompletion, RawRequest, Status, Transport};
use std::fmt;
use std::rc::Rc;
use tracing::{trace, warn};

/// Bookkeeping run once the underlying transport request completed.
pub type Continuation = Box<dyn FnOnce(&mut RawCompletion) -> Result<()>>;

struct Pending {
    raw: RawRequest,
    transport: Rc<dyn Transport>,
    continuations: Vec<Continuation>,
}

/// Handle of a non-blocking differentiable operation.
#[derive(Default)]
pub struct Request {
    pending: Option<Pending>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pending {
            None => write!(f, "Request(null)"),
            Some(p) => f
                .debug_struct("Request")
                .field("raw", &p.raw)
                .field("continuations", &p.continuations.len())
                .finish(),
        }
    }
}

/// Requests are equal if both are Null or both wrap the same transport request.
impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        match (&self.pending, &other.pending) {
            (None, None) => true,
            (Some(a), Some(b)) => a.raw == b.raw && Rc::ptr_eq(&a.transport, &b.transport),
            _ => false,
        }
    }
}

impl Request {
    /// The Null request.
    pub fn null() -> Self {
        Self { pending: None }
    }

    /// Wraps a transport request without any continuation.
    pub fn new(transport: Rc<dyn Transport>, raw: RawRequest) -> Self {
        trace!(raw = raw.0, "request issued");
        Self {
            pending: Some(Pending {
                raw,
                transport,
                continuations: Vec::new(),
            }),
        }
    }

    /// Wraps a transport request with a first continuation.
    pub fn with_continuation(
        transport: Rc<dyn Transport>,
        raw: RawRequest,
        continuation: impl FnOnce(&mut RawCompletion) -> Result<()> + 'static,
    ) -> Self {
        let mut request = Self::new(transport, raw);
        if let Some(pending) = &mut request.pending {
            pending.continuations.push(Box::new(continuation));
        }
        request
    }

    pub fn is_null(&self) -> bool {
        self.pending.is_none()
    }

    /// Layers another continuation over the existing ones.
    ///
    /// On a Null request the continuation runs right away with an empty completion,
    /// since the operation it belongs to is already complete. Its error is returned.
    pub fn chain(
        mut self,
        continuation: impl FnOnce(&mut RawCompletion) -> Result<()> + 'static,
    ) -> Result<Self> {
        match &mut self.pending {
            Some(pending) => pending.continuations.push(Box::new(continuation)),
            None => continuation(&mut RawCompletion::default())?,
        }
        Ok(self)
    }

    /// Runs all continuations of a completed request and resets it to Null.
    fn complete(&mut self, mut completion: RawCompletion) -> Result<Status> {
        let Some(pending) = self.pending.take() else {
            return Ok(Status::default());
        };
        trace!(
            raw = pending.raw.0,
            continuations = pending.continuations.len(),
            "request completed"
        );
        for continuation in pending.continuations {
            continuation(&mut completion)?;
        }
        Ok(completion.status)
    }

    /// Blocks until the request completes, then runs its continuations.
    pub fn wait(&mut self) -> Result<Status> {
        let Some(pending) = &self.pending else {
            return Ok(Status::default());
        };
        let result = pending.transport.wait(pending.raw);
        match result {
            Ok(completion) => self.complete(completion),
            Err(err) => {
                self.pending = None;
                Err(Error::transport("wait", err))
            }
        }
    }

    /// Polls the request. `Some` once it completed (and its continuations ran).
    pub fn test(&mut self) -> Result<Option<Status>> {
        let Some(pending) = &self.pending else {
            return Ok(Some(Status::default()));
        };
        let polled = pending.transport.test(pending.raw);
        match polled {
            Ok(None) => Ok(None),
            Ok(Some(completion)) => self.complete(completion).map(Some),
            Err(err) => {
                self.pending = None;
                Err(Error::transport("test", err))
            }
        }
    }

    /// Discards the request. Its continuations never run.
    pub fn free(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if !pending.continuations.is_empty() {
            warn!(
                raw = pending.raw.0,
                continuations = pending.continuations.len(),
                "freeing a request with pending continuations"
            );
        }
        pending
            .transport
            .request_free(pending.raw)
            .map_err(|err| Error::transport("request_free", err))
    }

    fn transport(&self) -> Option<&Rc<dyn Transport>> {
        self.pending.as_ref().map(|p| &p.transport)
    }
}

/// Waits for every request, in order.
pub fn wait_all(requests: &mut [Request]) -> Result<Vec<Status>> {
    requests.iter_mut().map(Request::wait).collect()
}

/// Polls every request once.
///
/// Returns the statuses when all requests are complete. Requests that completed in an
/// earlier call are Null by now and report a default status.
pub fn test_all(requests: &mut [Request]) -> Result<Option<Vec<Status>>> {
    let mut statuses = Vec::with_capacity(requests.len());
    let mut done = true;
    for request in requests.iter_mut() {
        match request.test()? {
            Some(status) => statuses.push(status),
            None => done = false,
        }
    }
    Ok(done.then_some(statuses))
}

/// Blocks until one active request completes and returns its position.
///
/// Returns `None` if every request is Null.
pub fn wait_any(requests: &mut [Request]) -> Result<Option<(usize, Status)>> {
    loop {
        let Some(transport) = requests.iter().find_map(|r| r.transport().cloned()) else {
            return Ok(None);
        };
        if let Some(found) = test_any(requests)? {
            return Ok(Some(found));
        }
        transport
            .wait_for_traffic()
            .map_err(|err| Error::transport("wait_any", err))?;
    }
}

/// Polls the active requests and completes the first one found complete.
pub fn test_any(requests: &mut [Request]) -> Result<Option<(usize, Status)>> {
    for (i, request) in requests.iter_mut().enumerate() {
        if request.is_null() {
            continue;
        }
        if let Some(status) = request.test()? {
            return Ok(Some((i, status)));
        }
    }
    Ok(None)
}

/// Blocks until at least one active request completes, then returns all that did.
///
/// Returns an empty list if every request is Null.
pub fn wait_some(requests: &mut [Request]) -> Result<Vec<(usize, Status)>> {
    loop {
        let Some(transport) = requests.iter().find_map(|r| r.transport().cloned()) else {
            return Ok(Vec::new());
        };
        let done = test_some(requests)?;
        if !done.is_empty() {
            return Ok(done);
        }
        transport
            .wait_for_traffic()
            .map_err(|err| Error::transport("wait_some", err))?;
    }
}

/// Polls the active requests and returns all that completed.
pub fn test_some(requests: &mut [Request]) -> Result<Vec<(usize, Status)>> {
    let mut done = Vec::new();
    for (i, request) in requests.iter_mut().enumerate() {
        if request.is_null() {
            continue;
        }
        if let Some(status) = request.test()? {
            done.push((i, status));
        }
    }
    Ok(done)
}
