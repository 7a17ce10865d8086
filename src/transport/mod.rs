//! # Transport boundary
//!
//! The message-passing substrate this crate sits on top of. Everything in here is
//! *consumed*: the differentiable layer in [`crate::comm`] never moves a byte itself,
//! it packs user elements through a [`DataType`](crate::types::DataType) and hands
//! the resulting wire bytes to a [`Transport`].
//!
//! The trait is byte oriented on purpose. Element layout is the business of the type
//! descriptors, so the transport only needs to know about whole payloads:
//!
//! *   Point-to-point: `send`/`recv` and their non-blocking forms, with send modes.
//! *   Collectives: every collective is a non-blocking *schedule*; the blocking form is
//!     "issue and wait" and is provided by default methods.
//! *   Requests: [`RawRequest`] ids, polled with `test` and `wait`, discarded with
//!     `request_free`.
//! *   Reductions: the transport folds payloads with a [`WireOp`] supplied by the caller,
//!     always in rank order `x0 ∘ (x1 ∘ (… ∘ xn-1))`.
//!
//! A reference implementation lives in [`local`], where every rank is a thread.

use std::rc::Rc;

pub mod local;

pub use local::{LocalComm, LocalConfig, LocalEndpoint, LocalWorld};

/// Message tag.
pub type Tag = i32;

/// Wildcard tag for receives and probes.
pub const ANY_TAG: Tag = -1;

/// Status values returned by transports, following the usual message-passing numbering.
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const ERR_BUFFER: i32 = 1;
    pub const ERR_COUNT: i32 = 2;
    pub const ERR_TAG: i32 = 4;
    pub const ERR_RANK: i32 = 6;
    pub const ERR_ROOT: i32 = 7;
    pub const ERR_TRUNCATE: i32 = 14;
    pub const ERR_OTHER: i32 = 15;
    pub const ERR_INTERN: i32 = 16;
    pub const ERR_REQUEST: i32 = 19;
}

/// A failed transport call. `code` is one of the [`status`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportError {
    pub call: &'static str,
    pub code: i32,
}

impl TransportError {
    pub fn new(call: &'static str, code: i32) -> Self {
        Self { call, code }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} returned status {}", self.call, self.code)
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Source selector for receives and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Match a message from any rank.
    Any,
    /// Match only messages from this rank.
    Rank(usize),
}

impl Source {
    pub fn matches(&self, rank: usize) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(r) => *r == rank,
        }
    }
}

impl From<usize> for Source {
    fn from(rank: usize) -> Self {
        Source::Rank(rank)
    }
}

/// Send mode of a point-to-point send.
///
/// All modes have the same data flow; they only differ in when the transport may
/// consider the send complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    #[default]
    Standard,
    Buffered,
    Synchronous,
    Ready,
}

/// Envelope information of a received or probed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    pub source: usize,
    pub tag: Tag,
    /// Payload size in bytes.
    pub bytes: usize,
}

/// Opaque id of an in-flight transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawRequest(pub u64);

/// Data delivered by a completed transport operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    /// Nothing was delivered to this rank (sends, barriers, non-root gathers).
    #[default]
    Empty,
    /// One contiguous payload (receives, broadcasts, scatters, reductions).
    Bytes(Vec<u8>),
    /// One payload per rank, in rank order (gathers, all-gathers, all-to-all).
    Parts(Vec<Vec<u8>>),
}

impl Payload {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Empty => Vec::new(),
            Payload::Bytes(bytes) => bytes,
            Payload::Parts(parts) => parts.concat(),
        }
    }

    pub fn into_parts(self) -> Vec<Vec<u8>> {
        match self {
            Payload::Empty => Vec::new(),
            Payload::Bytes(bytes) => vec![bytes],
            Payload::Parts(parts) => parts,
        }
    }
}

/// Result of a completed [`RawRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawCompletion {
    pub payload: Payload,
    pub status: Status,
}

/// Wire-level reduction: `inout = input ∘ inout`, element by element.
///
/// Both slices hold the same number of elements in the wire representation of the
/// descriptor that built the closure.
pub type WireOp = Rc<dyn Fn(&[u8], &mut [u8])>;

/// The message-passing substrate.
///
/// Implementations must deliver messages reliably and in order per
/// (source, destination, tag), and must tolerate repeated polling of the same
/// request. Collectives have to be called by every rank in the same order.
pub trait Transport {
    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Starts a send. The payload is owned by the request until it completes.
    fn isend(&self, data: Vec<u8>, dest: usize, tag: Tag, mode: SendMode)
        -> TransportResult<RawRequest>;

    /// Posts a receive of at most `capacity` bytes.
    fn irecv(&self, source: Source, tag: Tag, capacity: usize) -> TransportResult<RawRequest>;

    /// Blocks until a matching message is available, without receiving it.
    fn probe(&self, source: Source, tag: Tag) -> TransportResult<Status>;

    /// Checks for a matching message without blocking.
    fn iprobe(&self, source: Source, tag: Tag) -> TransportResult<Option<Status>>;

    /// Polls a request. Returns the completion exactly once; the id is invalid afterwards.
    fn test(&self, request: RawRequest) -> TransportResult<Option<RawCompletion>>;

    /// Blocks until a request completes.
    fn wait(&self, request: RawRequest) -> TransportResult<RawCompletion>;

    /// Discards a request. Its data is dropped and it will never be reported as complete.
    fn request_free(&self, request: RawRequest) -> TransportResult<()>;

    /// Blocks until the transport may have made progress on some request.
    ///
    /// Used by callers that poll several requests at once. The default only yields.
    fn wait_for_traffic(&self) -> TransportResult<()> {
        std::thread::yield_now();
        Ok(())
    }

    /// Broadcast; `data` is `Some` exactly on the root.
    fn ibcast(&self, data: Option<Vec<u8>>, root: usize) -> TransportResult<RawRequest>;

    /// Gather; the root completes with [`Payload::Parts`], one part per rank.
    fn igather(&self, data: Vec<u8>, root: usize) -> TransportResult<RawRequest>;

    /// Scatter; `parts` is `Some` (one part per rank) exactly on the root.
    fn iscatter(&self, parts: Option<Vec<Vec<u8>>>, root: usize) -> TransportResult<RawRequest>;

    /// All-gather; every rank completes with one part per rank.
    fn iallgather(&self, data: Vec<u8>) -> TransportResult<RawRequest>;

    /// All-to-all; part `j` goes to rank `j`, completion holds the part received from each rank.
    fn ialltoall(&self, parts: Vec<Vec<u8>>) -> TransportResult<RawRequest>;

    /// Reduction to `root`; the root completes with the folded payload.
    fn ireduce(&self, data: Vec<u8>, op: WireOp, root: usize) -> TransportResult<RawRequest>;

    /// Reduction whose result is delivered to every rank.
    fn iallreduce(&self, data: Vec<u8>, op: WireOp) -> TransportResult<RawRequest>;

    /// Inclusive prefix reduction.
    fn iscan(&self, data: Vec<u8>, op: WireOp) -> TransportResult<RawRequest>;

    /// Exclusive prefix reduction; rank 0 completes with [`Payload::Empty`].
    fn iexscan(&self, data: Vec<u8>, op: WireOp) -> TransportResult<RawRequest>;

    fn ibarrier(&self) -> TransportResult<RawRequest>;

    fn send(&self, data: &[u8], dest: usize, tag: Tag, mode: SendMode) -> TransportResult<()> {
        let request = self.isend(data.to_vec(), dest, tag, mode)?;
        self.wait(request).map(|_| ())
    }

    fn recv(
        &self,
        source: Source,
        tag: Tag,
        capacity: usize,
    ) -> TransportResult<(Vec<u8>, Status)> {
        let request = self.irecv(source, tag, capacity)?;
        let completion = self.wait(request)?;
        Ok((completion.payload.into_bytes(), completion.status))
    }

    fn bcast(&self, data: Option<Vec<u8>>, root: usize) -> TransportResult<Vec<u8>> {
        let request = self.ibcast(data, root)?;
        Ok(self.wait(request)?.payload.into_bytes())
    }

    fn gather(&self, data: Vec<u8>, root: usize) -> TransportResult<Vec<Vec<u8>>> {
        let request = self.igather(data, root)?;
        Ok(self.wait(request)?.payload.into_parts())
    }

    fn scatter(&self, parts: Option<Vec<Vec<u8>>>, root: usize) -> TransportResult<Vec<u8>> {
        let request = self.iscatter(parts, root)?;
        Ok(self.wait(request)?.payload.into_bytes())
    }

    fn allgather(&self, data: Vec<u8>) -> TransportResult<Vec<Vec<u8>>> {
        let request = self.iallgather(data)?;
        Ok(self.wait(request)?.payload.into_parts())
    }

    fn alltoall(&self, parts: Vec<Vec<u8>>) -> TransportResult<Vec<Vec<u8>>> {
        let request = self.ialltoall(parts)?;
        Ok(self.wait(request)?.payload.into_parts())
    }

    fn reduce(&self, data: Vec<u8>, op: WireOp, root: usize) -> TransportResult<Vec<u8>> {
        let request = self.ireduce(data, op, root)?;
        Ok(self.wait(request)?.payload.into_bytes())
    }

    fn allreduce(&self, data: Vec<u8>, op: WireOp) -> TransportResult<Vec<u8>> {
        let request = self.iallreduce(data, op)?;
        Ok(self.wait(request)?.payload.into_bytes())
    }

    fn scan(&self, data: Vec<u8>, op: WireOp) -> TransportResult<Vec<u8>> {
        let request = self.iscan(data, op)?;
        Ok(self.wait(request)?.payload.into_bytes())
    }

    fn exscan(&self, data: Vec<u8>, op: WireOp) -> TransportResult<Vec<u8>> {
        let request = self.iexscan(data, op)?;
        Ok(self.wait(request)?.payload.into_bytes())
    }

    fn barrier(&self) -> TransportResult<()> {
        let request = self.ibarrier()?;
        self.wait(request).map(|_| ())
    }

    /// Local, non-communicating `inout = input ∘ inout`.
    fn reduce_local(&self, input: &[u8], inout: &mut [u8], op: &WireOp) {
        op(input, inout)
    }
}
