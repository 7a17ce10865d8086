//! # Differentiable communication
//!
//! [`AdComm`] pairs a [`Transport`] with an AD adapter and exposes the message-passing
//! primitives over typed buffers. Every call takes a [`DataType`] describing the
//! elements; passive descriptors go straight to the transport, active ones additionally
//! record the reverse communication with the adapter.
//!
//! ## Buffers
//!
//! *   Blocking calls take plain slices.
//! *   Non-blocking calls take their receive buffer as a [`SharedBuf`], which the
//!     request's continuation fills in when the operation completes. Send data is packed
//!     when the call is issued, so it is taken by reference.
//! *   [`Input::InPlace`] is the in-place sentinel: the data to send is read from the
//!     receive buffer, at the position this rank's contribution occupies there.
//!
//! ## Example
//!
//! ```rust
//! use admpi_rs::comm::AdComm;
//! use admpi_rs::tool::Tape;
//! use admpi_rs::transport::{LocalWorld, Source};
//! use admpi_rs::types::ActiveType;
//! use std::thread;
//!
//! let handles: Vec<_> = LocalWorld::new(2)
//!     .into_iter()
//!     .map(|endpoint| {
//!         thread::spawn(move || {
//!             let tape = Tape::new();
//!             let comm = AdComm::new(endpoint.into_comm(), tape.clone());
//!             let ty = ActiveType::<Tape>::new();
//!             tape.set_active();
//!             if comm.rank() == 0 {
//!                 let x = tape.input(3.0);
//!                 comm.send(&[x.clone()], &ty, 1, 42).unwrap();
//!                 tape.set_passive();
//!                 tape.evaluate().unwrap();
//!                 assert_eq!(tape.gradient(x.index()), 100.0);
//!             } else {
//!                 let mut y = [Default::default()];
//!                 comm.recv(&mut y, &ty, Source::Rank(0), 42).unwrap();
//!                 tape.set_passive();
//!                 tape.set_gradient(y[0].index(), 100.0);
//!                 tape.evaluate().unwrap();
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! ```

use crate::error::{Error, Result};
use crate::request::Request;
use crate::reverse::{Mode, RecvReversal, SendReversal, Tracker};
use crate::tool::AdTool;
use crate::transport::{SendMode, Source, Status, Tag, Transport};
use crate::types::DataType;
use std::cell::RefCell;
use std::rc::Rc;

pub mod collective;
pub mod persistent;
pub mod reduce;

pub use persistent::{start_all, Persistent};

/// Receive buffer of a non-blocking operation.
pub type SharedBuf<E> = Rc<RefCell<Vec<E>>>;

/// Wraps a vector into a [`SharedBuf`].
pub fn shared<E>(values: Vec<E>) -> SharedBuf<E> {
    Rc::new(RefCell::new(values))
}

/// Send side of a collective.
#[derive(Debug)]
pub enum Input<'a, E> {
    /// Take this rank's contribution from the receive buffer.
    InPlace,
    Buf(&'a [E]),
}

impl<'a, E> From<&'a [E]> for Input<'a, E> {
    fn from(buf: &'a [E]) -> Self {
        Input::Buf(buf)
    }
}

impl<'a, E> From<&'a Vec<E>> for Input<'a, E> {
    fn from(buf: &'a Vec<E>) -> Self {
        Input::Buf(buf)
    }
}

impl<'a, E, const N: usize> From<&'a [E; N]> for Input<'a, E> {
    fn from(buf: &'a [E; N]) -> Self {
        Input::Buf(buf)
    }
}

/// Receive side of a scatter.
#[derive(Debug)]
pub enum Output<'a, E> {
    /// At the root: keep the root's block where it is in the send buffer.
    InPlace,
    Buf(&'a mut [E]),
}

/// Differentiable communicator.
pub struct AdComm<T: AdTool> {
    transport: Rc<dyn Transport>,
    tool: Rc<T>,
}

impl<T: AdTool> Clone for AdComm<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            tool: self.tool.clone(),
        }
    }
}

impl<T: AdTool> AdComm<T> {
    pub fn new(transport: impl Transport + 'static, tool: T) -> Self {
        Self::from_shared(Rc::new(transport), Rc::new(tool))
    }

    pub fn from_shared(transport: Rc<dyn Transport>, tool: Rc<T>) -> Self {
        Self { transport, tool }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn size(&self) -> usize {
        self.transport.size()
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    /// Number of elements of `ty` a completed receive delivered.
    pub fn count<D: DataType<T>>(&self, status: &Status, ty: &D) -> usize {
        match ty.modified_extent() {
            0 => 0,
            extent => status.bytes / extent,
        }
    }

    /// Whether operations on `ty` record reverse work right now.
    pub(crate) fn records<D: DataType<T>>(&self, ty: &D) -> bool {
        ty.is_active() && self.tool.is_handle_required()
    }

    pub(crate) fn indices<D: DataType<T>>(&self, ty: &D, buf: &[D::Elem]) -> Vec<T::Index> {
        indices_of(&*self.tool, ty, buf)
    }

    pub fn send<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<()> {
        self.send_mode(buf, ty, dest, tag, SendMode::Standard)
    }

    /// Buffered send.
    pub fn bsend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<()> {
        self.send_mode(buf, ty, dest, tag, SendMode::Buffered)
    }

    /// Synchronous send.
    pub fn ssend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<()> {
        self.send_mode(buf, ty, dest, tag, SendMode::Synchronous)
    }

    /// Ready send.
    pub fn rsend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<()> {
        self.send_mode(buf, ty, dest, tag, SendMode::Ready)
    }

    pub fn send_mode<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
        mode: SendMode,
    ) -> Result<()> {
        self.start_send(buf, ty, dest, tag, mode, Mode::Blocking)?.wait().map(|_| ())
    }

    pub fn isend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<Request> {
        self.start_send(buf, ty, dest, tag, SendMode::Standard, Mode::NonBlocking)
    }

    pub fn ibsend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<Request> {
        self.start_send(buf, ty, dest, tag, SendMode::Buffered, Mode::NonBlocking)
    }

    pub fn issend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<Request> {
        self.start_send(buf, ty, dest, tag, SendMode::Synchronous, Mode::NonBlocking)
    }

    pub fn irsend<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Result<Request> {
        self.start_send(buf, ty, dest, tag, SendMode::Ready, Mode::NonBlocking)
    }

    pub(crate) fn start_send<D: DataType<T>>(
        &self,
        buf: &[D::Elem],
        ty: &D,
        dest: usize,
        tag: Tag,
        send_mode: SendMode,
        mode: Mode,
    ) -> Result<Request> {
        let bytes = ty.pack(&*self.tool, buf);
        let raw = self.transport.isend(bytes, dest, tag, send_mode)?;
        if !self.records(ty) {
            return Ok(Request::new(self.transport.clone(), raw));
        }
        let reversal = SendReversal {
            transport: self.transport.clone(),
            dest,
            tag,
            indices: self.indices(ty, buf),
        };
        let tracker = Tracker::issue(&*self.tool, reversal, mode);
        let tool = self.tool.clone();
        Ok(Request::with_continuation(self.transport.clone(), raw, move |_| {
            tracker.complete(&*tool, |_| {});
            Ok(())
        }))
    }

    /// Receives into the front of `buf`. The message may hold fewer elements.
    pub fn recv<D: DataType<T>>(
        &self,
        buf: &mut [D::Elem],
        ty: &D,
        source: Source,
        tag: Tag,
    ) -> Result<Status> {
        blocking(buf, |shared| self.start_recv(shared, ty, source, tag, Mode::Blocking))
    }

    pub fn irecv<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        source: Source,
        tag: Tag,
    ) -> Result<Request> {
        self.start_recv(buf, ty, source, tag, Mode::NonBlocking)
    }

    pub(crate) fn start_recv<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        source: Source,
        tag: Tag,
        mode: Mode,
    ) -> Result<Request> {
        let extent = ty.modified_extent();
        let capacity = buf.borrow().len() * extent;
        let raw = self.transport.irecv(source, tag, capacity)?;
        let tracker = self.records(ty).then(|| {
            let reversal = RecvReversal {
                transport: self.transport.clone(),
                peer: None,
                indices: Vec::new(),
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });
        let (tool, ty) = (self.tool.clone(), ty.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let bytes = std::mem::take(&mut completion.payload).into_bytes();
            let count = whole_elements("recv", bytes.len(), extent)?;
            let status = completion.status;
            let mut buf = buf.borrow_mut();
            let target = &mut buf[..count];
            ty.unpack(&*tool, &bytes, target);
            match tracker {
                Some(tracker) => {
                    let (indices, old) = register(&*tool, &ty, target);
                    tracker.complete(&*tool, |reversal| {
                        reversal.peer = Some((status.source, status.tag));
                        reversal.indices = indices;
                        reversal.old = old;
                    });
                }
                None => ty.clear_indices(&*tool, target),
            }
            Ok(())
        }))
    }

    /// Sends `send` to `dest` and receives into `recv` from `source` in one call.
    #[allow(clippy::too_many_arguments)]
    pub fn sendrecv<DS: DataType<T>, DR: DataType<T>>(
        &self,
        send: &[DS::Elem],
        send_ty: &DS,
        dest: usize,
        send_tag: Tag,
        recv: &mut [DR::Elem],
        recv_ty: &DR,
        source: Source,
        recv_tag: Tag,
    ) -> Result<Status> {
        let mut sending =
            self.start_send(send, send_ty, dest, send_tag, SendMode::Standard, Mode::NonBlocking)?;
        let status = self.recv(recv, recv_ty, source, recv_tag)?;
        sending.wait()?;
        Ok(status)
    }

    /// Blocks until a matching message is available.
    pub fn probe(&self, source: Source, tag: Tag) -> Result<Status> {
        Ok(self.transport.probe(source, tag)?)
    }

    pub fn iprobe(&self, source: Source, tag: Tag) -> Result<Option<Status>> {
        Ok(self.transport.iprobe(source, tag)?)
    }
}

/// Runs a non-blocking primitive to completion on a plain slice.
pub(crate) fn blocking<E: Clone>(
    buf: &mut [E],
    issue: impl FnOnce(SharedBuf<E>) -> Result<Request>,
) -> Result<Status> {
    let shared = shared(buf.to_vec());
    let status = issue(shared.clone())?.wait()?;
    buf.clone_from_slice(&shared.borrow());
    Ok(status)
}

pub(crate) fn indices_of<T: AdTool, D: DataType<T>>(
    tool: &T,
    ty: &D,
    buf: &[D::Elem],
) -> Vec<T::Index> {
    let mut indices = tool.create_index_buffer(ty.active_elements(buf.len()));
    ty.get_indices(tool, buf, &mut indices);
    indices
}

pub(crate) fn values_of<T: AdTool, D: DataType<T>>(
    tool: &T,
    ty: &D,
    buf: &[D::Elem],
) -> Vec<T::Real> {
    let mut primals = tool.create_primal_buffer(ty.active_elements(buf.len()));
    ty.get_values(tool, buf, &mut primals);
    primals
}

/// Registers freshly received elements. Returns their indices and the old primals.
pub(crate) fn register<T: AdTool, D: DataType<T>>(
    tool: &T,
    ty: &D,
    buf: &mut [D::Elem],
) -> (Vec<T::Index>, Vec<T::Real>) {
    let slots = ty.active_elements(buf.len());
    let mut indices = tool.create_index_buffer(slots);
    let mut old = tool.create_primal_buffer(slots);
    ty.register_value(tool, buf, &mut indices, &mut old);
    (indices, old)
}

/// Number of whole elements in a payload.
pub(crate) fn whole_elements(call: &str, bytes: usize, extent: usize) -> Result<usize> {
    if extent == 0 {
        return Ok(0);
    }
    if bytes % extent != 0 {
        return Err(Error::InvalidArgument(format!(
            "{call}: payload of {bytes} bytes is not a whole number of {extent}-byte elements"
        )));
    }
    Ok(bytes / extent)
}

/// Checks that a received payload has exactly the expected size.
pub(crate) fn expect_bytes(call: &str, got: usize, expected: usize) -> Result<()> {
    if got > expected {
        return Err(Error::Truncated {
            got,
            capacity: expected,
        });
    }
    if got != expected {
        return Err(Error::InvalidArgument(format!(
            "{call}: received {got} bytes, expected {expected}"
        )));
    }
    Ok(())
}
