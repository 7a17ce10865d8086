//! Persistent point-to-point requests.
//!
//! A persistent request binds a buffer, descriptor, peer and tag once and can then be
//! started any number of times. Every start issues a fresh non-blocking operation, with
//! its own reverse bookkeeping, so each round is recorded like a separate `isend` or
//! `irecv`.

use super::{AdComm, SharedBuf};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::reverse::Mode;
use crate::tool::AdTool;
use crate::transport::{SendMode, Source, Status, Tag};
use crate::types::DataType;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
enum Direction {
    Send { dest: usize, mode: SendMode },
    Recv { source: Source },
}

/// An inactive-or-active persistent operation.
pub struct Persistent<T: AdTool, D: DataType<T>> {
    comm: AdComm<T>,
    buf: SharedBuf<D::Elem>,
    ty: D,
    tag: Tag,
    direction: Direction,
    active: Request,
}

impl<T: AdTool, D: DataType<T>> std::fmt::Debug for Persistent<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistent")
            .field("direction", &self.direction)
            .field("tag", &self.tag)
            .field("active", &!self.active.is_null())
            .finish()
    }
}

impl<T: AdTool, D: DataType<T>> Persistent<T, D> {
    /// Starts one round. Send data is read from the buffer at this point.
    pub fn start(&mut self) -> Result<()> {
        if !self.active.is_null() {
            return Err(Error::InvalidArgument(
                "persistent request started while still active".into(),
            ));
        }
        trace!(direction = ?self.direction, tag = self.tag, "start persistent request");
        self.active = match self.direction {
            Direction::Send { dest, mode } => {
                let data = self.buf.borrow();
                self.comm.start_send(&data, &self.ty, dest, self.tag, mode, Mode::NonBlocking)?
            }
            Direction::Recv { source } => {
                let buf = self.buf.clone();
                self.comm.start_recv(buf, &self.ty, source, self.tag, Mode::NonBlocking)?
            }
        };
        Ok(())
    }

    /// Waits for the current round. Returns an empty status if the request is inactive.
    pub fn wait(&mut self) -> Result<Status> {
        self.active.wait()
    }

    pub fn test(&mut self) -> Result<Option<Status>> {
        self.active.test()
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_null()
    }

    /// The request of the current round, for use with the `wait_*`/`test_*` functions.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.active
    }

    pub fn buffer(&self) -> &SharedBuf<D::Elem> {
        &self.buf
    }
}

/// Starts every request in order.
pub fn start_all<T: AdTool, D: DataType<T>>(requests: &mut [Persistent<T, D>]) -> Result<()> {
    requests.iter_mut().try_for_each(Persistent::start)
}

impl<T: AdTool> AdComm<T> {
    pub fn send_init<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        dest: usize,
        tag: Tag,
    ) -> Persistent<T, D> {
        self.persistent(buf, ty, tag, Direction::Send { dest, mode: SendMode::Standard })
    }

    pub fn send_init_mode<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        dest: usize,
        tag: Tag,
        mode: SendMode,
    ) -> Persistent<T, D> {
        self.persistent(buf, ty, tag, Direction::Send { dest, mode })
    }

    pub fn recv_init<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        source: Source,
        tag: Tag,
    ) -> Persistent<T, D> {
        self.persistent(buf, ty, tag, Direction::Recv { source })
    }

    fn persistent<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        tag: Tag,
        direction: Direction,
    ) -> Persistent<T, D> {
        Persistent {
            comm: self.clone(),
            buf,
            ty: ty.clone(),
            tag,
            direction,
            active: Request::null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::shared;
    use super::*;
    use crate::tool::PassiveTool;
    use crate::transport::LocalWorld;
    use crate::types::PassiveType;

    #[test]
    fn test_restart_reads_current_buffer() {
        let comm = AdComm::new(LocalWorld::new(1).pop().unwrap().into_comm(), PassiveTool);
        let ty = PassiveType::<u32>::new();
        let out = shared(vec![1u32, 2]);
        let inbox = shared(vec![0u32; 2]);
        let mut send = comm.send_init(out.clone(), &ty, 0, 5);
        let mut recv = comm.recv_init(inbox.clone(), &ty, Source::Rank(0), 5);

        for round in 0..3u32 {
            out.borrow_mut()[1] = round;
            recv.start().unwrap();
            send.start().unwrap();
            assert!(send.start().is_err());
            send.wait().unwrap();
            recv.wait().unwrap();
            assert_eq!(*inbox.borrow(), vec![1, round]);
            assert!(!recv.is_active());
        }
    }
}
