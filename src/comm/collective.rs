//! Broadcast, gather, scatter, all-gather, all-to-all and barrier.
//!
//! Every collective is implemented once as a `start_*` schedule taking a [`Mode`]. The
//! blocking form starts it in blocking mode and waits; the `i*` form hands the request
//! to the caller. The fixed-count forms delegate to the `v` forms with uniform blocks.

use super::{blocking, expect_bytes, register, AdComm, Input, Output, SharedBuf};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::reverse::{
    AllgatherReversal, AlltoallReversal, BarrierReversal, BcastReversal, GatherReversal, Mode,
    ScatterReversal, Tracker,
};
use crate::tool::AdTool;
use crate::types::DataType;
use std::ops::Range;

/// Per-rank element counts and displacements of a `v` collective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocks {
    pub counts: Vec<usize>,
    pub displs: Vec<usize>,
}

impl Blocks {
    /// `ranks` consecutive blocks of `count` elements.
    pub fn uniform(count: usize, ranks: usize) -> Self {
        Self {
            counts: vec![count; ranks],
            displs: (0..ranks).map(|r| r * count).collect(),
        }
    }

    pub fn new(counts: Vec<usize>, displs: Vec<usize>) -> Self {
        Self { counts, displs }
    }

    /// Blocks packed back to back in rank order.
    pub fn packed(counts: Vec<usize>) -> Self {
        let displs = counts
            .iter()
            .scan(0, |start, count| {
                let displ = *start;
                *start += count;
                Some(displ)
            })
            .collect();
        Self { counts, displs }
    }

    pub fn range(&self, rank: usize) -> Range<usize> {
        self.displs[rank]..self.displs[rank] + self.counts[rank]
    }

    fn check(&self, call: &str, ranks: usize, len: usize) -> Result<()> {
        if self.counts.len() != ranks || self.displs.len() != ranks {
            return Err(Error::InvalidArgument(format!(
                "{call}: expected {ranks} counts and displacements, got {} and {}",
                self.counts.len(),
                self.displs.len()
            )));
        }
        if let Some(rank) = (0..ranks).find(|&r| self.range(r).end > len) {
            return Err(Error::InvalidArgument(format!(
                "{call}: block of rank {rank} ends past the buffer of {len} elements"
            )));
        }
        Ok(())
    }
}

impl<T: AdTool> AdComm<T> {
    fn own_block<E: Clone>(
        &self,
        call: &str,
        send: Input<'_, E>,
        recv: &SharedBuf<E>,
        range: Range<usize>,
    ) -> Result<Vec<E>> {
        match send {
            Input::Buf(buf) => Ok(buf.to_vec()),
            Input::InPlace => recv.borrow().get(range).map(<[E]>::to_vec).ok_or_else(|| {
                Error::InvalidArgument(format!("{call}: in-place block is outside the buffer"))
            }),
        }
    }

    /// Unpacks one part per rank into the matching blocks and registers them in rank order.
    fn receive_blocks<D: DataType<T>>(
        tool: &T,
        ty: &D,
        call: &str,
        parts: &[Vec<u8>],
        blocks: &Blocks,
        buf: &mut [D::Elem],
        records: bool,
    ) -> Result<(Vec<T::Index>, Vec<usize>, Vec<T::Real>)> {
        let extent = ty.modified_extent();
        if parts.len() != blocks.counts.len() {
            return Err(Error::InvalidArgument(format!(
                "{call}: received {} parts for {} ranks",
                parts.len(),
                blocks.counts.len()
            )));
        }
        for (rank, part) in parts.iter().enumerate() {
            expect_bytes(call, part.len(), blocks.counts[rank] * extent)?;
            ty.unpack(tool, part, &mut buf[blocks.range(rank)]);
        }
        let (mut indices, mut sizes, mut old) = (Vec::new(), Vec::new(), Vec::new());
        for rank in 0..parts.len() {
            let block = &mut buf[blocks.range(rank)];
            if records {
                let (block_indices, block_old) = register(tool, ty, block);
                sizes.push(block_indices.len());
                indices.extend(block_indices);
                old.extend(block_old);
            } else {
                ty.clear_indices(tool, block);
            }
        }
        Ok((indices, sizes, old))
    }

    pub fn bcast<D: DataType<T>>(&self, buf: &mut [D::Elem], ty: &D, root: usize) -> Result<()> {
        blocking(buf, |shared| self.start_bcast(shared, ty, root, Mode::Blocking)).map(|_| ())
    }

    pub fn ibcast<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        root: usize,
    ) -> Result<Request> {
        self.start_bcast(buf, ty, root, Mode::NonBlocking)
    }

    pub(crate) fn start_bcast<D: DataType<T>>(
        &self,
        buf: SharedBuf<D::Elem>,
        ty: &D,
        root: usize,
        mode: Mode,
    ) -> Result<Request> {
        let is_root = self.rank() == root;
        let data = is_root.then(|| ty.pack(&*self.tool, &buf.borrow()));
        let raw = self.transport.ibcast(data, root)?;
        let tracker = self.records(ty).then(|| {
            let indices = if is_root {
                self.indices(ty, &buf.borrow())
            } else {
                Vec::new()
            };
            let reversal = BcastReversal {
                transport: self.transport.clone(),
                root,
                indices,
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });
        let (tool, ty) = (self.tool.clone(), ty.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let (mut indices, mut old) = (Vec::new(), Vec::new());
            if !is_root {
                let bytes = std::mem::take(&mut completion.payload).into_bytes();
                let mut buf = buf.borrow_mut();
                expect_bytes("bcast", bytes.len(), buf.len() * ty.modified_extent())?;
                ty.unpack(&*tool, &bytes, &mut buf);
                if tracker.is_some() {
                    (indices, old) = register(&*tool, &ty, &mut buf);
                } else {
                    ty.clear_indices(&*tool, &mut buf);
                }
            }
            if let Some(tracker) = tracker {
                tracker.complete(&*tool, |reversal| {
                    if !is_root {
                        reversal.indices = indices;
                        reversal.old = old;
                    }
                });
            }
            Ok(())
        }))
    }

    /// Gathers `send` from every rank into consecutive blocks of `recv` at the root.
    pub fn gather<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
        root: usize,
    ) -> Result<()> {
        let count = self.uniform_count(&send, recv.len());
        self.gatherv(send, recv, &Blocks::uniform(count, self.size()), ty, root)
    }

    /// Gathers with per-rank counts and displacements. `blocks` is read on the root only.
    pub fn gatherv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        blocks: &Blocks,
        ty: &D,
        root: usize,
    ) -> Result<()> {
        blocking(recv, |shared| {
            self.start_gatherv(send, shared, blocks, ty, root, Mode::Blocking)
        })
        .map(|_| ())
    }

    pub fn igather<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        root: usize,
    ) -> Result<Request> {
        let count = self.uniform_count(&send, recv.borrow().len());
        let blocks = Blocks::uniform(count, self.size());
        self.start_gatherv(send, recv, &blocks, ty, root, Mode::NonBlocking)
    }

    pub fn igatherv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        blocks: &Blocks,
        ty: &D,
        root: usize,
    ) -> Result<Request> {
        self.start_gatherv(send, recv, blocks, ty, root, Mode::NonBlocking)
    }

    /// Element count of a uniform block, from the send buffer or, in place, the receive buffer.
    fn uniform_count<E>(&self, send: &Input<'_, E>, recv_len: usize) -> usize {
        match send {
            Input::Buf(buf) => buf.len(),
            Input::InPlace => recv_len / self.size().max(1),
        }
    }

    pub(crate) fn start_gatherv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        blocks: &Blocks,
        ty: &D,
        root: usize,
        mode: Mode,
    ) -> Result<Request> {
        let is_root = self.rank() == root;
        if is_root {
            blocks.check("gatherv", self.size(), recv.borrow().len())?;
        } else if matches!(send, Input::InPlace) {
            return Err(Error::InvalidArgument("gatherv: only the root may gather in place".into()));
        }
        let own_range = if is_root { blocks.range(root) } else { 0..0 };
        let own = self.own_block("gatherv", send, &recv, own_range)?;
        let raw = self.transport.igather(ty.pack(&*self.tool, &own), root)?;
        let records = self.records(ty);
        let tracker = records.then(|| {
            let reversal = GatherReversal {
                transport: self.transport.clone(),
                root,
                send_indices: self.indices(ty, &own),
                recv_indices: Vec::new(),
                recv_blocks: Vec::new(),
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });
        let (tool, ty, blocks) = (self.tool.clone(), ty.clone(), blocks.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let mut received = (Vec::new(), Vec::new(), Vec::new());
            if is_root {
                let parts = std::mem::take(&mut completion.payload).into_parts();
                let mut recv = recv.borrow_mut();
                received = Self::receive_blocks(
                    &*tool, &ty, "gatherv", &parts, &blocks, &mut recv, records,
                )?;
            }
            if let Some(tracker) = tracker {
                let (indices, sizes, old) = received;
                tracker.complete(&*tool, |reversal| {
                    reversal.recv_indices = indices;
                    reversal.recv_blocks = sizes;
                    reversal.old = old;
                });
            }
            Ok(())
        }))
    }

    /// Scatters consecutive blocks of `send` from the root, one per rank.
    pub fn scatter<D: DataType<T>>(
        &self,
        send: &[D::Elem],
        recv: Output<'_, D::Elem>,
        ty: &D,
        root: usize,
    ) -> Result<()> {
        let count = match &recv {
            Output::Buf(buf) => buf.len(),
            Output::InPlace => send.len() / self.size().max(1),
        };
        self.scatterv(send, &Blocks::uniform(count, self.size()), recv, ty, root)
    }

    /// Scatters with per-rank counts and displacements. `send` and `blocks` are read on the
    /// root only.
    pub fn scatterv<D: DataType<T>>(
        &self,
        send: &[D::Elem],
        blocks: &Blocks,
        recv: Output<'_, D::Elem>,
        ty: &D,
        root: usize,
    ) -> Result<()> {
        match recv {
            Output::Buf(buf) => blocking(buf, |shared| {
                self.start_scatterv(send, blocks, Some(shared), ty, root, Mode::Blocking)
            })
            .map(|_| ()),
            Output::InPlace => {
                let mut request =
                    self.start_scatterv(send, blocks, None, ty, root, Mode::Blocking)?;
                request.wait().map(|_| ())
            }
        }
    }

    /// Non-blocking scatter. `recv` is `None` for an in-place scatter at the root.
    pub fn iscatter<D: DataType<T>>(
        &self,
        send: &[D::Elem],
        recv: Option<SharedBuf<D::Elem>>,
        ty: &D,
        root: usize,
    ) -> Result<Request> {
        let count = match &recv {
            Some(buf) => buf.borrow().len(),
            None => send.len() / self.size().max(1),
        };
        let blocks = Blocks::uniform(count, self.size());
        self.start_scatterv(send, &blocks, recv, ty, root, Mode::NonBlocking)
    }

    pub fn iscatterv<D: DataType<T>>(
        &self,
        send: &[D::Elem],
        blocks: &Blocks,
        recv: Option<SharedBuf<D::Elem>>,
        ty: &D,
        root: usize,
    ) -> Result<Request> {
        self.start_scatterv(send, blocks, recv, ty, root, Mode::NonBlocking)
    }

    pub(crate) fn start_scatterv<D: DataType<T>>(
        &self,
        send: &[D::Elem],
        blocks: &Blocks,
        recv: Option<SharedBuf<D::Elem>>,
        ty: &D,
        root: usize,
        mode: Mode,
    ) -> Result<Request> {
        let is_root = self.rank() == root;
        if recv.is_none() && !is_root {
            return Err(Error::InvalidArgument(
                "scatterv: only the root may scatter in place".into(),
            ));
        }
        // In place, the root's block never leaves the send buffer.
        let own_range = |rank: usize| {
            if rank == root && recv.is_none() {
                0..0
            } else {
                blocks.range(rank)
            }
        };
        let mut sent = Vec::new();
        let parts = if is_root {
            blocks.check("scatterv", self.size(), send.len())?;
            let mut parts = Vec::with_capacity(self.size());
            for rank in 0..self.size() {
                let block = &send[own_range(rank)];
                parts.push(ty.pack(&*self.tool, block));
                sent.push(block);
            }
            Some(parts)
        } else {
            None
        };
        let raw = self.transport.iscatter(parts, root)?;
        let records = self.records(ty);
        let tracker = records.then(|| {
            let (mut send_indices, mut send_blocks) = (Vec::new(), Vec::new());
            for block in &sent {
                let indices = self.indices(ty, block);
                send_blocks.push(indices.len());
                send_indices.extend(indices);
            }
            let reversal = ScatterReversal {
                transport: self.transport.clone(),
                root,
                send_indices,
                send_blocks,
                recv_indices: Vec::new(),
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });
        let (tool, ty) = (self.tool.clone(), ty.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let (mut indices, mut old) = (Vec::new(), Vec::new());
            if let Some(recv) = recv {
                let bytes = std::mem::take(&mut completion.payload).into_bytes();
                let count = super::whole_elements("scatterv", bytes.len(), ty.modified_extent())?;
                let mut recv = recv.borrow_mut();
                if count > recv.len() {
                    return Err(Error::Truncated {
                        got: bytes.len(),
                        capacity: recv.len() * ty.modified_extent(),
                    });
                }
                let block = &mut recv[..count];
                ty.unpack(&*tool, &bytes, block);
                if records {
                    (indices, old) = register(&*tool, &ty, block);
                } else {
                    ty.clear_indices(&*tool, block);
                }
            }
            if let Some(tracker) = tracker {
                tracker.complete(&*tool, |reversal| {
                    reversal.recv_indices = indices;
                    reversal.old = old;
                });
            }
            Ok(())
        }))
    }

    /// Gathers `send` from every rank into consecutive blocks of `recv` on every rank.
    pub fn allgather<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
    ) -> Result<()> {
        let count = self.uniform_count(&send, recv.len());
        self.allgatherv(send, recv, &Blocks::uniform(count, self.size()), ty)
    }

    pub fn allgatherv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        blocks: &Blocks,
        ty: &D,
    ) -> Result<()> {
        blocking(recv, |shared| self.start_allgatherv(send, shared, blocks, ty, Mode::Blocking))
            .map(|_| ())
    }

    pub fn iallgather<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
    ) -> Result<Request> {
        let count = self.uniform_count(&send, recv.borrow().len());
        let blocks = Blocks::uniform(count, self.size());
        self.start_allgatherv(send, recv, &blocks, ty, Mode::NonBlocking)
    }

    pub fn iallgatherv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        blocks: &Blocks,
        ty: &D,
    ) -> Result<Request> {
        self.start_allgatherv(send, recv, blocks, ty, Mode::NonBlocking)
    }

    pub(crate) fn start_allgatherv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        blocks: &Blocks,
        ty: &D,
        mode: Mode,
    ) -> Result<Request> {
        blocks.check("allgatherv", self.size(), recv.borrow().len())?;
        let own = self.own_block("allgatherv", send, &recv, blocks.range(self.rank()))?;
        let raw = self.transport.iallgather(ty.pack(&*self.tool, &own))?;
        let records = self.records(ty);
        let tracker = records.then(|| {
            let reversal = AllgatherReversal {
                transport: self.transport.clone(),
                send_indices: self.indices(ty, &own),
                recv_indices: Vec::new(),
                recv_blocks: Vec::new(),
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });
        let (tool, ty, blocks) = (self.tool.clone(), ty.clone(), blocks.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let parts = std::mem::take(&mut completion.payload).into_parts();
            let mut recv = recv.borrow_mut();
            let (indices, sizes, old) = Self::receive_blocks(
                &*tool, &ty, "allgatherv", &parts, &blocks, &mut recv, records,
            )?;
            if let Some(tracker) = tracker {
                tracker.complete(&*tool, |reversal| {
                    reversal.recv_indices = indices;
                    reversal.recv_blocks = sizes;
                    reversal.old = old;
                });
            }
            Ok(())
        }))
    }

    /// Sends block `j` of `send` to rank `j` and receives block `i` of `recv` from rank `i`.
    pub fn alltoall<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
    ) -> Result<()> {
        let blocks = Blocks::uniform(recv.len() / self.size().max(1), self.size());
        self.alltoallv(send, &blocks, recv, &blocks, ty)
    }

    pub fn alltoallv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        send_blocks: &Blocks,
        recv: &mut [D::Elem],
        recv_blocks: &Blocks,
        ty: &D,
    ) -> Result<()> {
        blocking(recv, |shared| {
            self.start_alltoallv(send, send_blocks, shared, recv_blocks, ty, Mode::Blocking)
        })
        .map(|_| ())
    }

    pub fn ialltoall<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
    ) -> Result<Request> {
        let blocks = Blocks::uniform(recv.borrow().len() / self.size().max(1), self.size());
        self.start_alltoallv(send, &blocks, recv, &blocks, ty, Mode::NonBlocking)
    }

    pub fn ialltoallv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        send_blocks: &Blocks,
        recv: SharedBuf<D::Elem>,
        recv_blocks: &Blocks,
        ty: &D,
    ) -> Result<Request> {
        self.start_alltoallv(send, send_blocks, recv, recv_blocks, ty, Mode::NonBlocking)
    }

    pub(crate) fn start_alltoallv<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        send_blocks: &Blocks,
        recv: SharedBuf<D::Elem>,
        recv_blocks: &Blocks,
        ty: &D,
        mode: Mode,
    ) -> Result<Request> {
        let ranks = self.size();
        recv_blocks.check("alltoallv", ranks, recv.borrow().len())?;
        // In place, the send data is the receive buffer laid out by the receive blocks.
        let (send, send_blocks) = match send {
            Input::Buf(buf) => (buf.to_vec(), send_blocks),
            Input::InPlace => (recv.borrow().clone(), recv_blocks),
        };
        send_blocks.check("alltoallv", ranks, send.len())?;
        let parts = (0..ranks)
            .map(|rank| ty.pack(&*self.tool, &send[send_blocks.range(rank)]))
            .collect();
        let raw = self.transport.ialltoall(parts)?;
        let records = self.records(ty);
        let tracker = records.then(|| {
            let (mut indices, mut sizes) = (Vec::new(), Vec::new());
            for rank in 0..ranks {
                let block = self.indices(ty, &send[send_blocks.range(rank)]);
                sizes.push(block.len());
                indices.extend(block);
            }
            let reversal = AlltoallReversal {
                transport: self.transport.clone(),
                send_indices: indices,
                send_blocks: sizes,
                recv_indices: Vec::new(),
                recv_blocks: Vec::new(),
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });
        let (tool, ty, recv_blocks) = (self.tool.clone(), ty.clone(), recv_blocks.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let parts = std::mem::take(&mut completion.payload).into_parts();
            let mut recv = recv.borrow_mut();
            let (indices, sizes, old) = Self::receive_blocks(
                &*tool, &ty, "alltoallv", &parts, &recv_blocks, &mut recv, records,
            )?;
            if let Some(tracker) = tracker {
                tracker.complete(&*tool, |reversal| {
                    reversal.recv_indices = indices;
                    reversal.recv_blocks = sizes;
                    reversal.old = old;
                });
            }
            Ok(())
        }))
    }

    /// Barrier. While the adapter records, the reverse sweep runs a barrier at the same point.
    pub fn barrier(&self) -> Result<()> {
        self.start_barrier(Mode::Blocking)?.wait().map(|_| ())
    }

    pub fn ibarrier(&self) -> Result<Request> {
        self.start_barrier(Mode::NonBlocking)
    }

    pub(crate) fn start_barrier(&self, mode: Mode) -> Result<Request> {
        let raw = self.transport.ibarrier()?;
        if !self.tool.is_handle_required() {
            return Ok(Request::new(self.transport.clone(), raw));
        }
        let reversal = BarrierReversal {
            transport: self.transport.clone(),
        };
        let tracker = Tracker::<T, _>::issue(&*self.tool, reversal, mode);
        let tool = self.tool.clone();
        Ok(Request::with_continuation(self.transport.clone(), raw, move |_| {
            tracker.complete(&*tool, |_| {});
            Ok(())
        }))
    }
}

