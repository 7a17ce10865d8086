//! # Reverse Communication Library
//!
//! For every forward primitive, the communication that moves adjoints along the
//! transpose of its data flow:
//!
//! | forward | reverse |
//! |---|---|
//! | send | receive of the adjoints from the original receiver |
//! | receive | send of the adjoints back to the original sender |
//! | broadcast | gather of the adjoints at the root, summed |
//! | gather(v) | scatter(v) of the adjoints from the root |
//! | scatter(v) | gather(v) of the adjoints at the root |
//! | all-gather(v) | all-to-all of the adjoints, summed |
//! | all-to-all(v) | all-to-all(v) of the adjoints |
//! | reduce | broadcast of the result adjoints (and result primals if needed) |
//! | all-reduce, or a reduce run as one | adjoint all-reduce sum, then a tie-break all-gather |
//! | barrier | barrier |
//!
//! Every reversal is written once, as two phases: [`Reversal::start`] reads the
//! adjoints and issues the reverse communication without blocking, and
//! [`Reversal::finish`] consumes its completion and updates the adjoints. A blocking
//! primitive records both phases as one [`Action::Normal`]. A non-blocking primitive
//! records an [`Action::Async`] when it is issued and an [`Action::Wait`] when it
//! completes, so that in the reverse sweep the reverse communication is started at the
//! completion point and finished at the issue point.

use crate::error::Result;
use crate::op::{adjoint_sum, OpKind, Operator};
use crate::tool::{Action, AdTool, AsyncReverse, AsyncSlot, Real, ReverseHandle};
use crate::transport::{RawCompletion, RawRequest, SendMode, Source, Tag, Transport, WireOp};
use crate::types::{decode_pod, DataType};
use num_traits::{One, Zero};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// The reverse of one forward primitive, split around its reverse communication.
pub(crate) trait Reversal<T: AdTool>: 'static {
    fn name(&self) -> &'static str;

    fn transport(&self) -> &Rc<dyn Transport>;

    /// Issues the reverse communication. `None` if there is nothing to communicate.
    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>>;

    /// Consumes the completed reverse communication.
    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()>;
}

/// A reversal plus the reverse request it may have in flight.
pub(crate) struct Deferred<R> {
    reversal: R,
    raw: Option<RawRequest>,
}

impl<T: AdTool, R: Reversal<T>> AsyncReverse<T> for Deferred<R> {
    fn name(&self) -> &'static str {
        self.reversal.name()
    }

    fn start(&mut self, tool: &T) -> Result<()> {
        self.raw = self.reversal.start(tool)?;
        Ok(())
    }

    fn finish(&mut self, tool: &T) -> Result<()> {
        let completion = match self.raw.take() {
            Some(raw) => Some(self.reversal.transport().wait(raw)?),
            None => None,
        };
        self.reversal.finish(tool, completion)
    }
}

/// Both phases back to back, for blocking primitives.
struct Immediate<R>(Rc<RefCell<Deferred<R>>>);

impl<T: AdTool, R: Reversal<T>> ReverseHandle<T> for Immediate<R> {
    fn name(&self) -> &'static str {
        self.0.borrow().reversal.name()
    }

    fn reverse(&mut self, tool: &T) -> Result<()> {
        let mut work = self.0.borrow_mut();
        AsyncReverse::<T>::start(&mut *work, tool)?;
        AsyncReverse::<T>::finish(&mut *work, tool)
    }
}

/// Whether a primitive blocks until completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Blocking,
    NonBlocking,
}

/// Pushes one action into the adapter's record.
pub(crate) fn record<T: AdTool>(tool: &T, action: Action<T>) {
    trace!(name = action.name(), "record reverse action");
    tool.start_assembly();
    tool.add_tool_action(action);
    tool.stop_assembly();
}

/// Records a primitive's reversal: at issue for non-blocking primitives, and always
/// once the primitive completed.
pub(crate) struct Tracker<T: AdTool, R: Reversal<T>> {
    work: Rc<RefCell<Deferred<R>>>,
    slot: Option<AsyncSlot<T>>,
}

impl<T: AdTool, R: Reversal<T>> Tracker<T, R> {
    pub(crate) fn issue(tool: &T, reversal: R, mode: Mode) -> Self {
        let work = Rc::new(RefCell::new(Deferred { reversal, raw: None }));
        let slot = match mode {
            Mode::Blocking => None,
            Mode::NonBlocking => {
                let slot = AsyncSlot::new(work.clone());
                record(tool, Action::Async(slot.clone()));
                Some(slot)
            }
        };
        Self { work, slot }
    }

    /// Fills in what only the completion knows and records the completion-side action.
    pub(crate) fn complete(self, tool: &T, fill: impl FnOnce(&mut R)) {
        fill(&mut self.work.borrow_mut().reversal);
        match self.slot {
            Some(slot) => record(tool, Action::Wait(slot)),
            None => record(tool, Action::Normal(Box::new(Immediate(self.work)))),
        }
    }
}

pub(crate) fn to_bytes<R: Real>(values: &[R]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub(crate) fn from_bytes<R: Real>(bytes: &[u8]) -> Vec<R> {
    let mut out = vec![R::zero(); bytes.len() / std::mem::size_of::<R>()];
    decode_pod(bytes, &mut out);
    out
}

/// Element-wise sum of raw adjoint payloads.
pub(crate) fn real_sum<R: Real>() -> WireOp {
    Rc::new(|input: &[u8], inout: &mut [u8]| {
        let a: Vec<R> = from_bytes(input);
        let mut b: Vec<R> = from_bytes(inout);
        adjoint_sum(&a, &mut b);
        inout.copy_from_slice(bytemuck::cast_slice(&b));
    })
}

fn take_adjoints<T: AdTool>(tool: &T, indices: &[T::Index]) -> Vec<T::Real> {
    let mut adjoints = tool.create_adjoint_buffer(indices.len());
    tool.get_adjoints(indices, &mut adjoints);
    adjoints
}

fn restore<T: AdTool>(tool: &T, indices: &[T::Index], old: &[T::Real]) {
    if tool.is_old_primals_required() && !indices.is_empty() {
        tool.set_reverse_values(indices, old);
    }
}

fn payload(completion: Option<RawCompletion>) -> Vec<u8> {
    completion.map(|c| c.payload.into_bytes()).unwrap_or_default()
}

fn parts(completion: Option<RawCompletion>) -> Vec<Vec<u8>> {
    completion.map(|c| c.payload.into_parts()).unwrap_or_default()
}

/// Slot ranges of consecutive per-rank blocks.
fn ranges(blocks: &[usize]) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
    blocks.iter().scan(0, |start, len| {
        let range = *start..*start + len;
        *start += len;
        Some(range)
    })
}

fn split_bytes<R: Real>(values: &[R], blocks: &[usize]) -> Vec<Vec<u8>> {
    ranges(blocks).map(|r| to_bytes(&values[r])).collect()
}

/// Adds the per-rank adjoint parts onto the matching blocks of `indices`.
fn update_blocks<T: AdTool>(tool: &T, indices: &[T::Index], blocks: &[usize], parts: &[Vec<u8>]) {
    for (range, part) in ranges(blocks).zip(parts) {
        if !range.is_empty() {
            let adjoints: Vec<T::Real> = from_bytes(part);
            tool.update_adjoints(&indices[range], &adjoints);
        }
    }
}

/// Reverse of a send: receive the adjoints of the sent values.
pub(crate) struct SendReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    pub dest: usize,
    pub tag: Tag,
    pub indices: Vec<T::Index>,
}

impl<T: AdTool> Reversal<T> for SendReversal<T> {
    fn name(&self) -> &'static str {
        "send"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, _tool: &T) -> Result<Option<RawRequest>> {
        let capacity = self.indices.len() * std::mem::size_of::<T::Real>();
        Ok(Some(self.transport.irecv(Source::Rank(self.dest), self.tag, capacity)?))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        let adjoints: Vec<T::Real> = from_bytes(&payload(completion));
        let n = adjoints.len().min(self.indices.len());
        tool.update_adjoints(&self.indices[..n], &adjoints[..n]);
        Ok(())
    }
}

/// Reverse of a receive: send the adjoints back to where the values came from.
pub(crate) struct RecvReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    /// Actual source and tag; `None` until the receive completed.
    pub peer: Option<(usize, Tag)>,
    pub indices: Vec<T::Index>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool> Reversal<T> for RecvReversal<T> {
    fn name(&self) -> &'static str {
        "recv"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let Some((source, tag)) = self.peer else {
            return Ok(None);
        };
        let adjoints = take_adjoints(tool, &self.indices);
        Ok(Some(self.transport.isend(to_bytes(&adjoints), source, tag, SendMode::Standard)?))
    }

    fn finish(&mut self, tool: &T, _completion: Option<RawCompletion>) -> Result<()> {
        restore(tool, &self.indices, &self.old);
        Ok(())
    }
}

/// Reverse of a broadcast: gather the adjoints at the root and sum them there.
pub(crate) struct BcastReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    pub root: usize,
    pub indices: Vec<T::Index>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool> Reversal<T> for BcastReversal<T> {
    fn name(&self) -> &'static str {
        "bcast"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let adjoints = if self.transport.rank() == self.root {
            // The root's own adjoint stays in its accumulator.
            tool.create_adjoint_buffer(self.indices.len())
        } else {
            take_adjoints(tool, &self.indices)
        };
        Ok(Some(self.transport.igather(to_bytes(&adjoints), self.root)?))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        if self.transport.rank() == self.root {
            let len = self.indices.len();
            let parts = parts(completion);
            let ranks = parts.len();
            let mut adjoints: Vec<T::Real> = from_bytes(&parts.concat());
            if len > 0 && adjoints.len() == len * ranks {
                tool.combine_adjoints(&mut adjoints, len, ranks);
                tool.update_adjoints(&self.indices, &adjoints[..len]);
            }
        } else {
            restore(tool, &self.indices, &self.old);
        }
        Ok(())
    }
}

/// Reverse of a gather(v): scatter the adjoints of every received block back.
pub(crate) struct GatherReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    pub root: usize,
    pub send_indices: Vec<T::Index>,
    /// Root only: indices of the received blocks, in rank order.
    pub recv_indices: Vec<T::Index>,
    /// Root only: slots per rank block.
    pub recv_blocks: Vec<usize>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool> Reversal<T> for GatherReversal<T> {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let parts = if self.transport.rank() == self.root {
            let adjoints = take_adjoints(tool, &self.recv_indices);
            Some(split_bytes(&adjoints, &self.recv_blocks))
        } else {
            None
        };
        Ok(Some(self.transport.iscatter(parts, self.root)?))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        let adjoints: Vec<T::Real> = from_bytes(&payload(completion));
        if adjoints.len() == self.send_indices.len() {
            tool.update_adjoints(&self.send_indices, &adjoints);
        }
        restore(tool, &self.recv_indices, &self.old);
        Ok(())
    }
}

/// Reverse of a scatter(v): gather the adjoints of every sent block at the root.
pub(crate) struct ScatterReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    pub root: usize,
    /// Root only: indices of the sent blocks, in rank order.
    pub send_indices: Vec<T::Index>,
    /// Root only: slots per rank block.
    pub send_blocks: Vec<usize>,
    pub recv_indices: Vec<T::Index>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool> Reversal<T> for ScatterReversal<T> {
    fn name(&self) -> &'static str {
        "scatter"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let adjoints = take_adjoints(tool, &self.recv_indices);
        Ok(Some(self.transport.igather(to_bytes(&adjoints), self.root)?))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        if self.transport.rank() == self.root {
            update_blocks(tool, &self.send_indices, &self.send_blocks, &parts(completion));
        }
        restore(tool, &self.recv_indices, &self.old);
        Ok(())
    }
}

/// Reverse of an all-gather(v): every rank returns the adjoints of each received block
/// to its owner, which sums them.
pub(crate) struct AllgatherReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    pub send_indices: Vec<T::Index>,
    pub recv_indices: Vec<T::Index>,
    pub recv_blocks: Vec<usize>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool> Reversal<T> for AllgatherReversal<T> {
    fn name(&self) -> &'static str {
        "allgather"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let adjoints = take_adjoints(tool, &self.recv_indices);
        let parts = split_bytes(&adjoints, &self.recv_blocks);
        Ok(Some(self.transport.ialltoall(parts)?))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        let len = self.send_indices.len();
        let parts = parts(completion);
        let ranks = parts.len();
        let mut adjoints: Vec<T::Real> = from_bytes(&parts.concat());
        if len > 0 && adjoints.len() == len * ranks {
            tool.combine_adjoints(&mut adjoints, len, ranks);
            tool.update_adjoints(&self.send_indices, &adjoints[..len]);
        }
        restore(tool, &self.recv_indices, &self.old);
        Ok(())
    }
}

/// Reverse of an all-to-all(v): send the adjoints of each received block back.
pub(crate) struct AlltoallReversal<T: AdTool> {
    pub transport: Rc<dyn Transport>,
    pub send_indices: Vec<T::Index>,
    pub send_blocks: Vec<usize>,
    pub recv_indices: Vec<T::Index>,
    pub recv_blocks: Vec<usize>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool> Reversal<T> for AlltoallReversal<T> {
    fn name(&self) -> &'static str {
        "alltoall"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let adjoints = take_adjoints(tool, &self.recv_indices);
        let parts = split_bytes(&adjoints, &self.recv_blocks);
        Ok(Some(self.transport.ialltoall(parts)?))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        update_blocks(tool, &self.send_indices, &self.send_blocks, &parts(completion));
        restore(tool, &self.recv_indices, &self.old);
        Ok(())
    }
}

/// Reverse of a barrier.
pub(crate) struct BarrierReversal {
    pub transport: Rc<dyn Transport>,
}

impl<T: AdTool> Reversal<T> for BarrierReversal {
    fn name(&self) -> &'static str {
        "barrier"
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, _tool: &T) -> Result<Option<RawRequest>> {
        Ok(Some(self.transport.ibarrier()?))
    }

    fn finish(&mut self, _tool: &T, _completion: Option<RawCompletion>) -> Result<()> {
        Ok(())
    }
}

/// Reverse of a reduction executed by the transport with an adjoint-capable operator.
///
/// *   `root: Some(r)` and no primal send: the root broadcasts the result adjoints,
///     followed by the result primals when the operator requires them.
/// *   otherwise (all-reduce, or a reduce that was executed as an all-reduce): all-reduce
///     sum of the adjoints. Ranks that did not keep the result contribute zeros.
///
/// For operators that send the primal back, a rank keeps its adjoint only if its input
/// was selected and no lower rank's input was selected as well.
///
/// For the product, elements whose result is zero get `seed · Π_{r≠rank} x_r` from an
/// all-gather of the inputs, since the quotient `result / own` is undefined there.
pub(crate) struct ReduceReversal<T: AdTool, D: DataType<T>> {
    pub transport: Rc<dyn Transport>,
    pub root: Option<usize>,
    pub op: Operator<T, D>,
    pub own_indices: Vec<T::Index>,
    pub own_primals: Vec<T::Real>,
    pub has_result: bool,
    pub result_indices: Vec<T::Index>,
    pub result_primals: Vec<T::Real>,
    /// Per element, whether this rank's input equals the result.
    pub claims: Vec<u8>,
    pub old: Vec<T::Real>,
}

impl<T: AdTool, D: DataType<T>> ReduceReversal<T, D> {
    fn broadcasts(&self) -> bool {
        self.root.is_some() && !self.op.requires_primal_send()
    }

    /// Zeroes the adjoints of elements another, lower rank also claims.
    fn tie_break(&self, adjoints: &mut [T::Real]) -> Result<()> {
        let claims = self.transport.allgather(self.claims.clone())?;
        let rank = self.transport.rank();
        let count = self.claims.len();
        if count == 0 {
            return Ok(());
        }
        let slots = adjoints.len() / count;
        for element in 0..count {
            let winner = claims
                .iter()
                .position(|flags| flags.get(element).copied().unwrap_or(0) != 0);
            if winner.is_some_and(|w| w != rank) {
                for adjoint in &mut adjoints[element * slots..(element + 1) * slots] {
                    *adjoint = T::Real::zero();
                }
            }
        }
        Ok(())
    }

    /// Overwrites the adjoints of zero-product elements with the exclusive products.
    ///
    /// `result_primals` is the same on every contributor, so either all ranks take part
    /// in the all-gather or none does.
    fn exclusive_products(&self, adjoints: &mut [T::Real], seeds: &[T::Real]) -> Result<()> {
        if !self.result_primals.iter().any(|r| r.is_zero()) {
            return Ok(());
        }
        let inputs: Vec<Vec<T::Real>> = self
            .transport
            .allgather(to_bytes(&self.own_primals))?
            .iter()
            .map(|bytes| from_bytes(bytes))
            .collect();
        let rank = self.transport.rank();
        for (element, result) in self.result_primals.iter().enumerate() {
            if !result.is_zero() {
                continue;
            }
            let others = inputs
                .iter()
                .enumerate()
                .filter(|(r, _)| *r != rank)
                .map(|(_, x)| x.get(element).copied().unwrap_or_else(T::Real::zero))
                .fold(T::Real::one(), |product, x| product * x);
            adjoints[element] = seeds[element] * others;
        }
        Ok(())
    }
}

impl<T: AdTool, D: DataType<T>> Reversal<T> for ReduceReversal<T, D> {
    fn name(&self) -> &'static str {
        if self.root.is_some() {
            "reduce"
        } else {
            "allreduce"
        }
    }

    fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    fn start(&mut self, tool: &T) -> Result<Option<RawRequest>> {
        let mut adjoints = if self.has_result {
            let mut adjoints = take_adjoints(tool, &self.result_indices);
            self.op.pre_adjoint(&mut adjoints, &self.own_primals, &self.result_primals);
            adjoints
        } else {
            tool.create_adjoint_buffer(self.own_indices.len())
        };
        let raw = match self.root {
            Some(root) if self.broadcasts() => {
                let data = (self.transport.rank() == root).then(|| {
                    if self.op.requires_primal() {
                        adjoints.extend_from_slice(&self.result_primals);
                    }
                    to_bytes(&adjoints)
                });
                self.transport.ibcast(data, root)?
            }
            _ => self.transport.iallreduce(to_bytes(&adjoints), real_sum::<T::Real>())?,
        };
        Ok(Some(raw))
    }

    fn finish(&mut self, tool: &T, completion: Option<RawCompletion>) -> Result<()> {
        let n = self.own_indices.len();
        let received: Vec<T::Real> = from_bytes(&payload(completion));
        if received.len() < n {
            return Ok(());
        }
        let seeds = &received[..n];
        let mut adjoints = seeds.to_vec();
        if self.broadcasts() && self.op.requires_primal() && received.len() >= 2 * n {
            self.result_primals = received[n..2 * n].to_vec();
        }
        self.op.post_adjoint(&mut adjoints, &self.own_primals, &self.result_primals);
        if self.op.kind() == OpKind::Prod {
            self.exclusive_products(&mut adjoints, seeds)?;
        }
        if self.op.requires_primal_send() {
            self.tie_break(&mut adjoints)?;
        }
        tool.update_adjoints(&self.own_indices, &adjoints);
        if self.has_result {
            restore(tool, &self.result_indices, &self.old);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_follow_blocks() {
        let r: Vec<_> = ranges(&[2, 0, 3]).collect();
        assert_eq!(r, vec![0..2, 2..2, 2..5]);
    }

    #[test]
    fn test_real_sum_on_unaligned_bytes() {
        let op = real_sum::<f64>();
        let mut inout = to_bytes(&[1.0f64, 2.0]);
        op(&to_bytes(&[0.5f64, 0.25]), &mut inout);
        assert_eq!(from_bytes::<f64>(&inout), vec![1.5, 2.25]);
    }

    #[test]
    fn test_split_bytes() {
        let parts = split_bytes(&[1.0f32, 2.0, 3.0], &[1, 2]);
        assert_eq!(parts.len(), 2);
        assert_eq!(from_bytes::<f32>(&parts[1]), vec![2.0, 3.0]);
    }
}
