//! Reductions: reduce, all-reduce, scan and exscan.
//!
//! The operator is first mapped onto the descriptor's built-in with the same primal
//! function. Then one of four paths runs:
//!
//! 1.  Passive data: the transport reduces with a wire closure built from the operator.
//! 2.  Active data, adjoint-capable operator: the transport reduces the primal values and
//!     the reverse is recorded as one [`ReduceReversal`].
//! 3.  As 2, for operators that need the result on every contributor while the adapter
//!     records: a reduce is executed as an all-reduce and non-roots drop the result.
//! 4.  Active data, forward-only operator (and every active scan): the inputs are
//!     gathered with the recorded gather primitives and folded locally, so the adapter
//!     records the arithmetic of the fold itself.

use super::collective::Blocks;
use super::{
    blocking, expect_bytes, indices_of, register, shared, values_of, AdComm, Input, SharedBuf,
};
use crate::error::{Error, Result};
use crate::op::Operator;
use crate::request::Request;
use crate::reverse::{Mode, ReduceReversal, Tracker};
use crate::tool::AdTool;
use crate::transport::WireOp;
use crate::types::DataType;
use std::rc::Rc;
use tracing::debug;

/// Which reduction a call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduction {
    Reduce(usize),
    Allreduce,
    Scan,
    Exscan,
}

impl Reduction {
    fn name(self) -> &'static str {
        match self {
            Reduction::Reduce(_) => "reduce",
            Reduction::Allreduce => "allreduce",
            Reduction::Scan => "scan",
            Reduction::Exscan => "exscan",
        }
    }

    /// Whether this rank's receive buffer receives a result.
    fn has_result(self, rank: usize) -> bool {
        match self {
            Reduction::Reduce(root) => rank == root,
            Reduction::Exscan => rank != 0,
            Reduction::Allreduce | Reduction::Scan => true,
        }
    }

    fn root(self) -> Option<usize> {
        match self {
            Reduction::Reduce(root) => Some(root),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Passive,
    Direct,
    AllreduceRewrite,
    Gathered,
}

/// Builds the transport-level closure for `op` on the wire encoding of `ty`.
///
/// Uses the operator's modified function when it has one. Otherwise the wire elements
/// are unpacked into user elements, reduced with the primal function, and packed again.
pub fn wire_op<T: AdTool, D: DataType<T>>(op: &Operator<T, D>, ty: &D, tool: &Rc<T>) -> WireOp {
    let ty = ty.clone();
    let extent = ty.modified_extent();
    match op.modified_fn() {
        Some(modified) => Rc::new(move |input: &[u8], inout: &mut [u8]| {
            let Some(count) = inout.len().checked_div(extent) else {
                return;
            };
            let mut a = ty.create_modified_buffer(count);
            let mut b = ty.create_modified_buffer(count);
            ty.decode(input, &mut a);
            ty.decode(inout, &mut b);
            modified(&a, &mut b);
            let mut out = Vec::with_capacity(inout.len());
            ty.encode(&b, &mut out);
            inout[..out.len()].copy_from_slice(&out);
        }),
        None => {
            let tool = tool.clone();
            let primal = op.primal_fn();
            Rc::new(move |input: &[u8], inout: &mut [u8]| {
                let Some(count) = inout.len().checked_div(extent) else {
                    return;
                };
                let mut a = ty.create_type_buffer(count);
                let mut b = ty.create_type_buffer(count);
                ty.unpack(&*tool, input, &mut a);
                ty.unpack(&*tool, inout, &mut b);
                primal(&a, &mut b);
                let out = ty.pack(&*tool, &b);
                inout[..out.len()].copy_from_slice(&out);
            })
        }
    }
}

impl<T: AdTool> AdComm<T> {
    /// Reduces `send` from every rank into `recv` at the root.
    ///
    /// # Arguments
    /// * `send` - Contribution of this rank. [`Input::InPlace`] is valid at the root only
    ///   and takes the contribution from `recv`.
    /// * `recv` - Result at the root. Not touched on other ranks, may be empty there.
    /// * `ty` - Element descriptor.
    /// * `op` - Reduction operator.
    /// * `root` - Rank receiving the result.
    pub fn reduce<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
        op: &Operator<T, D>,
        root: usize,
    ) -> Result<()> {
        let reduction = Reduction::Reduce(root);
        blocking(recv, |shared| {
            self.start_reduction(reduction, send, shared, ty, op, Mode::Blocking)
        })
        .map(|_| ())
    }

    pub fn ireduce<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: &Operator<T, D>,
        root: usize,
    ) -> Result<Request> {
        self.start_reduction(Reduction::Reduce(root), send, recv, ty, op, Mode::NonBlocking)
    }

    pub fn allreduce<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
        op: &Operator<T, D>,
    ) -> Result<()> {
        blocking(recv, |shared| {
            self.start_reduction(Reduction::Allreduce, send, shared, ty, op, Mode::Blocking)
        })
        .map(|_| ())
    }

    pub fn iallreduce<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: &Operator<T, D>,
    ) -> Result<Request> {
        self.start_reduction(Reduction::Allreduce, send, recv, ty, op, Mode::NonBlocking)
    }

    /// Inclusive prefix reduction over ranks `0..=rank`.
    pub fn scan<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
        op: &Operator<T, D>,
    ) -> Result<()> {
        blocking(recv, |shared| {
            self.start_reduction(Reduction::Scan, send, shared, ty, op, Mode::Blocking)
        })
            .map(|_| ())
    }

    pub fn iscan<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: &Operator<T, D>,
    ) -> Result<Request> {
        self.start_reduction(Reduction::Scan, send, recv, ty, op, Mode::NonBlocking)
    }

    /// Exclusive prefix reduction over ranks `0..rank`. `recv` of rank 0 is left untouched.
    pub fn exscan<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: &mut [D::Elem],
        ty: &D,
        op: &Operator<T, D>,
    ) -> Result<()> {
        blocking(recv, |shared| {
            self.start_reduction(Reduction::Exscan, send, shared, ty, op, Mode::Blocking)
        })
        .map(|_| ())
    }

    pub fn iexscan<D: DataType<T>>(
        &self,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: &Operator<T, D>,
    ) -> Result<Request> {
        self.start_reduction(Reduction::Exscan, send, recv, ty, op, Mode::NonBlocking)
    }

    fn select_path<D: DataType<T>>(
        &self,
        reduction: Reduction,
        op: &Operator<T, D>,
        ty: &D,
    ) -> Path {
        if !ty.is_active() {
            Path::Passive
        } else if !op.has_adjoint() || matches!(reduction, Reduction::Scan | Reduction::Exscan) {
            Path::Gathered
        } else if reduction.root().is_some()
            && op.requires_primal_send()
            && self.tool.is_handle_required()
        {
            Path::AllreduceRewrite
        } else {
            Path::Direct
        }
    }

    fn start_reduction<D: DataType<T>>(
        &self,
        reduction: Reduction,
        send: Input<'_, D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: &Operator<T, D>,
        mode: Mode,
    ) -> Result<Request> {
        let call = reduction.name();
        let has_result = reduction.has_result(self.rank());
        let own = match send {
            Input::Buf(buf) => buf.to_vec(),
            Input::InPlace if has_result || reduction == Reduction::Exscan => recv.borrow().clone(),
            Input::InPlace => {
                return Err(Error::InvalidArgument(format!(
                    "{call}: only the root may reduce in place"
                )));
            }
        };
        let count = own.len();
        if has_result && recv.borrow().len() < count {
            return Err(Error::InvalidArgument(format!(
                "{call}: receive buffer holds {} elements, {count} needed",
                recv.borrow().len()
            )));
        }

        let op = op.canonical(ty);
        let path = self.select_path(reduction, &op, ty);
        debug!(
            call,
            ?path,
            kind = ?op.kind(),
            commutes = op.commutes(),
            count,
            "reduction dispatch"
        );
        match path {
            Path::Gathered => self.start_gathered(reduction, own, recv, ty, op, mode),
            _ => self.start_transport_reduction(reduction, path, own, recv, ty, op, mode),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start_transport_reduction<D: DataType<T>>(
        &self,
        reduction: Reduction,
        path: Path,
        own: Vec<D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: Operator<T, D>,
        mode: Mode,
    ) -> Result<Request> {
        let call = reduction.name();
        let count = own.len();
        let has_result = reduction.has_result(self.rank());
        let wire = wire_op(&op, ty, &self.tool);
        let bytes = ty.pack(&*self.tool, &own);
        let raw = match reduction {
            Reduction::Reduce(root) if path != Path::AllreduceRewrite => {
                self.transport.ireduce(bytes, wire, root)?
            }
            Reduction::Reduce(_) | Reduction::Allreduce => self.transport.iallreduce(bytes, wire)?,
            Reduction::Scan => self.transport.iscan(bytes, wire)?,
            Reduction::Exscan => self.transport.iexscan(bytes, wire)?,
        };

        let records = path != Path::Passive && self.tool.is_handle_required();
        let own_modified = (records && op.requires_primal_send()).then(|| {
            let mut modified = ty.create_modified_buffer(count);
            ty.copy_into_modified_buffer(&*self.tool, &own, &mut modified);
            modified
        });
        let requires_primal = op.requires_primal();
        let tracker = records.then(|| {
            let reversal = ReduceReversal {
                transport: self.transport.clone(),
                root: reduction.root(),
                own_indices: indices_of(&*self.tool, ty, &own),
                own_primals: if requires_primal {
                    values_of(&*self.tool, ty, &own)
                } else {
                    Vec::new()
                },
                op,
                has_result,
                result_indices: Vec::new(),
                result_primals: Vec::new(),
                claims: Vec::new(),
                old: Vec::new(),
            };
            Tracker::issue(&*self.tool, reversal, mode)
        });

        let (tool, ty) = (self.tool.clone(), ty.clone());
        Ok(Request::with_continuation(self.transport.clone(), raw, move |completion| {
            let bytes = std::mem::take(&mut completion.payload).into_bytes();
            let result = if bytes.is_empty() {
                None
            } else {
                expect_bytes(call, bytes.len(), count * ty.modified_extent())?;
                let mut result = ty.create_modified_buffer(count);
                ty.decode(&bytes, &mut result);
                Some(result)
            };

            let (mut result_indices, mut old) = (Vec::new(), Vec::new());
            let mut result_primals = Vec::new();
            match (&result, has_result) {
                (Some(result), true) => {
                    let mut recv = recv.borrow_mut();
                    let target = &mut recv[..count];
                    ty.copy_from_modified_buffer(&*tool, result, target);
                    if tracker.is_some() {
                        (result_indices, old) = register(&*tool, &ty, target);
                        if requires_primal {
                            result_primals = values_of(&*tool, &ty, target);
                        }
                    } else {
                        ty.clear_indices(&*tool, target);
                    }
                }
                // A reduce executed as an all-reduce: the result only feeds the hooks here.
                (Some(result), false) if tracker.is_some() && requires_primal => {
                    let mut scratch = ty.create_type_buffer(count);
                    ty.copy_from_modified_buffer(&*tool, result, &mut scratch);
                    result_primals = values_of(&*tool, &ty, &scratch);
                }
                _ => {}
            }

            if let Some(tracker) = tracker {
                let claims = match (&own_modified, &result) {
                    (Some(own), Some(result)) => {
                        own.iter().zip(result).map(|(a, b)| u8::from(a == b)).collect()
                    }
                    _ => Vec::new(),
                };
                tracker.complete(&*tool, |reversal| {
                    reversal.result_indices = result_indices;
                    reversal.result_primals = result_primals;
                    reversal.claims = claims;
                    reversal.old = old;
                });
            }
            Ok(())
        }))
    }

    /// Gathers every contribution, then folds the ones this rank needs on the adapter.
    fn start_gathered<D: DataType<T>>(
        &self,
        reduction: Reduction,
        own: Vec<D::Elem>,
        recv: SharedBuf<D::Elem>,
        ty: &D,
        op: Operator<T, D>,
        mode: Mode,
    ) -> Result<Request> {
        let (rank, size, count) = (self.rank(), self.size(), own.len());
        let ranks = match reduction {
            Reduction::Reduce(root) if rank != root => 0,
            Reduction::Reduce(_) | Reduction::Allreduce => size,
            Reduction::Scan => rank + 1,
            Reduction::Exscan => rank,
        };
        let scratch_len = if ranks == 0 && reduction.root().is_some() { 0 } else { size * count };
        let scratch = shared(ty.create_type_buffer(scratch_len));
        let blocks = Blocks::uniform(count, size);
        let request = match reduction {
            Reduction::Reduce(root) => {
                self.start_gatherv(Input::Buf(&own), scratch.clone(), &blocks, ty, root, mode)?
            }
            _ => self.start_allgatherv(Input::Buf(&own), scratch.clone(), &blocks, ty, mode)?,
        };
        let ty = ty.clone();
        request.chain(move |_| {
            if ranks > 0 {
                let mut target = recv.borrow_mut();
                ty.perform_reduce(&scratch.borrow(), &mut target[..count], count, &op, ranks);
            }
            Ok(())
        })
    }
}
