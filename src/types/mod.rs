//! # Buffer & Type Descriptors
//!
//! A [`DataType`] tells the engine how to move one logical element between its user
//! representation (`Elem`) and the wire, and how to get at the AD metadata of the
//! element. Descriptors are stateless values: cheap to clone, read-only, shared by every
//! message that uses them.
//!
//! Each element has two representations besides the user one:
//!
//! *   the **modified** representation (`Modified`), which is what actually travels. For
//!     AD-active scalars it is the bare primal value; for passive data it equals the user
//!     element.
//! *   the **wire bytes**, produced by [`DataType::encode`] from modified elements.
//!
//! Metadata is always addressed through flat index/primal buffers with
//! [`DataType::active_elements`] slots per `count` elements: one per element for active
//! scalars, none for passive data, the sum over members for structs.
//!
//! | Descriptor | `Elem` | `Modified` | active slots |
//! |---|---|---|---|
//! | [`ActiveType<T>`] | `T::Value` | `T::Real` | 1 |
//! | [`PassiveType<P>`] | `P` | `P` | 0 |
//! | [`ValueLocType<D>`] | `Loc<D::Elem>` | `Loc<D::Modified>` | as `D` |
//! | [`StructType<S, T>`] | `S` | packed bytes | Σ members |

use crate::op::{Operator, Reducible};
use crate::tool::AdTool;
use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;

pub mod compose;
pub mod loc;

pub use compose::{StructLayout, StructType, StructTypeBuilder};
pub use loc::{Loc, ValueLocType};

/// Strategy object describing one element class.
pub trait DataType<T: AdTool>: Clone + 'static {
    /// User representation of one element.
    type Elem: Clone + Default + 'static;
    /// Wire representation of one element, with the AD metadata stripped.
    type Modified: Clone + Default + PartialEq + 'static;

    /// Whether elements carry differentiable metadata.
    fn is_active(&self) -> bool;

    /// Number of index slots needed for `count` elements.
    fn active_elements(&self, count: usize) -> usize;

    /// Size in bytes of one user element.
    fn extent(&self) -> usize {
        std::mem::size_of::<Self::Elem>()
    }

    /// Size in bytes of one encoded modified element.
    fn modified_extent(&self) -> usize;

    /// Whether user elements have to go through a modified buffer before encoding.
    fn is_modified_buffer_required(&self) -> bool;

    /// Whether the encoded modified element contains padding bytes.
    fn modified_has_holes(&self) -> bool {
        false
    }

    fn copy_into_modified_buffer(
        &self,
        tool: &T,
        buf: &[Self::Elem],
        modified: &mut [Self::Modified],
    );

    /// Writes primal values back into user elements. Metadata of `buf` is left as is.
    fn copy_from_modified_buffer(
        &self,
        tool: &T,
        modified: &[Self::Modified],
        buf: &mut [Self::Elem],
    );

    /// Appends the wire bytes of `modified` to `out`.
    fn encode(&self, modified: &[Self::Modified], out: &mut Vec<u8>);

    /// Decodes `modified.len()` elements from the front of `bytes`.
    fn decode(&self, bytes: &[u8], modified: &mut [Self::Modified]);

    /// Writes the indices of `buf` into `indices` (`active_elements(buf.len())` slots).
    fn get_indices(&self, tool: &T, buf: &[Self::Elem], indices: &mut [T::Index]);

    /// Registers every element of `buf` as a new input of the adapter.
    ///
    /// The new indices go to `indices`, the primals the adapter held before to
    /// `old_primals`. Both have `active_elements(buf.len())` slots.
    fn register_value(
        &self,
        tool: &T,
        buf: &mut [Self::Elem],
        indices: &mut [T::Index],
        old_primals: &mut [T::Real],
    );

    /// Makes every element of `buf` passive.
    fn clear_indices(&self, tool: &T, buf: &mut [Self::Elem]);

    /// Reads the primal values of `buf` (`active_elements(buf.len())` slots).
    fn get_values(&self, tool: &T, buf: &[Self::Elem], primals: &mut [T::Real]);

    /// Adjoint-capable built-in operators for this element class.
    fn builtin_operators(&self) -> Vec<Operator<T, Self>> {
        Vec::new()
    }

    /// Encodes user elements into wire bytes.
    fn pack(&self, tool: &T, buf: &[Self::Elem]) -> Vec<u8> {
        let mut modified = self.create_modified_buffer(buf.len());
        self.copy_into_modified_buffer(tool, buf, &mut modified);
        let mut out = Vec::with_capacity(buf.len() * self.modified_extent());
        self.encode(&modified, &mut out);
        out
    }

    /// Decodes `buf.len()` elements from wire bytes into user elements.
    fn unpack(&self, tool: &T, bytes: &[u8], buf: &mut [Self::Elem]) {
        let mut modified = self.create_modified_buffer(buf.len());
        self.decode(bytes, &mut modified);
        self.copy_from_modified_buffer(tool, &modified, buf);
    }

    /// Folds `ranks` consecutive blocks of `count` elements of `buffer` into `target`.
    ///
    /// The fold runs in rank order, `b0 ∘ (b1 ∘ (… ∘ bn-1))`, with the operator's primal
    /// function, so that on active data the adapter records every step. With `ranks == 0`
    /// the target is left untouched.
    fn perform_reduce(
        &self,
        buffer: &[Self::Elem],
        target: &mut [Self::Elem],
        count: usize,
        op: &Operator<T, Self>,
        ranks: usize,
    ) {
        let Some(last) = ranks.checked_sub(1) else {
            return;
        };
        target[..count].clone_from_slice(&buffer[last * count..(last + 1) * count]);
        for rank in (0..last).rev() {
            op.apply_primal(&buffer[rank * count..(rank + 1) * count], &mut target[..count]);
        }
    }

    fn create_type_buffer(&self, count: usize) -> Vec<Self::Elem> {
        vec![Self::Elem::default(); count]
    }

    fn create_modified_buffer(&self, count: usize) -> Vec<Self::Modified> {
        vec![Self::Modified::default(); count]
    }
}

/// One AD-active scalar of the adapter `T` per element.
pub struct ActiveType<T: AdTool> {
    _tool: PhantomData<fn() -> T>,
}

impl<T: AdTool> ActiveType<T> {
    pub fn new() -> Self {
        Self { _tool: PhantomData }
    }
}

impl<T: AdTool> Default for ActiveType<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: AdTool> Clone for ActiveType<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: AdTool> fmt::Debug for ActiveType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActiveType<{}>", std::any::type_name::<T>())
    }
}

impl<T: AdTool> DataType<T> for ActiveType<T> {
    type Elem = T::Value;
    type Modified = T::Real;

    fn is_active(&self) -> bool {
        true
    }

    fn active_elements(&self, count: usize) -> usize {
        count
    }

    fn modified_extent(&self) -> usize {
        std::mem::size_of::<T::Real>()
    }

    fn is_modified_buffer_required(&self) -> bool {
        true
    }

    fn copy_into_modified_buffer(&self, tool: &T, buf: &[T::Value], modified: &mut [T::Real]) {
        for (value, primal) in buf.iter().zip(modified.iter_mut()) {
            *primal = tool.primal(value);
        }
    }

    fn copy_from_modified_buffer(&self, tool: &T, modified: &[T::Real], buf: &mut [T::Value]) {
        for (primal, value) in modified.iter().zip(buf.iter_mut()) {
            tool.set_primal(value, *primal);
        }
    }

    fn encode(&self, modified: &[T::Real], out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::cast_slice(modified));
    }

    fn decode(&self, bytes: &[u8], modified: &mut [T::Real]) {
        decode_pod(bytes, modified);
    }

    fn get_indices(&self, tool: &T, buf: &[T::Value], indices: &mut [T::Index]) {
        for (value, index) in buf.iter().zip(indices.iter_mut()) {
            *index = tool.get_index(value);
        }
    }

    fn register_value(
        &self,
        tool: &T,
        buf: &mut [T::Value],
        indices: &mut [T::Index],
        old_primals: &mut [T::Real],
    ) {
        let slots = indices.iter_mut().zip(old_primals.iter_mut());
        for (value, (index, old)) in buf.iter_mut().zip(slots) {
            (*index, *old) = tool.register_value(value);
        }
    }

    fn clear_indices(&self, tool: &T, buf: &mut [T::Value]) {
        for value in buf.iter_mut() {
            tool.clear_index(value);
        }
    }

    fn get_values(&self, tool: &T, buf: &[T::Value], primals: &mut [T::Real]) {
        for (value, primal) in buf.iter().zip(primals.iter_mut()) {
            *primal = tool.primal(value);
        }
    }

    fn builtin_operators(&self) -> Vec<Operator<T, Self>> {
        vec![
            Operator::sum(),
            Operator::prod(),
            Operator::min(),
            Operator::max(),
        ]
    }
}

/// Plain data that never carries AD metadata.
pub struct PassiveType<P> {
    _elem: PhantomData<fn() -> P>,
}

impl<P> PassiveType<P> {
    pub fn new() -> Self {
        Self { _elem: PhantomData }
    }
}

impl<P> Default for PassiveType<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for PassiveType<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for PassiveType<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PassiveType<{}>", std::any::type_name::<P>())
    }
}

impl<T, P> DataType<T> for PassiveType<P>
where
    T: AdTool,
    P: Pod + Default + Reducible + 'static,
{
    type Elem = P;
    type Modified = P;

    fn is_active(&self) -> bool {
        false
    }

    fn active_elements(&self, _count: usize) -> usize {
        0
    }

    fn modified_extent(&self) -> usize {
        std::mem::size_of::<P>()
    }

    fn is_modified_buffer_required(&self) -> bool {
        false
    }

    fn copy_into_modified_buffer(&self, _tool: &T, buf: &[P], modified: &mut [P]) {
        modified.copy_from_slice(buf);
    }

    fn copy_from_modified_buffer(&self, _tool: &T, modified: &[P], buf: &mut [P]) {
        buf.copy_from_slice(modified);
    }

    fn encode(&self, modified: &[P], out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::cast_slice(modified));
    }

    fn decode(&self, bytes: &[u8], modified: &mut [P]) {
        decode_pod(bytes, modified);
    }

    fn get_indices(&self, _tool: &T, _buf: &[P], _indices: &mut [T::Index]) {}

    fn register_value(
        &self,
        _tool: &T,
        _buf: &mut [P],
        _indices: &mut [T::Index],
        _old: &mut [T::Real],
    ) {
    }

    fn clear_indices(&self, _tool: &T, _buf: &mut [P]) {}

    fn get_values(&self, _tool: &T, _buf: &[P], _primals: &mut [T::Real]) {}

    fn builtin_operators(&self) -> Vec<Operator<T, Self>> {
        vec![
            Operator::sum(),
            Operator::prod(),
            Operator::min(),
            Operator::max(),
        ]
    }

    fn pack(&self, _tool: &T, buf: &[P]) -> Vec<u8> {
        bytemuck::cast_slice(buf).to_vec()
    }

    fn unpack(&self, _tool: &T, bytes: &[u8], buf: &mut [P]) {
        decode_pod(bytes, buf);
    }
}

/// Copies `out.len()` plain values from the front of `bytes`, which need not be aligned.
pub(crate) fn decode_pod<P: Pod>(bytes: &[u8], out: &mut [P]) {
    let size = std::mem::size_of::<P>();
    for (chunk, value) in bytes.chunks_exact(size).zip(out.iter_mut()) {
        *value = bytemuck::pod_read_unaligned(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Active, PassiveTool, Tape};

    #[test]
    fn test_active_pack_strips_metadata() {
        let tape = Tape::new();
        tape.set_active();
        let ty = ActiveType::<Tape>::new();
        let buf = vec![tape.input(1.5), tape.input(-2.0)];
        let bytes = ty.pack(&tape, &buf);
        assert_eq!(bytes.len(), 2 * ty.modified_extent());

        let mut out = vec![Active::default(); 2];
        ty.unpack(&tape, &bytes, &mut out);
        assert_eq!(out[0].value(), 1.5);
        assert_eq!(out[1].value(), -2.0);
        assert!(!out[0].is_active());
    }

    #[test]
    fn test_register_gives_fresh_indices() {
        let tape = Tape::new();
        tape.set_active();
        let ty = ActiveType::<Tape>::new();
        let mut buf = vec![tape.input(1.0), tape.input(2.0)];
        let mut before = vec![0; 2];
        ty.get_indices(&tape, &buf, &mut before);

        let mut after = vec![0; 2];
        let mut old = vec![0.0; 2];
        ty.register_value(&tape, &mut buf, &mut after, &mut old);
        assert!(after.iter().zip(&before).all(|(a, b)| a != b && *a != 0));

        ty.clear_indices(&tape, &mut buf);
        assert!(buf.iter().all(|v| !v.is_active()));
    }

    #[test]
    fn test_perform_reduce_folds_in_rank_order() {
        let ty = PassiveType::<i64>::new();
        // Appends the input as a decimal digit, so the fold order shows in the result.
        fn digits(input: &[i64], inout: &mut [i64]) {
            for (a, b) in input.iter().zip(inout.iter_mut()) {
                *b = *b * 10 + a;
            }
        }
        let op = Operator::<PassiveTool, PassiveType<i64>>::forward_only(digits, false);
        let buffer = vec![1, 2, 3, 4, 5, 6];
        let mut target = vec![0; 2];
        DataType::<PassiveTool>::perform_reduce(&ty, &buffer, &mut target, 2, &op, 3);
        assert_eq!(target, vec![531, 642]);

        let mut untouched = vec![7, 7];
        DataType::<PassiveTool>::perform_reduce(&ty, &buffer, &mut untouched, 2, &op, 0);
        assert_eq!(untouched, vec![7, 7]);
    }

    #[test]
    fn test_passive_has_no_slots() {
        let ty = PassiveType::<f32>::new();
        assert_eq!(DataType::<PassiveTool>::active_elements(&ty, 10), 0);
        assert!(!DataType::<PassiveTool>::is_active(&ty));
        let bytes = DataType::<PassiveTool>::pack(&ty, &PassiveTool, &[1.0f32, 2.0]);
        let mut out = [0.0f32; 2];
        DataType::<PassiveTool>::unpack(&ty, &PassiveTool, &bytes, &mut out);
        assert_eq!(out, [1.0, 2.0]);
    }
}
