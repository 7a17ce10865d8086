//! Value/location pairs for `min_loc` and `max_loc` reductions.
//!
//! The location is an `i32` carried next to the value. It never has AD metadata, so a
//! [`ValueLocType<D>`] has exactly as many active slots as `D`.

use super::DataType;
use crate::op::Operator;
use crate::tool::AdTool;

/// A value together with the location it came from.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Loc<V> {
    pub value: V,
    pub loc: i32,
}

impl<V> Loc<V> {
    pub fn new(value: V, loc: i32) -> Self {
        Self { value, loc }
    }
}

/// Descriptor of [`Loc`] elements whose value is described by `D`.
#[derive(Debug, Clone, Default)]
pub struct ValueLocType<D> {
    value: D,
}

impl<D> ValueLocType<D> {
    pub fn new(value: D) -> Self {
        Self { value }
    }

    pub fn value_type(&self) -> &D {
        &self.value
    }
}

const LOC_BYTES: usize = std::mem::size_of::<i32>();

fn values<V: Clone>(buf: &[Loc<V>]) -> Vec<V> {
    buf.iter().map(|pair| pair.value.clone()).collect()
}

impl<T, D> DataType<T> for ValueLocType<D>
where
    T: AdTool,
    D: DataType<T>,
    D::Elem: PartialOrd,
    D::Modified: PartialOrd,
{
    type Elem = Loc<D::Elem>;
    type Modified = Loc<D::Modified>;

    fn is_active(&self) -> bool {
        self.value.is_active()
    }

    fn active_elements(&self, count: usize) -> usize {
        self.value.active_elements(count)
    }

    fn modified_extent(&self) -> usize {
        self.value.modified_extent() + LOC_BYTES
    }

    fn is_modified_buffer_required(&self) -> bool {
        true
    }

    fn modified_has_holes(&self) -> bool {
        self.value.modified_has_holes()
    }

    fn copy_into_modified_buffer(
        &self,
        tool: &T,
        buf: &[Self::Elem],
        modified: &mut [Self::Modified],
    ) {
        let mut inner = self.value.create_modified_buffer(buf.len());
        self.value.copy_into_modified_buffer(tool, &values(buf), &mut inner);
        for ((pair, value), out) in buf.iter().zip(inner).zip(modified.iter_mut()) {
            *out = Loc::new(value, pair.loc);
        }
    }

    fn copy_from_modified_buffer(
        &self,
        tool: &T,
        modified: &[Self::Modified],
        buf: &mut [Self::Elem],
    ) {
        let inner = values(modified);
        let mut elems = values(buf);
        self.value.copy_from_modified_buffer(tool, &inner, &mut elems);
        for ((pair, value), src) in buf.iter_mut().zip(elems).zip(modified) {
            pair.value = value;
            pair.loc = src.loc;
        }
    }

    fn encode(&self, modified: &[Self::Modified], out: &mut Vec<u8>) {
        for pair in modified {
            self.value.encode(std::slice::from_ref(&pair.value), out);
            out.extend_from_slice(&pair.loc.to_ne_bytes());
        }
    }

    fn decode(&self, bytes: &[u8], modified: &mut [Self::Modified]) {
        let value_bytes = self.value.modified_extent();
        for (chunk, pair) in bytes.chunks_exact(value_bytes + LOC_BYTES).zip(modified.iter_mut()) {
            let (value, loc) = chunk.split_at(value_bytes);
            self.value.decode(value, std::slice::from_mut(&mut pair.value));
            pair.loc = bytemuck::pod_read_unaligned(loc);
        }
    }

    fn get_indices(&self, tool: &T, buf: &[Self::Elem], indices: &mut [T::Index]) {
        self.value.get_indices(tool, &values(buf), indices);
    }

    fn register_value(
        &self,
        tool: &T,
        buf: &mut [Self::Elem],
        indices: &mut [T::Index],
        old_primals: &mut [T::Real],
    ) {
        let mut elems = values(buf);
        self.value.register_value(tool, &mut elems, indices, old_primals);
        for (pair, value) in buf.iter_mut().zip(elems) {
            pair.value = value;
        }
    }

    fn clear_indices(&self, tool: &T, buf: &mut [Self::Elem]) {
        let mut elems = values(buf);
        self.value.clear_indices(tool, &mut elems);
        for (pair, value) in buf.iter_mut().zip(elems) {
            pair.value = value;
        }
    }

    fn get_values(&self, tool: &T, buf: &[Self::Elem], primals: &mut [T::Real]) {
        self.value.get_values(tool, &values(buf), primals);
    }

    fn builtin_operators(&self) -> Vec<Operator<T, Self>> {
        vec![Operator::min_loc(), Operator::max_loc()]
    }
}
