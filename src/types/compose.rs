//! # Struct Type Composer
//!
//! Builds a descriptor for a user struct from one descriptor per member. A member is
//! given by its native byte offset, its block length (number of consecutive elements)
//! and a pair of accessors returning the block as a slice.
//!
//! Two layouts are computed side by side:
//!
//! *   the **real** layout: member offsets and extents inside the native struct, with
//!     the struct's own size and alignment;
//! *   the **modified** layout: the members' modified blocks concatenated without gaps,
//!     padded at the end to a multiple of 8 bytes by a synthetic trailing member.
//!
//! A member whose own modified layout contains holes is rejected as a contract
//! violation. Padding is only ever inserted at the top level.
//!
//! Metadata is linearized member by member: the index slots of a member start after the
//! slots of all previous members, independent of the native layout.
//!
//! ```rust
//! use admpi_rs::tool::{Active, Tape};
//! use admpi_rs::types::{ActiveType, DataType, PassiveType, StructType};
//! use std::mem::offset_of;
//!
//! #[derive(Clone, Default)]
//! struct Particle {
//!     position: [Active; 3],
//!     id: i32,
//! }
//!
//! let ty = StructType::<Particle, Tape>::builder()
//!     .member(
//!         offset_of!(Particle, position),
//!         3,
//!         ActiveType::new(),
//!         |p| &p.position[..],
//!         |p| &mut p.position[..],
//!     )
//!     .member(
//!         offset_of!(Particle, id),
//!         1,
//!         PassiveType::<i32>::new(),
//!         |p| std::slice::from_ref(&p.id),
//!         |p| std::slice::from_mut(&mut p.id),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(ty.active_elements(2), 6);
//! assert_eq!(ty.layout().modified_extent(), 32);
//! ```

use super::DataType;
use crate::contract_violation;
use crate::error::{Error, Result};
use crate::tool::AdTool;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use tracing::debug;

/// Alignment of the packed modified layout.
pub const MODIFIED_ALIGN: usize = 8;

/// Extents of one member as seen by the layout computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberExtent {
    /// Byte offset inside the native struct.
    pub offset: usize,
    /// Bytes covered inside the native struct.
    pub real_extent: usize,
    /// Bytes of the packed modified block.
    pub modified_extent: usize,
}

/// Real and modified layouts of a composed struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    real_offsets: Vec<usize>,
    real_extent: usize,
    modified_offsets: Vec<usize>,
    packed: usize,
    padding: usize,
}

impl StructLayout {
    /// Computes both layouts.
    ///
    /// # Arguments
    /// * `members` - Member extents in declaration order.
    /// * `real_extent` - `size_of` the native struct.
    ///
    /// Fails if a member reaches past the struct or two members overlap.
    pub fn new(members: &[MemberExtent], real_extent: usize) -> Result<Self> {
        let mut spans: Vec<(usize, usize)> = members
            .iter()
            .map(|m| (m.offset, m.offset + m.real_extent))
            .collect();
        spans.sort_unstable();
        for (i, (start, end)) in spans.iter().enumerate() {
            if *end > real_extent {
                return Err(Error::InvalidArgument(format!(
                    "member at offset {start} ends at {end}, past the struct extent {real_extent}"
                )));
            }
            if let Some((next, _)) = spans.get(i + 1) {
                if next < end {
                    return Err(Error::InvalidArgument(format!(
                        "members at offsets {start} and {next} overlap"
                    )));
                }
            }
        }

        let mut modified_offsets = Vec::with_capacity(members.len());
        let mut packed = 0;
        for member in members {
            modified_offsets.push(packed);
            packed += member.modified_extent;
        }
        let padding = (MODIFIED_ALIGN - packed % MODIFIED_ALIGN) % MODIFIED_ALIGN;
        Ok(Self {
            real_offsets: members.iter().map(|m| m.offset).collect(),
            real_extent,
            modified_offsets,
            packed,
            padding,
        })
    }

    pub fn real_offsets(&self) -> &[usize] {
        &self.real_offsets
    }

    pub fn real_extent(&self) -> usize {
        self.real_extent
    }

    /// Offsets of the members inside one packed modified element.
    pub fn modified_offsets(&self) -> &[usize] {
        &self.modified_offsets
    }

    /// Sum of the members' modified extents.
    pub fn packed_size(&self) -> usize {
        self.packed
    }

    /// Bytes of the synthetic trailing member.
    pub fn padding(&self) -> usize {
        self.padding
    }

    /// Size of one packed modified element, a multiple of 8.
    pub fn modified_extent(&self) -> usize {
        self.packed + self.padding
    }
}

/// One member of a composed struct, with its descriptor type erased.
pub trait StructMember<S, T: AdTool> {
    fn extent(&self) -> MemberExtent;

    fn is_active(&self) -> bool;

    /// Index slots of this member in one struct.
    fn active_elements(&self) -> usize;

    fn has_holes(&self) -> bool;

    fn pack(&self, tool: &T, value: &S, out: &mut Vec<u8>);

    /// Reads the member from the front of `bytes`.
    fn unpack(&self, tool: &T, bytes: &[u8], value: &mut S);

    fn get_indices(&self, tool: &T, value: &S, indices: &mut [T::Index]);

    fn register_value(
        &self,
        tool: &T,
        value: &mut S,
        indices: &mut [T::Index],
        old: &mut [T::Real],
    );

    fn clear_indices(&self, tool: &T, value: &mut S);

    fn get_values(&self, tool: &T, value: &S, primals: &mut [T::Real]);
}

struct Member<S, T: AdTool, D: DataType<T>> {
    ty: D,
    offset: usize,
    block_len: usize,
    get: fn(&S) -> &[D::Elem],
    get_mut: fn(&mut S) -> &mut [D::Elem],
    _tool: PhantomData<fn() -> T>,
}

impl<S, T: AdTool, D: DataType<T>> Member<S, T, D> {
    fn block<'a>(&self, value: &'a S) -> &'a [D::Elem] {
        let block = (self.get)(value);
        if block.len() != self.block_len {
            contract_violation!(
                "member accessor at offset {} returned {} elements, expected {}",
                self.offset,
                block.len(),
                self.block_len
            );
        }
        block
    }

    fn block_mut<'a>(&self, value: &'a mut S) -> &'a mut [D::Elem] {
        let block = (self.get_mut)(value);
        if block.len() != self.block_len {
            contract_violation!(
                "member accessor at offset {} returned {} elements, expected {}",
                self.offset,
                block.len(),
                self.block_len
            );
        }
        block
    }
}

impl<S, T: AdTool, D: DataType<T>> StructMember<S, T> for Member<S, T, D> {
    fn extent(&self) -> MemberExtent {
        MemberExtent {
            offset: self.offset,
            real_extent: self.block_len * self.ty.extent(),
            modified_extent: self.block_len * self.ty.modified_extent(),
        }
    }

    fn is_active(&self) -> bool {
        self.ty.is_active()
    }

    fn active_elements(&self) -> usize {
        self.ty.active_elements(self.block_len)
    }

    fn has_holes(&self) -> bool {
        self.ty.modified_has_holes()
    }

    fn pack(&self, tool: &T, value: &S, out: &mut Vec<u8>) {
        let mut modified = self.ty.create_modified_buffer(self.block_len);
        self.ty.copy_into_modified_buffer(tool, self.block(value), &mut modified);
        self.ty.encode(&modified, out);
    }

    fn unpack(&self, tool: &T, bytes: &[u8], value: &mut S) {
        let mut modified = self.ty.create_modified_buffer(self.block_len);
        self.ty.decode(bytes, &mut modified);
        self.ty.copy_from_modified_buffer(tool, &modified, self.block_mut(value));
    }

    fn get_indices(&self, tool: &T, value: &S, indices: &mut [T::Index]) {
        self.ty.get_indices(tool, self.block(value), indices);
    }

    fn register_value(
        &self,
        tool: &T,
        value: &mut S,
        indices: &mut [T::Index],
        old: &mut [T::Real],
    ) {
        let block = self.block_mut(value);
        self.ty.register_value(tool, block, indices, old);
    }

    fn clear_indices(&self, tool: &T, value: &mut S) {
        let block = self.block_mut(value);
        self.ty.clear_indices(tool, block);
    }

    fn get_values(&self, tool: &T, value: &S, primals: &mut [T::Real]) {
        self.ty.get_values(tool, self.block(value), primals);
    }
}

/// Synthetic trailing member that pads the modified layout to a multiple of 8.
struct Padding {
    offset: usize,
    bytes: usize,
}

impl<S, T: AdTool> StructMember<S, T> for Padding {
    fn extent(&self) -> MemberExtent {
        MemberExtent {
            offset: self.offset,
            real_extent: 0,
            modified_extent: self.bytes,
        }
    }

    fn is_active(&self) -> bool {
        false
    }

    fn active_elements(&self) -> usize {
        0
    }

    fn has_holes(&self) -> bool {
        false
    }

    fn pack(&self, _tool: &T, _value: &S, out: &mut Vec<u8>) {
        out.resize(out.len() + self.bytes, 0);
    }

    fn unpack(&self, _tool: &T, _bytes: &[u8], _value: &mut S) {}

    fn get_indices(&self, _tool: &T, _value: &S, _indices: &mut [T::Index]) {}

    fn register_value(
        &self,
        _tool: &T,
        _value: &mut S,
        _indices: &mut [T::Index],
        _old: &mut [T::Real],
    ) {
    }

    fn clear_indices(&self, _tool: &T, _value: &mut S) {}

    fn get_values(&self, _tool: &T, _value: &S, _primals: &mut [T::Real]) {}
}

/// Builder of a [`StructType`].
pub struct StructTypeBuilder<S, T: AdTool> {
    members: Vec<Rc<dyn StructMember<S, T>>>,
}

impl<S: Clone + Default + 'static, T: AdTool> StructTypeBuilder<S, T> {
    /// Adds a member.
    ///
    /// # Arguments
    /// * `offset` - Byte offset of the member inside `S`, usually `offset_of!`.
    /// * `block_len` - Number of consecutive elements.
    /// * `ty` - Descriptor of one element.
    /// * `get` / `get_mut` - Return the block; must always return `block_len` elements.
    pub fn member<D: DataType<T>>(
        mut self,
        offset: usize,
        block_len: usize,
        ty: D,
        get: fn(&S) -> &[D::Elem],
        get_mut: fn(&mut S) -> &mut [D::Elem],
    ) -> Self {
        self.members.push(Rc::new(Member {
            ty,
            offset,
            block_len,
            get,
            get_mut,
            _tool: PhantomData,
        }));
        self
    }

    /// Computes the layouts and appends the padding member if one is needed.
    pub fn build(self) -> Result<StructType<S, T>> {
        let mut members = self.members;
        for (i, member) in members.iter().enumerate() {
            if member.has_holes() {
                contract_violation!("member {} has holes in its modified layout", i);
            }
        }
        let extents: Vec<MemberExtent> = members.iter().map(|m| m.extent()).collect();
        let layout = StructLayout::new(&extents, std::mem::size_of::<S>())?;
        if layout.padding() > 0 {
            members.push(Rc::new(Padding {
                offset: layout.real_extent(),
                bytes: layout.padding(),
            }));
        }
        let active_per_struct = members.iter().map(|m| m.active_elements()).sum();
        debug!(
            members = extents.len(),
            packed = layout.packed_size(),
            padding = layout.padding(),
            active_per_struct,
            "composed struct type"
        );
        Ok(StructType {
            members: Rc::from(members),
            layout: Rc::new(layout),
            active_per_struct,
        })
    }
}

/// Descriptor of a user struct `S` composed from member descriptors.
///
/// Clones share the member list.
pub struct StructType<S, T: AdTool> {
    members: Rc<[Rc<dyn StructMember<S, T>>]>,
    layout: Rc<StructLayout>,
    active_per_struct: usize,
}

impl<S, T: AdTool> Clone for StructType<S, T> {
    fn clone(&self) -> Self {
        Self {
            members: self.members.clone(),
            layout: self.layout.clone(),
            active_per_struct: self.active_per_struct,
        }
    }
}

impl<S, T: AdTool> fmt::Debug for StructType<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructType")
            .field("layout", &self.layout)
            .field("active_per_struct", &self.active_per_struct)
            .finish()
    }
}

impl<S: Clone + Default + 'static, T: AdTool> StructType<S, T> {
    pub fn builder() -> StructTypeBuilder<S, T> {
        StructTypeBuilder { members: Vec::new() }
    }

    pub fn layout(&self) -> &StructLayout {
        &self.layout
    }

    /// Calls `f` for every member with its slot range in the linearized metadata.
    fn for_each_slot(
        &self,
        count: usize,
        mut f: impl FnMut(usize, &dyn StructMember<S, T>, std::ops::Range<usize>),
    ) {
        let mut slot = 0;
        for element in 0..count {
            for member in self.members.iter() {
                let n = member.active_elements();
                f(element, member.as_ref(), slot..slot + n);
                slot += n;
            }
        }
    }
}

impl<S: Clone + Default + 'static, T: AdTool> DataType<T> for StructType<S, T> {
    type Elem = S;
    type Modified = Vec<u8>;

    fn is_active(&self) -> bool {
        self.members.iter().any(|m| m.is_active())
    }

    fn active_elements(&self, count: usize) -> usize {
        count * self.active_per_struct
    }

    fn modified_extent(&self) -> usize {
        self.layout.modified_extent()
    }

    fn is_modified_buffer_required(&self) -> bool {
        true
    }

    fn modified_has_holes(&self) -> bool {
        self.layout.padding() > 0
    }

    fn copy_into_modified_buffer(&self, tool: &T, buf: &[S], modified: &mut [Vec<u8>]) {
        for (value, out) in buf.iter().zip(modified.iter_mut()) {
            out.clear();
            for member in self.members.iter() {
                member.pack(tool, value, out);
            }
        }
    }

    fn copy_from_modified_buffer(&self, tool: &T, modified: &[Vec<u8>], buf: &mut [S]) {
        for (bytes, value) in modified.iter().zip(buf.iter_mut()) {
            for (member, offset) in self.members.iter().zip(self.layout.modified_offsets()) {
                member.unpack(tool, &bytes[*offset..], value);
            }
        }
    }

    fn encode(&self, modified: &[Vec<u8>], out: &mut Vec<u8>) {
        for bytes in modified {
            out.extend_from_slice(bytes);
        }
    }

    fn decode(&self, bytes: &[u8], modified: &mut [Vec<u8>]) {
        for (chunk, out) in bytes.chunks_exact(self.modified_extent()).zip(modified.iter_mut()) {
            out.clear();
            out.extend_from_slice(chunk);
        }
    }

    fn get_indices(&self, tool: &T, buf: &[S], indices: &mut [T::Index]) {
        self.for_each_slot(buf.len(), |element, member, slots| {
            member.get_indices(tool, &buf[element], &mut indices[slots]);
        });
    }

    fn register_value(
        &self,
        tool: &T,
        buf: &mut [S],
        indices: &mut [T::Index],
        old: &mut [T::Real],
    ) {
        self.for_each_slot(buf.len(), |element, member, slots| {
            let value = &mut buf[element];
            member.register_value(tool, value, &mut indices[slots.clone()], &mut old[slots]);
        });
    }

    fn clear_indices(&self, tool: &T, buf: &mut [S]) {
        for value in buf.iter_mut() {
            for member in self.members.iter() {
                member.clear_indices(tool, value);
            }
        }
    }

    fn get_values(&self, tool: &T, buf: &[S], primals: &mut [T::Real]) {
        self.for_each_slot(buf.len(), |element, member, slots| {
            member.get_values(tool, &buf[element], &mut primals[slots]);
        });
    }
}
