//! # AD Tool Bridge
//!
//! The narrow contract between the communication engine and an automatic
//! differentiation adapter. The engine never looks inside AD values itself; it asks the
//! adapter for three things:
//!
//! 1.  **Metadata per scalar**: `get_index`, `register_value`, `clear_index`, and the
//!     primal accessors. Indices are opaque: the engine stores and ships them, it never
//!     interprets them.
//! 2.  **Adjoint access over index buffers**: `get_adjoints` (read and reset),
//!     `update_adjoints` (accumulate), `set_reverse_values`, `combine_adjoints`.
//! 3.  **Recording**: `start_assembly`/`add_tool_action`/`stop_assembly` push an
//!     [`Action`] into the adapter's own replay record. The adapter replays actions in
//!     LIFO order during its reverse sweep.
//!
//! Adapters are ordinary values, constructed and passed explicitly. Two live in this
//! crate: the reverse-mode [`tape::Tape`] and the no-op [`passive::PassiveTool`].
//!
//! ## Ownership of recorded work
//!
//! A blocking primitive records one [`Action::Normal`], freed right after it ran.
//! A non-blocking primitive records two actions sharing one [`AsyncSlot`]:
//! [`Action::Async`] at issue time and [`Action::Wait`] when the forward request
//! completed. The reverse sweep meets the `Wait` action first and *starts* the reverse
//! communication; the `Async` action comes later, *finishes* it and is the owner that
//! frees the slot. The `Wait` action only ever holds a shared reference.

use crate::error::Result;
use crate::op::Reducible;
use num_traits::{Float, Zero};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt::Debug;
use std::rc::Rc;

pub mod passive;
pub mod tape;

pub use passive::PassiveTool;
pub use tape::{Active, Tape};

/// Floating point types usable as primal and adjoint values.
///
/// `Pod` lets the engine put them on the wire without a per-type codec.
pub trait Real: Float + bytemuck::Pod + Default + Debug + 'static {}

impl<T> Real for T where T: Float + bytemuck::Pod + Default + Debug + 'static {}

/// The AD adapter contract.
pub trait AdTool: Sized + 'static {
    /// The AD-active scalar type of user buffers. Arithmetic on it is what the adapter
    /// records.
    type Value: Clone + Default + Debug + Reducible + 'static;
    /// Primal and adjoint values.
    type Real: Real;
    /// Opaque identifier of an adjoint accumulator.
    type Index: Copy + Default + PartialEq + Debug + 'static;

    /// `true` while the adapter records, i.e. while the engine has to create handles.
    fn is_handle_required(&self) -> bool;

    /// `true` if overwritten primal values must be restored during the reverse sweep.
    fn is_old_primals_required(&self) -> bool;

    fn start_assembly(&self);

    /// Pushes recorded work into the adapter's replay record.
    fn add_tool_action(&self, action: Action<Self>);

    fn stop_assembly(&self);

    /// Reads the adjoints of `indices` into `adjoints` and resets the accumulators.
    fn get_adjoints(&self, indices: &[Self::Index], adjoints: &mut [Self::Real]);

    /// Adds `adjoints` onto the accumulators of `indices`.
    fn update_adjoints(&self, indices: &[Self::Index], adjoints: &[Self::Real]);

    /// Restores primal values that were overwritten in the forward pass.
    fn set_reverse_values(&self, indices: &[Self::Index], primals: &[Self::Real]);

    /// Sums `ranks` consecutive blocks of `elements` adjoints into the first block.
    fn combine_adjoints(&self, adjoints: &mut [Self::Real], elements: usize, ranks: usize) {
        for rank in 1..ranks {
            for i in 0..elements {
                let contribution = adjoints[rank * elements + i];
                adjoints[i] = adjoints[i] + contribution;
            }
        }
    }

    fn create_index_buffer(&self, len: usize) -> Vec<Self::Index> {
        vec![Self::Index::default(); len]
    }

    fn create_primal_buffer(&self, len: usize) -> Vec<Self::Real> {
        vec![Self::Real::zero(); len]
    }

    fn create_adjoint_buffer(&self, len: usize) -> Vec<Self::Real> {
        vec![Self::Real::zero(); len]
    }

    fn get_index(&self, value: &Self::Value) -> Self::Index;

    /// Registers a value that was just overwritten by communication as a new input.
    ///
    /// Returns the new index and the primal the adapter held for the value before, which
    /// is only meaningful when [`is_old_primals_required`](Self::is_old_primals_required).
    fn register_value(&self, value: &mut Self::Value) -> (Self::Index, Self::Real);

    /// Makes a value passive.
    fn clear_index(&self, value: &mut Self::Value);

    fn primal(&self, value: &Self::Value) -> Self::Real;

    fn set_primal(&self, value: &mut Self::Value, primal: Self::Real);
}

/// Reverse work of a blocking primitive.
pub trait ReverseHandle<T: AdTool> {
    fn name(&self) -> &'static str;

    fn reverse(&mut self, tool: &T) -> Result<()>;
}

/// Reverse work of a non-blocking primitive, split around its own reverse request.
pub trait AsyncReverse<T: AdTool> {
    fn name(&self) -> &'static str;

    /// Starts the reverse communication. Runs where the forward request completed.
    fn start(&mut self, tool: &T) -> Result<()>;

    /// Completes the reverse communication. Runs where the forward request was issued.
    fn finish(&mut self, tool: &T) -> Result<()>;
}

/// Shared state of a non-blocking primitive's reverse work.
pub struct AsyncSlot<T: AdTool> {
    work: Rc<RefCell<dyn AsyncReverse<T>>>,
    started: Rc<Cell<bool>>,
}

impl<T: AdTool> Clone for AsyncSlot<T> {
    fn clone(&self) -> Self {
        Self {
            work: self.work.clone(),
            started: self.started.clone(),
        }
    }
}

impl<T: AdTool> AsyncSlot<T> {
    pub fn new<W: AsyncReverse<T> + 'static>(work: Rc<RefCell<W>>) -> Self {
        Self {
            work,
            started: Rc::new(Cell::new(false)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.work.borrow().name()
    }

    fn start(&self, tool: &T) -> Result<()> {
        if !self.started.replace(true) {
            self.work.borrow_mut().start(tool)?;
        }
        Ok(())
    }

    fn finish(&self, tool: &T) -> Result<()> {
        // The forward request may never have been waited on; run both phases here then.
        self.start(tool)?;
        self.work.borrow_mut().finish(tool)
    }
}

/// A unit of recorded backward-sweep work together with its ownership rule.
pub enum Action<T: AdTool> {
    /// Owned by the action, freed after its reverse ran.
    Normal(Box<dyn ReverseHandle<T>>),
    /// Issue point of a non-blocking primitive. Owns the slot and frees it.
    Async(AsyncSlot<T>),
    /// Completion point of a non-blocking primitive. Shares the slot, never frees it.
    Wait(AsyncSlot<T>),
}

impl<T: AdTool> Action<T> {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Normal(handle) => handle.name(),
            Action::Async(slot) | Action::Wait(slot) => slot.name(),
        }
    }

    /// Runs the reverse work; consumes the action so that its ownership rule applies.
    pub fn reverse(self, tool: &T) -> Result<()> {
        match self {
            Action::Normal(mut handle) => handle.reverse(tool),
            Action::Async(slot) => slot.finish(tool),
            Action::Wait(slot) => slot.start(tool),
        }
    }
}

/// Id of an entry in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Arena of recorded handles addressed by monotonically increasing ids.
///
/// Lets an adapter keep plain integers in its own record instead of pointers.
pub struct HandleTable<H> {
    next: u64,
    entries: HashMap<u64, H>,
}

impl<H> Default for HandleTable<H> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }
}

impl<H> HandleTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: H) -> HandleId {
        let id = self.next;
        self.next += 1;
        self.entries.insert(id, handle);
        HandleId(id)
    }

    pub fn take(&mut self, id: HandleId) -> Option<H> {
        self.entries.remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ids_are_monotonic_and_not_reused() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert!(b > a);
        assert_eq!(table.take(a), Some("a"));
        assert_eq!(table.take(a), None);
        let c = table.insert("c");
        assert!(c > b);
        assert_eq!(table.len(), 2);
    }

    struct Counting {
        starts: Rc<Cell<u32>>,
        finishes: Rc<Cell<u32>>,
    }

    impl AsyncReverse<PassiveTool> for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn start(&mut self, _tool: &PassiveTool) -> Result<()> {
            self.starts.set(self.starts.get() + 1);
            Ok(())
        }

        fn finish(&mut self, _tool: &PassiveTool) -> Result<()> {
            self.finishes.set(self.finishes.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_wait_then_async_runs_each_phase_once() {
        let starts = Rc::new(Cell::new(0));
        let finishes = Rc::new(Cell::new(0));
        let work = Rc::new(RefCell::new(Counting {
            starts: starts.clone(),
            finishes: finishes.clone(),
        }));
        let slot = AsyncSlot::new(work.clone());
        let tool = PassiveTool;

        Action::Wait(slot.clone()).reverse(&tool).unwrap();
        Action::Async(slot).reverse(&tool).unwrap();

        assert_eq!(starts.get(), 1);
        assert_eq!(finishes.get(), 1);
        // Both actions dropped their references; only the test's own is left.
        assert_eq!(Rc::strong_count(&work), 1);
    }

    #[test]
    fn test_async_without_wait_starts_itself() {
        let starts = Rc::new(Cell::new(0));
        let finishes = Rc::new(Cell::new(0));
        let slot = AsyncSlot::new(Rc::new(RefCell::new(Counting {
            starts: starts.clone(),
            finishes: finishes.clone(),
        })));
        Action::Async(slot).reverse(&PassiveTool).unwrap();
        assert_eq!((starts.get(), finishes.get()), (1, 1));
    }

    #[test]
    fn test_combine_adjoints_sums_rank_blocks() {
        let tool = PassiveTool;
        let mut adjoints = vec![1.0, 2.0, 10.0, 20.0, 100.0, 200.0];
        tool.combine_adjoints(&mut adjoints, 2, 3);
        assert_eq!(&adjoints[..2], &[111.0, 222.0]);
    }
}
