//! Reference reverse-mode adapter.
//!
//! A Jacobian tape: every recorded operation is stored as `lhs ← Σ ∂lhs/∂arg · arg`
//! and replayed backwards, accumulating adjoints into a flat vector addressed by index.
//! Communication handles are stored as opaque entries through a [`HandleTable`], so the
//! tape itself only keeps integers.
//!
//! # Example
//!
//! ```rust
//! use admpi_rs::tool::Tape;
//!
//! let tape = Tape::new();
//! tape.set_active();
//! let x = tape.input(3.0);
//! let y = x.clone() * x.clone() + x.clone();
//! tape.set_passive();
//!
//! tape.set_gradient(y.index(), 1.0);
//! tape.evaluate().unwrap();
//! assert_eq!(tape.gradient(x.index()), 7.0);
//! ```
//!
//! Index `0` is reserved for passive values: it is never recorded and never receives
//! an adjoint.

use super::{Action, AdTool, HandleId, HandleTable};
use crate::contract_violation;
use crate::error::Result;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;
use tracing::trace;

/// Adjoint accumulator id of an [`Active`] value. `0` means passive.
pub type Index = u32;

enum Statement {
    Assign { lhs: Index, args: Vec<(Index, f64)> },
    External(HandleId),
}

struct TapeState {
    recording: bool,
    statements: Vec<Statement>,
    adjoints: Vec<f64>,
    next_index: Index,
    actions: HandleTable<Action<Tape>>,
    assembly_depth: usize,
}

impl TapeState {
    fn new_index(&mut self) -> Index {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn adjoint_mut(&mut self, index: Index) -> &mut f64 {
        let slot = index as usize;
        if self.adjoints.len() <= slot {
            self.adjoints.resize(slot + 1, 0.0);
        }
        &mut self.adjoints[slot]
    }
}

/// A reverse-mode tape. Cloning yields another handle to the same tape.
#[derive(Clone)]
pub struct Tape(Rc<RefCell<TapeState>>);

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.borrow();
        f.debug_struct("Tape")
            .field("recording", &state.recording)
            .field("statements", &state.statements.len())
            .field("actions", &state.actions.len())
            .finish()
    }
}

impl PartialEq for Tape {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Tape {
    pub fn new() -> Self {
        Tape(Rc::new(RefCell::new(TapeState {
            recording: false,
            statements: Vec::new(),
            adjoints: Vec::new(),
            next_index: 1,
            actions: HandleTable::new(),
            assembly_depth: 0,
        })))
    }

    pub fn set_active(&self) {
        self.0.borrow_mut().recording = true;
    }

    pub fn set_passive(&self) {
        self.0.borrow_mut().recording = false;
    }

    pub fn is_active(&self) -> bool {
        self.0.borrow().recording
    }

    /// Creates a new independent input. Passive if the tape is not recording.
    pub fn input(&self, value: f64) -> Active {
        let mut active = Active {
            value,
            index: 0,
            tape: Some(self.clone()),
        };
        self.register_value(&mut active);
        active
    }

    pub fn gradient(&self, index: Index) -> f64 {
        if index == 0 {
            return 0.0;
        }
        self.0.borrow().adjoints.get(index as usize).copied().unwrap_or(0.0)
    }

    pub fn set_gradient(&self, index: Index, gradient: f64) {
        if index != 0 {
            *self.0.borrow_mut().adjoint_mut(index) = gradient;
        }
    }

    pub fn clear_adjoints(&self) {
        self.0.borrow_mut().adjoints.clear();
    }

    /// Drops all recorded statements and actions and all adjoints.
    pub fn reset(&self) {
        let mut state = self.0.borrow_mut();
        state.statements.clear();
        state.actions.clear();
        state.adjoints.clear();
    }

    /// Number of pending communication actions.
    pub fn pending_actions(&self) -> usize {
        self.0.borrow().actions.len()
    }

    /// Runs the reverse sweep over everything recorded so far, consuming the record.
    ///
    /// Communication actions run in LIFO order together with the arithmetic, so every
    /// rank has to evaluate its tape for the reverse communication to match up.
    pub fn evaluate(&self) -> Result<()> {
        loop {
            let statement = self.0.borrow_mut().statements.pop();
            match statement {
                None => return Ok(()),
                Some(Statement::Assign { lhs, args }) => {
                    let mut state = self.0.borrow_mut();
                    let adjoint = std::mem::take(state.adjoint_mut(lhs));
                    if adjoint != 0.0 {
                        for (arg, partial) in args {
                            *state.adjoint_mut(arg) += partial * adjoint;
                        }
                    }
                }
                Some(Statement::External(id)) => {
                    let action = self.0.borrow_mut().actions.take(id);
                    let Some(action) = action else {
                        contract_violation!("tape entry refers to unknown handle {}", id.get());
                    };
                    trace!(handle = id.get(), name = action.name(), "reverse action");
                    action.reverse(self)?;
                }
            }
        }
    }

    fn record(&self, args: &[(Index, f64)]) -> Index {
        let mut state = self.0.borrow_mut();
        let args: Vec<(Index, f64)> = args.iter().copied().filter(|(i, _)| *i != 0).collect();
        if !state.recording || args.is_empty() {
            return 0;
        }
        let lhs = state.new_index();
        state.statements.push(Statement::Assign { lhs, args });
        lhs
    }
}

impl AdTool for Tape {
    type Value = Active;
    type Real = f64;
    type Index = Index;

    fn is_handle_required(&self) -> bool {
        self.is_active()
    }

    fn is_old_primals_required(&self) -> bool {
        false
    }

    fn start_assembly(&self) {
        self.0.borrow_mut().assembly_depth += 1;
    }

    fn add_tool_action(&self, action: Action<Self>) {
        let mut state = self.0.borrow_mut();
        let name = action.name();
        let id = state.actions.insert(action);
        trace!(handle = id.get(), name, "record action");
        state.statements.push(Statement::External(id));
    }

    fn stop_assembly(&self) {
        let mut state = self.0.borrow_mut();
        if state.assembly_depth == 0 {
            contract_violation!("stop_assembly without matching start_assembly");
        }
        state.assembly_depth -= 1;
    }

    fn get_adjoints(&self, indices: &[Index], adjoints: &mut [f64]) {
        let mut state = self.0.borrow_mut();
        for (index, adjoint) in indices.iter().zip(adjoints.iter_mut()) {
            *adjoint = if *index == 0 {
                0.0
            } else {
                std::mem::take(state.adjoint_mut(*index))
            };
        }
    }

    fn update_adjoints(&self, indices: &[Index], adjoints: &[f64]) {
        let mut state = self.0.borrow_mut();
        for (index, adjoint) in indices.iter().zip(adjoints) {
            if *index != 0 {
                *state.adjoint_mut(*index) += *adjoint;
            }
        }
    }

    fn set_reverse_values(&self, _indices: &[Index], _primals: &[f64]) {}

    fn get_index(&self, value: &Active) -> Index {
        value.index
    }

    fn register_value(&self, value: &mut Active) -> (Index, f64) {
        let mut state = self.0.borrow_mut();
        value.index = if state.recording { state.new_index() } else { 0 };
        value.tape = Some(self.clone());
        (value.index, 0.0)
    }

    fn clear_index(&self, value: &mut Active) {
        value.index = 0;
    }

    fn primal(&self, value: &Active) -> f64 {
        value.value
    }

    fn set_primal(&self, value: &mut Active, primal: f64) {
        value.value = primal;
    }
}

/// An AD-active `f64` recorded on a [`Tape`].
#[derive(Clone, Default)]
pub struct Active {
    value: f64,
    index: Index,
    tape: Option<Tape>,
}

impl fmt::Debug for Active {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Active({}, #{})", self.value, self.index)
    }
}

impl Active {
    /// A passive constant.
    pub fn constant(value: f64) -> Self {
        Self {
            value,
            index: 0,
            tape: None,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn index(&self) -> Index {
        self.index
    }

    pub fn is_active(&self) -> bool {
        self.index != 0
    }

    fn binary(self, rhs: Active, value: f64, d_lhs: f64, d_rhs: f64) -> Active {
        let tape = self.tape.or(rhs.tape);
        let index = match &tape {
            Some(tape) => tape.record(&[(self.index, d_lhs), (rhs.index, d_rhs)]),
            None => 0,
        };
        Active { value, index, tape }
    }
}

impl From<f64> for Active {
    fn from(value: f64) -> Self {
        Active::constant(value)
    }
}

impl Add for Active {
    type Output = Active;

    fn add(self, rhs: Active) -> Active {
        let value = self.value + rhs.value;
        self.binary(rhs, value, 1.0, 1.0)
    }
}

impl Sub for Active {
    type Output = Active;

    fn sub(self, rhs: Active) -> Active {
        let value = self.value - rhs.value;
        self.binary(rhs, value, 1.0, -1.0)
    }
}

impl Mul for Active {
    type Output = Active;

    fn mul(self, rhs: Active) -> Active {
        let (a, b) = (self.value, rhs.value);
        self.binary(rhs, a * b, b, a)
    }
}

impl Div for Active {
    type Output = Active;

    fn div(self, rhs: Active) -> Active {
        let (a, b) = (self.value, rhs.value);
        self.binary(rhs, a / b, 1.0 / b, -a / (b * b))
    }
}

impl Neg for Active {
    type Output = Active;

    fn neg(self) -> Active {
        let value = -self.value;
        let index = match &self.tape {
            Some(tape) => tape.record(&[(self.index, -1.0)]),
            None => 0,
        };
        Active {
            value,
            index,
            tape: self.tape,
        }
    }
}

impl PartialEq for Active {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialOrd for Active {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_rule() {
        let tape = Tape::new();
        tape.set_active();
        let a = tape.input(2.0);
        let b = tape.input(5.0);
        let c = a.clone() * b.clone() - a.clone() / b.clone();
        tape.set_passive();

        assert!((c.value() - 9.6).abs() < 1e-12);
        tape.set_gradient(c.index(), 1.0);
        tape.evaluate().unwrap();
        // dc/da = b - 1/b, dc/db = a + a/b^2
        assert!((tape.gradient(a.index()) - 4.8).abs() < 1e-12);
        assert!((tape.gradient(b.index()) - 2.08).abs() < 1e-12);
    }

    #[test]
    fn test_passive_tape_does_not_record() {
        let tape = Tape::new();
        let a = tape.input(2.0);
        let b = a.clone() + a;
        assert_eq!(b.index(), 0);
        assert_eq!(b.value(), 4.0);
        assert!(!tape.is_handle_required());
    }

    #[test]
    fn test_get_adjoints_resets_accumulators() {
        let tape = Tape::new();
        tape.set_active();
        let a = tape.input(1.0);
        tape.update_adjoints(&[a.index(), 0], &[3.0, 4.0]);
        tape.update_adjoints(&[a.index()], &[1.0]);
        let mut adjoints = [0.0; 2];
        tape.get_adjoints(&[a.index(), 0], &mut adjoints);
        assert_eq!(adjoints, [4.0, 0.0]);
        assert_eq!(tape.gradient(a.index()), 0.0);
    }

    #[test]
    fn test_negation_and_constants() {
        let tape = Tape::new();
        tape.set_active();
        let a = tape.input(1.5);
        let b = -(a.clone() * Active::constant(4.0));
        tape.set_gradient(b.index(), 1.0);
        tape.evaluate().unwrap();
        assert_eq!(tape.gradient(a.index()), -4.0);
    }

    #[test]
    #[should_panic(expected = "stop_assembly without matching start_assembly")]
    fn test_unbalanced_assembly_is_fatal() {
        Tape::new().stop_assembly();
    }
}
