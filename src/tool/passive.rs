//! No-op adapter for plain `f64` computations.
//!
//! Lets the same communication code run without any AD tool: values carry no metadata,
//! nothing is recorded and every adjoint operation does nothing.

use super::{Action, AdTool};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassiveTool;

impl AdTool for PassiveTool {
    type Value = f64;
    type Real = f64;
    type Index = ();

    fn is_handle_required(&self) -> bool {
        false
    }

    fn is_old_primals_required(&self) -> bool {
        false
    }

    fn start_assembly(&self) {}

    fn add_tool_action(&self, _action: Action<Self>) {}

    fn stop_assembly(&self) {}

    fn get_adjoints(&self, _indices: &[()], adjoints: &mut [f64]) {
        adjoints.fill(0.0);
    }

    fn update_adjoints(&self, _indices: &[()], _adjoints: &[f64]) {}

    fn set_reverse_values(&self, _indices: &[()], _primals: &[f64]) {}

    fn get_index(&self, _value: &f64) {}

    fn register_value(&self, _value: &mut f64) -> ((), f64) {
        ((), 0.0)
    }

    fn clear_index(&self, _value: &mut f64) {}

    fn primal(&self, value: &f64) -> f64 {
        *value
    }

    fn set_primal(&self, value: &mut f64, primal: f64) {
        *value = primal;
    }
}
