//! # Operator Algebra
//!
//! A reduction operator carries up to two formulations of the same reduction:
//!
//! *   The **primal** function works on user elements (`D::Elem`). Applied to AD-active
//!     values it is ordinary arithmetic, so the AD adapter records it like any other
//!     computation. Every operator has one.
//! *   The **modified** function works on wire elements (`D::Modified`), i.e. on bare
//!     primal values with the AD metadata stripped. Only operators with an adjoint
//!     formulation have one, together with optional pre/post adjoint hooks that turn the
//!     combined result adjoint into each rank's input adjoint.
//!
//! An operator without an adjoint formulation is still valid for active data: the
//! dispatcher gathers all contributions and folds them locally with the primal function,
//! which the adapter then differentiates element by element.
//!
//! ## Built-ins
//!
//! [`Operator::sum`], [`Operator::prod`], [`Operator::min`], [`Operator::max`] and the
//! location variants [`Operator::min_loc`] / [`Operator::max_loc`]. Operators compare
//! equal when their primal functions are the same function, which is how an operator
//! built by the caller from one of the [`builtin`] functions is mapped back onto the
//! adjoint-capable built-in.
//!
//! Min and max route the adjoint to the rank whose input equals the selected extremum.
//! Ties go to the lowest rank, both when selecting the primal and when masking adjoints.

use crate::tool::{AdTool, Real};
use crate::types::loc::Loc;
use crate::types::DataType;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Mul};

/// Element types the built-in reductions work on.
pub trait Reducible: Clone + PartialOrd + Add<Output = Self> + Mul<Output = Self> {}

impl<X> Reducible for X where X: Clone + PartialOrd + Add<Output = X> + Mul<Output = X> {}

/// `inout[i] = input[i] ∘ inout[i]` on user elements.
pub type PrimalFn<E> = fn(&[E], &mut [E]);

/// `inout[i] = input[i] ∘ inout[i]` on wire elements.
pub type ModifiedFn<M> = fn(&[M], &mut [M]);

/// Adjoint hook: `fn(adjoints, own_primals, result_primals)`.
///
/// All three slices hold one value per active element. `own_primals` are the calling
/// rank's inputs to the reduction, `result_primals` the reduced values. Both are empty
/// unless the operator requires primals.
pub type AdjointHook<R> = fn(&mut [R], &[R], &[R]);

/// Reduction functions of the built-in operators.
///
/// Exposed so that callers can build forward-only operators from them; such operators
/// are mapped back onto the adjoint-capable built-ins by the dispatcher.
pub mod builtin {
    use super::{Loc, Reducible};

    #[inline(never)]
    pub fn sum<E: Reducible>(input: &[E], inout: &mut [E]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            *b = a.clone() + b.clone();
        }
    }

    #[inline(never)]
    pub fn prod<E: Reducible>(input: &[E], inout: &mut [E]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            *b = a.clone() * b.clone();
        }
    }

    /// On ties the input, which always comes from the lower rank, is kept.
    #[inline(never)]
    pub fn min<E: PartialOrd + Clone>(input: &[E], inout: &mut [E]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            if *a <= *b {
                *b = a.clone();
            }
        }
    }

    #[inline(never)]
    pub fn max<E: PartialOrd + Clone>(input: &[E], inout: &mut [E]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            if *a >= *b {
                *b = a.clone();
            }
        }
    }

    /// Smallest value, then smallest location.
    #[inline(never)]
    pub fn min_loc<E: PartialOrd + Clone>(input: &[Loc<E>], inout: &mut [Loc<E>]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            if a.value < b.value || (a.value == b.value && a.loc < b.loc) {
                *b = a.clone();
            }
        }
    }

    /// Largest value, then smallest location.
    #[inline(never)]
    pub fn max_loc<E: PartialOrd + Clone>(input: &[Loc<E>], inout: &mut [Loc<E>]) {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            if a.value > b.value || (a.value == b.value && a.loc < b.loc) {
                *b = a.clone();
            }
        }
    }
}

/// Adjoint hooks of the built-in operators.
pub mod hooks {
    use crate::tool::Real;
    use num_traits::Zero;

    /// `adj *= result / own`.
    ///
    /// Left at zero where `own` is zero; the reduce reversal fills those elements in with
    /// the product of the other ranks' inputs.
    pub fn prod_post<R: Real>(adjoints: &mut [R], own: &[R], result: &[R]) {
        for ((adj, own), result) in adjoints.iter_mut().zip(own).zip(result) {
            *adj = if own.is_zero() {
                R::zero()
            } else {
                *adj * (*result / *own)
            };
        }
    }

    /// Keeps the adjoint only where the own input was selected.
    pub fn select_post<R: Real>(adjoints: &mut [R], own: &[R], result: &[R]) {
        for ((adj, own), result) in adjoints.iter_mut().zip(own).zip(result) {
            if own != result {
                *adj = R::zero();
            }
        }
    }
}

/// Which built-in, if any, an operator is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Sum,
    Prod,
    Min,
    Max,
    MinLoc,
    MaxLoc,
    User,
}

/// A reduction operator over elements described by `D`.
pub struct Operator<T: AdTool, D: DataType<T>> {
    primal: PrimalFn<D::Elem>,
    modified: Option<ModifiedFn<D::Modified>>,
    pre_adjoint: Option<AdjointHook<T::Real>>,
    post_adjoint: Option<AdjointHook<T::Real>>,
    requires_primal: bool,
    requires_primal_send: bool,
    commutes: bool,
    kind: OpKind,
    _tool: PhantomData<fn() -> T>,
}

impl<T: AdTool, D: DataType<T>> Clone for Operator<T, D> {
    fn clone(&self) -> Self {
        Self {
            primal: self.primal,
            modified: self.modified,
            pre_adjoint: self.pre_adjoint,
            post_adjoint: self.post_adjoint,
            requires_primal: self.requires_primal,
            requires_primal_send: self.requires_primal_send,
            commutes: self.commutes,
            kind: self.kind,
            _tool: PhantomData,
        }
    }
}

impl<T: AdTool, D: DataType<T>> fmt::Debug for Operator<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("kind", &self.kind)
            .field("adjoint", &self.has_adjoint())
            .field("requires_primal", &self.requires_primal)
            .field("requires_primal_send", &self.requires_primal_send)
            .field("commutes", &self.commutes)
            .finish()
    }
}

/// Two built-ins are equal when they are the same built-in. Otherwise operators are the
/// same operator when their primal functions are the same function.
///
/// Function identity is an address comparison. The compiler may give one generic
/// function several addresses (or merge identical ones), so mapping a caller's
/// `forward_only(builtin::max)` onto [`Operator::max`] is best effort: when the addresses
/// differ, the operator stays forward-only and reductions take the gathered path, which
/// gives the same result and the same gradients.
impl<T: AdTool, D: DataType<T>> PartialEq for Operator<T, D> {
    fn eq(&self, other: &Self) -> bool {
        match (self.kind, other.kind) {
            (OpKind::User, _) | (_, OpKind::User) => self.primal as usize == other.primal as usize,
            (a, b) => a == b,
        }
    }
}

impl<T: AdTool, D: DataType<T>> Operator<T, D> {
    /// A forward-only operator.
    ///
    /// Reductions of active data with it go through gather and a local fold.
    pub fn forward_only(primal: PrimalFn<D::Elem>, commutes: bool) -> Self {
        Self {
            primal,
            modified: None,
            pre_adjoint: None,
            post_adjoint: None,
            requires_primal: false,
            requires_primal_send: false,
            commutes,
            kind: OpKind::User,
            _tool: PhantomData,
        }
    }

    /// An operator with an adjoint formulation.
    ///
    /// # Arguments
    /// * `requires_primal` - The hooks need the own and result primal values.
    /// * `requires_primal_send` - The result has to be known on every contributing rank,
    ///   so a reduction to a root is executed as an all-reduce.
    /// * `primal` - Reduction on user elements.
    /// * `modified` - The same reduction on wire elements.
    /// * `pre_adjoint` - Applied to the result adjoints before they are sent back.
    /// * `post_adjoint` - Applied on every contributing rank to the received adjoints.
    pub fn with_adjoint(
        requires_primal: bool,
        requires_primal_send: bool,
        primal: PrimalFn<D::Elem>,
        modified: ModifiedFn<D::Modified>,
        pre_adjoint: Option<AdjointHook<T::Real>>,
        post_adjoint: Option<AdjointHook<T::Real>>,
    ) -> Self {
        Self {
            primal,
            modified: Some(modified),
            pre_adjoint,
            post_adjoint,
            requires_primal,
            requires_primal_send,
            commutes: true,
            kind: OpKind::User,
            _tool: PhantomData,
        }
    }

    fn builtin(mut self, kind: OpKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn has_adjoint(&self) -> bool {
        self.modified.is_some()
    }

    pub fn requires_primal(&self) -> bool {
        self.requires_primal
    }

    pub fn requires_primal_send(&self) -> bool {
        self.requires_primal_send
    }

    pub fn commutes(&self) -> bool {
        self.commutes
    }

    pub fn primal_fn(&self) -> PrimalFn<D::Elem> {
        self.primal
    }

    pub fn modified_fn(&self) -> Option<ModifiedFn<D::Modified>> {
        self.modified
    }

    /// `inout = input ∘ inout` on user elements.
    pub fn apply_primal(&self, input: &[D::Elem], inout: &mut [D::Elem]) {
        (self.primal)(input, inout)
    }

    pub fn pre_adjoint(&self, adjoints: &mut [T::Real], own: &[T::Real], result: &[T::Real]) {
        if let Some(hook) = self.pre_adjoint {
            hook(adjoints, own, result);
        }
    }

    pub fn post_adjoint(&self, adjoints: &mut [T::Real], own: &[T::Real], result: &[T::Real]) {
        if let Some(hook) = self.post_adjoint {
            hook(adjoints, own, result);
        }
    }

    /// Maps the operator onto the descriptor's built-in with the same primal function.
    pub fn canonical(&self, ty: &D) -> Self {
        ty.builtin_operators()
            .into_iter()
            .find(|builtin| builtin == self)
            .unwrap_or_else(|| self.clone())
    }
}

impl<T: AdTool, D: DataType<T>> Operator<T, D>
where
    D::Elem: Reducible,
    D::Modified: Reducible,
{
    pub fn sum() -> Self {
        Self::with_adjoint(false, false, builtin::sum, builtin::sum, None, None)
            .builtin(OpKind::Sum)
    }

    /// Product. The adjoint of a rank is `adj · Π` of the other ranks' inputs.
    pub fn prod() -> Self {
        Self::with_adjoint(
            true,
            false,
            builtin::prod,
            builtin::prod,
            None,
            Some(hooks::prod_post::<T::Real>),
        )
        .builtin(OpKind::Prod)
    }

    pub fn min() -> Self {
        Self::with_adjoint(
            true,
            true,
            builtin::min,
            builtin::min,
            None,
            Some(hooks::select_post::<T::Real>),
        )
        .builtin(OpKind::Min)
    }

    pub fn max() -> Self {
        Self::with_adjoint(
            true,
            true,
            builtin::max,
            builtin::max,
            None,
            Some(hooks::select_post::<T::Real>),
        )
        .builtin(OpKind::Max)
    }
}

impl<T, V, M, D> Operator<T, D>
where
    T: AdTool,
    V: PartialOrd + Clone,
    M: PartialOrd + Clone,
    D: DataType<T, Elem = Loc<V>, Modified = Loc<M>>,
{
    pub fn min_loc() -> Self {
        Self::with_adjoint(
            true,
            true,
            builtin::min_loc,
            builtin::min_loc,
            None,
            Some(hooks::select_post::<T::Real>),
        )
        .builtin(OpKind::MinLoc)
    }

    pub fn max_loc() -> Self {
        Self::with_adjoint(
            true,
            true,
            builtin::max_loc,
            builtin::max_loc,
            None,
            Some(hooks::select_post::<T::Real>),
        )
        .builtin(OpKind::MaxLoc)
    }
}

/// Sums raw adjoint vectors. Used by reverse all-reduces.
pub(crate) fn adjoint_sum<R: Real>(input: &[R], inout: &mut [R]) {
    for (a, b) in input.iter().zip(inout.iter_mut()) {
        *b = *a + *b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{PassiveTool, Tape};
    use crate::types::{ActiveType, PassiveType};

    type TapeOp = Operator<Tape, ActiveType<Tape>>;

    #[test]
    fn test_builtin_flags() {
        let sum = TapeOp::sum();
        assert!(sum.has_adjoint());
        assert!(!sum.requires_primal());
        let max = TapeOp::max();
        assert!(max.requires_primal() && max.requires_primal_send());
        let prod = TapeOp::prod();
        assert!(prod.requires_primal() && !prod.requires_primal_send());
        assert_eq!(prod.kind(), OpKind::Prod);
    }

    #[test]
    fn test_builtins_compare_by_kind() {
        assert_eq!(TapeOp::max(), TapeOp::max());
        assert_ne!(TapeOp::min(), TapeOp::max());
        assert_ne!(TapeOp::sum(), TapeOp::prod());
    }

    #[test]
    fn test_forward_only_is_mapped_to_builtin() {
        let ty = ActiveType::<Tape>::new();
        let user = TapeOp::forward_only(builtin::max, true);
        assert!(!user.has_adjoint());
        let canonical = user.canonical(&ty);
        assert_eq!(canonical.kind(), OpKind::Max);
        assert!(canonical.has_adjoint());

        fn halve(input: &[crate::tool::Active], inout: &mut [crate::tool::Active]) {
            builtin::sum(input, inout);
        }
        let custom = TapeOp::forward_only(halve, false);
        assert_eq!(custom.canonical(&ty).kind(), OpKind::User);
    }

    #[test]
    fn test_ties_keep_the_input() {
        let input = [Loc { value: 3.0, loc: 0 }, Loc { value: 1.0, loc: 4 }];
        let mut inout = [Loc { value: 3.0, loc: 1 }, Loc { value: 1.0, loc: 2 }];
        builtin::max_loc(&input, &mut inout);
        assert_eq!(inout[0].loc, 0);
        assert_eq!(inout[1].loc, 2);

        let mut inout = [1.0, 7.0];
        builtin::min(&[1.0, 2.0], &mut inout);
        assert_eq!(inout, [1.0, 2.0]);
    }

    #[test]
    fn test_prod_post_hook_skips_zero_inputs() {
        let mut adjoints = [1.0, 2.0];
        hooks::prod_post(&mut adjoints, &[2.0, 0.0], &[12.0, 0.0]);
        assert_eq!(adjoints, [6.0, 0.0]);
    }

    #[test]
    fn test_select_post_hook() {
        let mut adjoints = [1.0, 1.0, 1.0];
        hooks::select_post(&mut adjoints, &[5.0, 9.0, 2.0], &[9.0, 9.0, 2.0]);
        assert_eq!(adjoints, [0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_passive_operator_equality() {
        let a = Operator::<PassiveTool, PassiveType<i32>>::sum();
        let b = Operator::<PassiveTool, PassiveType<i32>>::forward_only(builtin::sum, true);
        let c = Operator::<PassiveTool, PassiveType<i32>>::prod();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
