use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// Floating-point type the elementary rules and the steppers are written against.
/// `f64` and `f32` both qualify through the blanket impl.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Right-hand side `y' = f(t, y)` handed to a stepper.
pub trait DynamicalSystem<T: Scalar> {
    /// Length of `y`.
    fn dimension(&self) -> usize;

    /// Writes `f(t, y)` into `out`, which has the same length as `y`.
    fn apply(&self, t: T, y: &[T], out: &mut [T]);
}

/// Fixed-step integrator treated as a black box by the sensitivity adapter.
pub trait Steppable<T: Scalar> {
    /// Advances `state` from `*t` to `*t + dt` and updates `t`. A negative `dt` steps
    /// backward in time.
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T);
}
