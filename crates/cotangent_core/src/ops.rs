//! Elementary rules shared by the primal, forward and adjoint sweeps.
//!
//! Each rule is written once as a primal value plus local partial derivatives; the
//! sweeps only combine these with tangents or adjoints. In particular the `min`/`max`
//! branch choice comes from [`first_is_active`] in every sweep, so all three passes
//! follow the same branch at ties.

use crate::graph::{BinaryOp, UnaryOp};
use crate::traits::Scalar;

/// Whether the first argument of a binary selector is the active branch.
///
/// `min(a, b)` picks `a` when `a <= b`, `max(a, b)` picks `a` when `a >= b`: exact ties go
/// to the first argument. A NaN comparison is false, so a NaN pair selects `b`.
/// Returns `true` for the smooth operations, where the question does not arise.
pub fn first_is_active<T: Scalar>(op: BinaryOp, a: T, b: T) -> bool {
    match op {
        BinaryOp::Min => a <= b,
        BinaryOp::Max => a >= b,
        _ => true,
    }
}

pub fn unary_primal<T: Scalar>(op: UnaryOp, a: T) -> T {
    match op {
        UnaryOp::Neg => -a,
        UnaryOp::Sin => a.sin(),
        UnaryOp::Cos => a.cos(),
        UnaryOp::Tan => a.tan(),
        UnaryOp::Exp => a.exp(),
        UnaryOp::Log => a.ln(),
        UnaryOp::Sqrt => a.sqrt(),
        UnaryOp::Abs => a.abs(),
        UnaryOp::Square => a * a,
    }
}

/// d out / d a, given the operand and the already computed result.
pub fn unary_partial<T: Scalar>(op: UnaryOp, a: T, out: T) -> T {
    let one = T::one();
    match op {
        UnaryOp::Neg => -one,
        UnaryOp::Sin => a.cos(),
        UnaryOp::Cos => -a.sin(),
        UnaryOp::Tan => one + out * out,
        UnaryOp::Exp => out,
        UnaryOp::Log => one / a,
        UnaryOp::Sqrt => one / (out + out),
        // Same convention as the selectors: zero counts as the non-negative branch.
        UnaryOp::Abs => {
            if a >= T::zero() {
                one
            } else {
                -one
            }
        }
        UnaryOp::Square => a + a,
    }
}

pub fn binary_primal<T: Scalar>(op: BinaryOp, a: T, b: T) -> T {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Min | BinaryOp::Max => {
            if first_is_active(op, a, b) {
                a
            } else {
                b
            }
        }
    }
}

/// (d out / d a, d out / d b), given the operands and the already computed result.
///
/// The exponent partial of `pow` is taken as zero for a non-positive base, where
/// `ln(a)` is undefined.
pub fn binary_partials<T: Scalar>(op: BinaryOp, a: T, b: T, out: T) -> (T, T) {
    let zero = T::zero();
    let one = T::one();
    match op {
        BinaryOp::Add => (one, one),
        BinaryOp::Sub => (one, -one),
        BinaryOp::Mul => (b, a),
        BinaryOp::Div => (one / b, -out / b),
        BinaryOp::Pow => {
            let base = b * a.powf(b - one);
            let exponent = if a > zero { out * a.ln() } else { zero };
            (base, exponent)
        }
        BinaryOp::Min | BinaryOp::Max => {
            if first_is_active(op, a, b) {
                (one, zero)
            } else {
                (zero, one)
            }
        }
    }
}

/// Position of entry `i` in an operand that may be a broadcast scalar.
pub(crate) fn lane(values: &[f64], i: usize) -> usize {
    if values.len() == 1 {
        0
    } else {
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNARY: [UnaryOp; 9] = [
        UnaryOp::Neg,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::Tan,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sqrt,
        UnaryOp::Abs,
        UnaryOp::Square,
    ];

    const BINARY: [BinaryOp; 7] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Pow,
        BinaryOp::Min,
        BinaryOp::Max,
    ];

    fn central_difference(f: impl Fn(f64) -> f64, x: f64) -> f64 {
        let h = 1e-6;
        (f(x + h) - f(x - h)) / (2.0 * h)
    }

    #[test]
    fn selectors_break_ties_towards_first_argument() {
        assert!(first_is_active(BinaryOp::Max, 5.0, 5.0));
        assert!(first_is_active(BinaryOp::Min, 5.0, 5.0));
        assert!(!first_is_active(BinaryOp::Max, 4.0, 6.0));
        assert!(first_is_active(BinaryOp::Min, 4.0, 6.0));

        assert_eq!(binary_partials(BinaryOp::Max, 5.0, 5.0, 5.0), (1.0, 0.0));
        assert_eq!(binary_partials(BinaryOp::Min, 5.0, 5.0, 5.0), (1.0, 0.0));
        assert_eq!(binary_partials(BinaryOp::Max, 4.0, 6.0, 6.0), (0.0, 1.0));
        assert_eq!(binary_partials(BinaryOp::Min, 4.0, 6.0, 4.0), (1.0, 0.0));
    }

    #[test]
    fn tie_values_match_selected_branch() {
        // -0.0 == 0.0 compares equal, so the sign tells which argument came back.
        let picked = binary_primal(BinaryOp::Max, -0.0_f64, 0.0);
        assert!(picked.is_sign_negative());
        let picked = binary_primal(BinaryOp::Min, 0.0_f64, -0.0);
        assert!(picked.is_sign_positive());
    }

    #[test]
    fn unary_partials_match_finite_differences() {
        let x = 0.7;
        for op in UNARY {
            let exact = unary_partial(op, x, unary_primal(op, x));
            let approx = central_difference(|v| unary_primal(op, v), x);
            assert!(
                (exact - approx).abs() < 1e-6,
                "{}: {} vs {}",
                op.name(),
                exact,
                approx
            );
        }
    }

    #[test]
    fn binary_partials_match_finite_differences() {
        let (a, b) = (1.3, 0.4);
        for op in BINARY {
            let out = binary_primal(op, a, b);
            let (da, db) = binary_partials(op, a, b, out);
            let approx_a = central_difference(|v| binary_primal(op, v, b), a);
            let approx_b = central_difference(|v| binary_primal(op, a, v), b);
            assert!((da - approx_a).abs() < 1e-6, "{} d/da", op.name());
            assert!((db - approx_b).abs() < 1e-6, "{} d/db", op.name());
        }
    }

    #[test]
    fn pow_exponent_partial_is_zero_for_negative_base() {
        let out = binary_primal(BinaryOp::Pow, -2.0, 2.0);
        assert_eq!(out, 4.0);
        let (da, db) = binary_partials(BinaryOp::Pow, -2.0, 2.0, out);
        assert_eq!(da, -4.0);
        assert_eq!(db, 0.0);
    }

    #[test]
    fn rules_are_generic_over_scalar() {
        let out = binary_primal(BinaryOp::Max, 1.5_f32, 2.5_f32);
        assert_eq!(out, 2.5_f32);
        assert_eq!(unary_partial(UnaryOp::Square, 3.0_f32, 9.0_f32), 6.0_f32);
    }
}
