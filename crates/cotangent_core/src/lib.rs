/// The `cotangent_core` crate evaluates expression graphs and propagates first-order
/// sensitivities through them, both for a single call and across a time integration.
///
/// Key components:
/// - **Graph**: an append-only arena of typed nodes, finalized into an immutable `Graph` shared via `Arc`.
/// - **Ops**: one dispatch table of primal and partial-derivative rules, including the
///   first-argument tie-break for `min`/`max`.
/// - **Sweeps**: primal (`evaluator`), tangent (`forward`) and reverse (`adjoint`) passes over the fixed order.
/// - **Function**: named input/output slots and per-call buffers over a shared graph.
/// - **Integrator**: wraps a right-hand-side `Function` for a black-box stepper and computes
///   forward and adjoint sensitivities of terminal state and quadrature.
pub mod adjoint;
pub mod error;
pub mod evaluator;
pub mod forward;
pub mod function;
pub mod graph;
pub mod integrator;
pub mod ops;
pub mod solvers;
pub mod traits;

pub use error::AdError;
pub use function::{Function, SlotKey};
pub use graph::{BinaryOp, Graph, GraphBuilder, NodeRef, OpKind, Shape, UnaryOp};
pub use integrator::{IntegratorSettings, SensitivityIntegrator, StepperKind};
