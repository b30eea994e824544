use std::fmt;
use thiserror::Error;

/// Which side of a function a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Input,
    Output,
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRole::Input => f.write_str("input"),
            SlotRole::Output => f.write_str("output"),
        }
    }
}

/// Errors raised by graph construction and by `Function` calls.
///
/// The first group is structural: once one of them is returned the builder that produced
/// it has been consumed or the offending node was never added. The second group reports
/// caller misuse of a `Function`; a call that fails with one of them leaves every buffer
/// exactly as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdError {
    #[error("{kind} expects {expected} operand(s), got {found}")]
    ArityMismatch {
        kind: String,
        expected: usize,
        found: usize,
    },
    #[error("{kind}: {detail}")]
    ShapeMismatch { kind: String, detail: String },
    #[error("graph has a cycle through node {node}")]
    GraphCycle { node: usize },
    #[error("output reference {index} was never added to the graph ({len} nodes)")]
    DanglingOutput { index: usize, len: usize },
    #[error("operand reference {index} is not part of the graph ({len} nodes)")]
    DanglingOperand { index: usize, len: usize },
    #[error("input slots must be numbered 0..n without gaps: {detail}")]
    InputSlots { detail: String },

    #[error("primal values are stale; call evaluate() first")]
    StalePrimal,
    #[error("{role} slot name `{name}` is used more than once")]
    DuplicateSlot { role: SlotRole, name: String },
    #[error("unknown {role} slot `{name}`")]
    UnknownSlot { role: SlotRole, name: String },
    #[error("{role} slot `{name}` holds {expected} value(s), got {found}")]
    SizeMismatch {
        role: SlotRole,
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("expected {expected} {role} array(s), got {found}")]
    SlotCount {
        role: SlotRole,
        expected: usize,
        found: usize,
    },
}
