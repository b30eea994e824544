use crate::error::AdError;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::ops::Range;

/// Dimensions of the value held by a node. Storage is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub const fn scalar() -> Self {
        Self::new(1, 1)
    }

    /// A column vector with `n` entries.
    pub const fn vector(n: usize) -> Self {
        Self::new(n, 1)
    }

    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn is_scalar(&self) -> bool {
        self.rows == 1 && self.cols == 1
    }

    pub const fn is_column(&self) -> bool {
        self.cols == 1
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Elementwise single-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Abs,
    Square,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Abs => "abs",
            UnaryOp::Square => "square",
        }
    }
}

/// Elementwise two-operand operations. A scalar operand broadcasts against the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
        }
    }
}

/// Everything `GraphBuilder::add_op` accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Sum of all entries, giving a scalar.
    Sum,
    /// Extracts one entry (row-major position) as a scalar.
    Index(usize),
    /// Stacks `n` column operands into one column.
    Concat(usize),
}

impl OpKind {
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Unary(_) | OpKind::Sum | OpKind::Index(_) => 1,
            OpKind::Binary(_) => 2,
            OpKind::Concat(n) => *n,
        }
    }

    /// Shape of the result for the given operand shapes.
    pub fn result_shape(&self, operands: &[Shape]) -> Result<Shape, AdError> {
        if operands.len() != self.arity() {
            return Err(AdError::ArityMismatch {
                kind: self.to_string(),
                expected: self.arity(),
                found: operands.len(),
            });
        }
        match *self {
            OpKind::Unary(_) => Ok(operands[0]),
            OpKind::Binary(_) => {
                let (a, b) = (operands[0], operands[1]);
                if a == b || b.is_scalar() {
                    Ok(a)
                } else if a.is_scalar() {
                    Ok(b)
                } else {
                    Err(self.shape_error(format!("cannot broadcast {} against {}", a, b)))
                }
            }
            OpKind::Sum => Ok(Shape::scalar()),
            OpKind::Index(i) => {
                if i < operands[0].len() {
                    Ok(Shape::scalar())
                } else {
                    Err(self.shape_error(format!(
                        "index {} out of range for {}",
                        i, operands[0]
                    )))
                }
            }
            OpKind::Concat(_) => {
                if let Some(bad) = operands.iter().find(|s| !s.is_column()) {
                    return Err(self.shape_error(format!("operand {} is not a column", bad)));
                }
                Ok(Shape::vector(operands.iter().map(|s| s.rows).sum()))
            }
        }
    }

    fn shape_error(&self, detail: String) -> AdError {
        AdError::ShapeMismatch {
            kind: self.to_string(),
            detail,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Unary(op) => f.write_str(op.name()),
            OpKind::Binary(op) => f.write_str(op.name()),
            OpKind::Sum => f.write_str("sum"),
            OpKind::Index(i) => write!(f, "index[{}]", i),
            OpKind::Concat(n) => write!(f, "concat/{}", n),
        }
    }
}

/// Stable position of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef(usize);

impl NodeRef {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Declared input; `slot` is its position among the graph's inputs.
    Input { slot: usize },
    /// Row-major values, one per entry of the node's shape.
    Constant(Vec<f64>),
    Op(OpKind),
}

/// One leaf or operation. Never mutated after it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    kind: NodeKind,
    operands: Vec<NodeRef>,
    shape: Shape,
}

impl Node {
    pub fn new(kind: NodeKind, operands: Vec<NodeRef>, shape: Shape) -> Self {
        Self {
            kind,
            operands,
            shape,
        }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn operands(&self) -> &[NodeRef] {
        &self.operands
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }
}

/// Append-only arena used to build a `Graph`.
///
/// Operands must already exist when an operation is added, so the arena order is a
/// topological order by construction.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    inputs: Vec<NodeRef>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn shape(&self, node: NodeRef) -> Option<Shape> {
        self.nodes.get(node.index()).map(Node::shape)
    }

    /// Declares the next input slot.
    pub fn add_input(&mut self, shape: Shape) -> NodeRef {
        let slot = self.inputs.len();
        let node = self.push(Node::new(NodeKind::Input { slot }, Vec::new(), shape));
        self.inputs.push(node);
        node
    }

    pub fn add_constant(&mut self, value: f64) -> NodeRef {
        self.push(Node::new(
            NodeKind::Constant(vec![value]),
            Vec::new(),
            Shape::scalar(),
        ))
    }

    pub fn add_constant_vector(&mut self, values: Vec<f64>) -> NodeRef {
        let shape = Shape::vector(values.len());
        self.push(Node::new(NodeKind::Constant(values), Vec::new(), shape))
    }

    pub fn add_op(&mut self, kind: OpKind, operands: &[NodeRef]) -> Result<NodeRef, AdError> {
        if operands.len() != kind.arity() {
            return Err(AdError::ArityMismatch {
                kind: kind.to_string(),
                expected: kind.arity(),
                found: operands.len(),
            });
        }
        let len = self.nodes.len();
        let shapes = operands
            .iter()
            .map(|&r| {
                self.shape(r).ok_or(AdError::DanglingOperand {
                    index: r.index(),
                    len,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let shape = kind.result_shape(&shapes)?;
        Ok(self.push(Node::new(NodeKind::Op(kind), operands.to_vec(), shape)))
    }

    pub fn unary(&mut self, op: UnaryOp, a: NodeRef) -> Result<NodeRef, AdError> {
        self.add_op(OpKind::Unary(op), &[a])
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.add_op(OpKind::Binary(op), &[a, b])
    }

    pub fn add(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn pow(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Pow, a, b)
    }

    pub fn min(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Min, a, b)
    }

    pub fn max(&mut self, a: NodeRef, b: NodeRef) -> Result<NodeRef, AdError> {
        self.binary(BinaryOp::Max, a, b)
    }

    pub fn neg(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Neg, a)
    }

    pub fn sin(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Sin, a)
    }

    pub fn cos(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Cos, a)
    }

    pub fn exp(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Exp, a)
    }

    pub fn log(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Log, a)
    }

    pub fn sqrt(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Sqrt, a)
    }

    pub fn square(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.unary(UnaryOp::Square, a)
    }

    pub fn sum(&mut self, a: NodeRef) -> Result<NodeRef, AdError> {
        self.add_op(OpKind::Sum, &[a])
    }

    pub fn index(&mut self, a: NodeRef, i: usize) -> Result<NodeRef, AdError> {
        self.add_op(OpKind::Index(i), &[a])
    }

    pub fn concat(&mut self, parts: &[NodeRef]) -> Result<NodeRef, AdError> {
        self.add_op(OpKind::Concat(parts.len()), parts)
    }

    /// Closes the arena and declares the outputs, in slot order.
    pub fn finalize(self, outputs: &[NodeRef]) -> Result<Graph, AdError> {
        let len = self.nodes.len();
        if let Some(bad) = outputs.iter().find(|r| r.index() >= len) {
            return Err(AdError::DanglingOutput {
                index: bad.index(),
                len,
            });
        }
        Ok(Graph::assemble(self.nodes, self.inputs, outputs.to_vec()))
    }

    fn push(&mut self, node: Node) -> NodeRef {
        let r = NodeRef(self.nodes.len());
        self.nodes.push(node);
        r
    }
}

/// An immutable expression DAG in a fixed topological order.
///
/// Per-call values never live here; share a graph between functions with `Arc<Graph>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<NodeRef>,
    outputs: Vec<NodeRef>,
    /// Prefix sums of node lengths; node i owns `offsets[i]..offsets[i + 1]` of a buffer.
    offsets: Vec<usize>,
}

impl Graph {
    fn assemble(nodes: Vec<Node>, inputs: Vec<NodeRef>, outputs: Vec<NodeRef>) -> Self {
        let mut offsets = Vec::with_capacity(nodes.len() + 1);
        let mut end = 0;
        offsets.push(end);
        for node in &nodes {
            end += node.shape.len();
            offsets.push(end);
        }
        Self {
            nodes,
            inputs,
            outputs,
            offsets,
        }
    }

    /// Builds a graph from nodes in any order, e.g. ones read back by a deserializer.
    ///
    /// Nodes are re-sorted topologically (ties broken by original position), references
    /// are renumbered and every node is re-validated. Input slots are taken from the
    /// `Input` nodes and must cover `0..n` exactly once.
    pub fn from_nodes(nodes: Vec<Node>, outputs: Vec<NodeRef>) -> Result<Self, AdError> {
        let len = nodes.len();
        if let Some(bad) = outputs.iter().find(|r| r.index() >= len) {
            return Err(AdError::DanglingOutput {
                index: bad.index(),
                len,
            });
        }

        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); len];
        let mut pending = vec![0usize; len];
        for (index, node) in nodes.iter().enumerate() {
            for operand in &node.operands {
                if operand.index() >= len {
                    return Err(AdError::DanglingOperand {
                        index: operand.index(),
                        len,
                    });
                }
                consumers[operand.index()].push(index);
                pending[index] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..len)
            .filter(|&i| pending[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(len);
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &consumer in &consumers[index] {
                pending[consumer] -= 1;
                if pending[consumer] == 0 {
                    ready.push(Reverse(consumer));
                }
            }
        }
        if order.len() < len {
            let node = (0..len).find(|&i| pending[i] > 0).unwrap_or(0);
            return Err(AdError::GraphCycle { node });
        }

        let mut position = vec![0usize; len];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }

        let n_inputs = nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Input { .. }))
            .count();
        let mut remaining: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
        let mut sorted: Vec<Node> = Vec::with_capacity(len);
        let mut slots: Vec<Option<NodeRef>> = vec![None; n_inputs];
        for &old in &order {
            let Some(node) = remaining[old].take() else {
                continue;
            };
            let operands: Vec<NodeRef> = node
                .operands
                .iter()
                .map(|r| NodeRef(position[r.index()]))
                .collect();
            let this = NodeRef(sorted.len());
            match &node.kind {
                NodeKind::Input { slot } => {
                    expect_leaf("input", &operands)?;
                    if *slot >= n_inputs {
                        return Err(AdError::InputSlots {
                            detail: format!("slot {} but only {} input(s)", slot, n_inputs),
                        });
                    }
                    if slots[*slot].replace(this).is_some() {
                        return Err(AdError::InputSlots {
                            detail: format!("slot {} is declared twice", slot),
                        });
                    }
                }
                NodeKind::Constant(values) => {
                    expect_leaf("constant", &operands)?;
                    if values.len() != node.shape.len() {
                        return Err(AdError::ShapeMismatch {
                            kind: "constant".to_string(),
                            detail: format!(
                                "{} value(s) for shape {}",
                                values.len(),
                                node.shape
                            ),
                        });
                    }
                }
                NodeKind::Op(kind) => {
                    let shapes: Vec<Shape> =
                        operands.iter().map(|r| sorted[r.index()].shape).collect();
                    let shape = kind.result_shape(&shapes)?;
                    if shape != node.shape {
                        return Err(AdError::ShapeMismatch {
                            kind: kind.to_string(),
                            detail: format!(
                                "declared {} but operands give {}",
                                node.shape, shape
                            ),
                        });
                    }
                }
            }
            sorted.push(Node::new(node.kind, operands, node.shape));
        }

        let inputs = slots
            .into_iter()
            .enumerate()
            .map(|(slot, r)| {
                r.ok_or_else(|| AdError::InputSlots {
                    detail: format!("slot {} is missing", slot),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = outputs
            .iter()
            .map(|r| NodeRef(position[r.index()]))
            .collect();
        Ok(Self::assemble(sorted, inputs, outputs))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, r: NodeRef) -> Option<&Node> {
        self.nodes.get(r.index())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[NodeRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeRef] {
        &self.outputs
    }

    pub fn input_shape(&self, slot: usize) -> Option<Shape> {
        self.inputs.get(slot).map(|r| self.nodes[r.index()].shape)
    }

    pub fn output_shape(&self, slot: usize) -> Option<Shape> {
        self.outputs.get(slot).map(|r| self.nodes[r.index()].shape)
    }

    /// Number of `f64` entries a per-node buffer needs.
    pub fn storage_len(&self) -> usize {
        self.offsets[self.nodes.len()]
    }

    pub(crate) fn span(&self, index: usize) -> Range<usize> {
        self.offsets[index]..self.offsets[index + 1]
    }

    /// The entries of `node` inside a per-node buffer (or a prefix of one).
    pub(crate) fn values<'a>(&self, buffer: &'a [f64], node: NodeRef) -> &'a [f64] {
        &buffer[self.span(node.index())]
    }
}

fn expect_leaf(kind: &str, operands: &[NodeRef]) -> Result<(), AdError> {
    if operands.is_empty() {
        Ok(())
    } else {
        Err(AdError::ArityMismatch {
            kind: kind.to_string(),
            expected: 0,
            found: operands.len(),
        })
    }
}
