use crate::graph::{Graph, NodeKind, OpKind};
use crate::ops::{binary_partials, lane, unary_partial};

/// Reverse (adjoint) sweep: `adj(a) += adj(f) * df/da` in reverse graph order.
///
/// `primal` must be current for the graph. `adjoint` must be zero except for the declared
/// outputs, which hold the seed. Contributions accumulate, so a node feeding several
/// consumers ends up with the sum over all of them. Leaves keep what they received.
pub fn adjoint_sweep(graph: &Graph, primal: &[f64], adjoint: &mut [f64]) {
    for (index, node) in graph.nodes().iter().enumerate().rev() {
        let NodeKind::Op(kind) = node.kind() else {
            continue;
        };
        let span = graph.span(index);
        let y = &primal[span.clone()];
        let (before, rest) = adjoint.split_at_mut(span.start);
        let bar = &rest[..span.len()];
        let operands = node.operands();

        match *kind {
            OpKind::Unary(op) => {
                let sa = graph.span(operands[0].index());
                let a = &primal[sa.clone()];
                for (i, &g) in bar.iter().enumerate() {
                    before[sa.start + i] += g * unary_partial(op, a[i], y[i]);
                }
            }
            OpKind::Binary(op) => {
                let sa = graph.span(operands[0].index());
                let sb = graph.span(operands[1].index());
                let a = &primal[sa.clone()];
                let b = &primal[sb.clone()];
                for (i, &g) in bar.iter().enumerate() {
                    let (ia, ib) = (lane(a, i), lane(b, i));
                    let (da, db) = binary_partials(op, a[ia], b[ib], y[i]);
                    before[sa.start + ia] += g * da;
                    before[sb.start + ib] += g * db;
                }
            }
            OpKind::Sum => {
                let sa = graph.span(operands[0].index());
                for v in &mut before[sa] {
                    *v += bar[0];
                }
            }
            OpKind::Index(k) => {
                let sa = graph.span(operands[0].index());
                before[sa.start + k] += bar[0];
            }
            OpKind::Concat(_) => {
                let mut at = 0;
                for part in operands {
                    let sp = graph.span(part.index());
                    let n = sp.len();
                    for (v, &g) in before[sp].iter_mut().zip(&bar[at..at + n]) {
                        *v += g;
                    }
                    at += n;
                }
            }
        }
    }
}
