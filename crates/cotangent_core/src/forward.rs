use crate::graph::{Graph, NodeKind, OpKind};
use crate::ops::{binary_partials, lane, unary_partial};

/// Forward (tangent) sweep: `t(f(a, b)) = df/da * t(a) + df/db * t(b)` in graph order.
///
/// `primal` must be current for the graph. Input nodes of `tangent` must hold the seed;
/// constants get a zero tangent and every operation is overwritten.
pub fn tangent_sweep(graph: &Graph, primal: &[f64], tangent: &mut [f64]) {
    for (index, node) in graph.nodes().iter().enumerate() {
        let span = graph.span(index);
        let y = &primal[span.clone()];
        let (done, rest) = tangent.split_at_mut(span.start);
        let out = &mut rest[..span.len()];
        let operands = node.operands();

        match node.kind() {
            NodeKind::Input { .. } => {}
            NodeKind::Constant(_) => out.fill(0.0),
            NodeKind::Op(kind) => match *kind {
                OpKind::Unary(op) => {
                    let a = graph.values(primal, operands[0]);
                    let ta = graph.values(done, operands[0]);
                    for (i, o) in out.iter_mut().enumerate() {
                        *o = unary_partial(op, a[i], y[i]) * ta[i];
                    }
                }
                OpKind::Binary(op) => {
                    let a = graph.values(primal, operands[0]);
                    let b = graph.values(primal, operands[1]);
                    let ta = graph.values(done, operands[0]);
                    let tb = graph.values(done, operands[1]);
                    for (i, o) in out.iter_mut().enumerate() {
                        let (ia, ib) = (lane(a, i), lane(b, i));
                        let (da, db) = binary_partials(op, a[ia], b[ib], y[i]);
                        *o = da * ta[ia] + db * tb[ib];
                    }
                }
                OpKind::Sum => out[0] = graph.values(done, operands[0]).iter().sum(),
                OpKind::Index(k) => out[0] = graph.values(done, operands[0])[k],
                OpKind::Concat(_) => {
                    let mut at = 0;
                    for &part in operands {
                        let part = graph.values(done, part);
                        out[at..at + part.len()].copy_from_slice(part);
                        at += part.len();
                    }
                }
            },
        }
    }
}
