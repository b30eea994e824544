use crate::graph::{Graph, NodeKind, OpKind};
use crate::ops::{binary_primal, lane, unary_primal};

/// Primal sweep over the graph's fixed order.
///
/// `values` is a per-node buffer of `graph.storage_len()` entries. Input nodes must already
/// hold the caller's values; every other node is overwritten from its operands.
pub fn primal_sweep(graph: &Graph, values: &mut [f64]) {
    for (index, node) in graph.nodes().iter().enumerate() {
        let span = graph.span(index);
        let (done, rest) = values.split_at_mut(span.start);
        let out = &mut rest[..span.len()];
        let operands = node.operands();

        match node.kind() {
            NodeKind::Input { .. } => {}
            NodeKind::Constant(constant) => out.copy_from_slice(constant),
            NodeKind::Op(kind) => match *kind {
                OpKind::Unary(op) => {
                    let a = graph.values(done, operands[0]);
                    for (o, &v) in out.iter_mut().zip(a) {
                        *o = unary_primal(op, v);
                    }
                }
                OpKind::Binary(op) => {
                    let a = graph.values(done, operands[0]);
                    let b = graph.values(done, operands[1]);
                    for (i, o) in out.iter_mut().enumerate() {
                        *o = binary_primal(op, a[lane(a, i)], b[lane(b, i)]);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Shape};

    fn run(graph: &Graph, inputs: &[&[f64]]) -> Vec<f64> {
        let mut values = vec![0.0; graph.storage_len()];
        for (slot, data) in inputs.iter().enumerate() {
            let span = graph.span(graph.inputs()[slot].index());
            values[span].copy_from_slice(data);
        }
        primal_sweep(graph, &mut values);
        values
    }

    #[test]
    fn min_max_primal_values() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_input(Shape::scalar());
        let y = builder.add_input(Shape::scalar());
        let hi = builder.max(x, y).unwrap();
        let lo = builder.min(x, y).unwrap();
        let graph = builder.finalize(&[hi, lo]).unwrap();

        let values = run(&graph, &[&[4.0], &[6.0]]);
        assert_eq!(graph.values(&values, hi), &[6.0]);
        assert_eq!(graph.values(&values, lo), &[4.0]);

        let values = run(&graph, &[&[5.0], &[5.0]]);
        assert_eq!(graph.values(&values, hi), &[5.0]);
        assert_eq!(graph.values(&values, lo), &[5.0]);
    }

    #[test]
    fn broadcasting_and_structural_ops() {
        let mut builder = GraphBuilder::new();
        let v = builder.add_input(Shape::vector(3));
        let k = builder.add_constant(2.0);
        let scaled = builder.mul(v, k).unwrap();
        let clipped = builder.min(scaled, k).unwrap();
        let total = builder.sum(clipped).unwrap();
        let first = builder.index(v, 0).unwrap();
        let stacked = builder.concat(&[first, total]).unwrap();
        let graph = builder.finalize(&[stacked]).unwrap();

        let values = run(&graph, &[&[0.5, 1.0, 3.0]]);
        assert_eq!(graph.values(&values, scaled), &[1.0, 2.0, 6.0]);
        assert_eq!(graph.values(&values, clipped), &[1.0, 2.0, 2.0]);
        assert_eq!(graph.values(&values, stacked), &[0.5, 5.0]);
    }

    #[test]
    fn smooth_ops_evaluate() {
        let mut builder = GraphBuilder::new();
        let x = builder.add_input(Shape::scalar());
        let s = builder.sin(x).unwrap();
        let e = builder.exp(x).unwrap();
        let two = builder.add_constant(2.0);
        let p = builder.pow(e, two).unwrap();
        let out = builder.add(s, p).unwrap();
        let graph = builder.finalize(&[out]).unwrap();

        let values = run(&graph, &[&[0.3]]);
        let expected = 0.3_f64.sin() + (0.6_f64).exp();
        assert!((graph.values(&values, out)[0] - expected).abs() < 1e-12);
    }
}
