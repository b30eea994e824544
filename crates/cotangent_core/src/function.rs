use crate::adjoint::adjoint_sweep;
use crate::error::{AdError, SlotRole};
use crate::evaluator::primal_sweep;
use crate::forward::tangent_sweep;
use crate::graph::Graph;
use log::debug;
use nalgebra::DMatrix;
use std::sync::Arc;

/// Anything that names a slot: its position or its declared name.
pub trait SlotKey {
    fn position(&self, names: &[String]) -> Option<usize>;
    fn label(&self) -> String;
}

impl SlotKey for usize {
    fn position(&self, names: &[String]) -> Option<usize> {
        (*self < names.len()).then_some(*self)
    }

    fn label(&self) -> String {
        self.to_string()
    }
}

impl SlotKey for &str {
    fn position(&self, names: &[String]) -> Option<usize> {
        names.iter().position(|n| n == self)
    }

    fn label(&self) -> String {
        (*self).to_string()
    }
}

impl SlotKey for &String {
    fn position(&self, names: &[String]) -> Option<usize> {
        self.as_str().position(names)
    }

    fn label(&self) -> String {
        (*self).clone()
    }
}

/// A graph bound to named input/output slots, plus the per-call buffers for it.
///
/// The graph is shared and never touched; everything a call mutates lives here:
/// - `primal`, `tangent`, `adjoint`: one entry range per node, sized once from the graph.
/// - forward seeds per input slot and forward sensitivities per output slot.
/// - adjoint seeds per output slot and adjoint sensitivities per input slot.
///
/// Sweeps are single calls; a failing call returns before writing anything.
#[derive(Debug, Clone)]
pub struct Function {
    graph: Arc<Graph>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    primal: Vec<f64>,
    tangent: Vec<f64>,
    adjoint: Vec<f64>,
    fwd_seed: Vec<Vec<f64>>,
    fwd_sens: Vec<Vec<f64>>,
    adj_seed: Vec<Vec<f64>>,
    adj_sens: Vec<Vec<f64>>,
    primal_current: bool,
}

impl Function {
    /// Binds `graph` with slot names `i0, i1, ...` and `o0, o1, ...`.
    pub fn new(graph: Arc<Graph>) -> Self {
        let inputs = (0..graph.inputs().len()).map(|i| format!("i{}", i)).collect();
        let outputs = (0..graph.outputs().len()).map(|i| format!("o{}", i)).collect();
        Self::build(graph, inputs, outputs)
    }

    pub fn with_names(
        graph: Arc<Graph>,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<Self, AdError> {
        if inputs.len() != graph.inputs().len() {
            return Err(AdError::SlotCount {
                role: SlotRole::Input,
                expected: graph.inputs().len(),
                found: inputs.len(),
            });
        }
        if outputs.len() != graph.outputs().len() {
            return Err(AdError::SlotCount {
                role: SlotRole::Output,
                expected: graph.outputs().len(),
                found: outputs.len(),
            });
        }
        check_unique(SlotRole::Input, inputs)?;
        check_unique(SlotRole::Output, outputs)?;
        let inputs = inputs.iter().map(|s| s.to_string()).collect();
        let outputs = outputs.iter().map(|s| s.to_string()).collect();
        Ok(Self::build(graph, inputs, outputs))
    }

    fn build(graph: Arc<Graph>, input_names: Vec<String>, output_names: Vec<String>) -> Self {
        let storage = graph.storage_len();
        let per_input: Vec<Vec<f64>> = graph
            .inputs()
            .iter()
            .map(|r| vec![0.0; graph.span(r.index()).len()])
            .collect();
        let per_output: Vec<Vec<f64>> = graph
            .outputs()
            .iter()
            .map(|r| vec![0.0; graph.span(r.index()).len()])
            .collect();
        debug!(
            "function over {} nodes: {} inputs, {} outputs, {} work entries",
            graph.len(),
            input_names.len(),
            output_names.len(),
            storage
        );
        Self {
            graph,
            input_names,
            output_names,
            primal: vec![0.0; storage],
            tangent: vec![0.0; storage],
            adjoint: vec![0.0; storage],
            fwd_seed: per_input.clone(),
            fwd_sens: per_output.clone(),
            adj_seed: per_output,
            adj_sens: per_input,
            primal_current: false,
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.len()
    }

    /// Entries in each per-node buffer.
    pub fn work_size(&self) -> usize {
        self.primal.len()
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    pub fn input_index(&self, key: impl SlotKey) -> Result<usize, AdError> {
        key.position(&self.input_names)
            .ok_or_else(|| AdError::UnknownSlot {
                role: SlotRole::Input,
                name: key.label(),
            })
    }

    pub fn output_index(&self, key: impl SlotKey) -> Result<usize, AdError> {
        key.position(&self.output_names)
            .ok_or_else(|| AdError::UnknownSlot {
                role: SlotRole::Output,
                name: key.label(),
            })
    }

    /// Number of entries in an input slot.
    pub fn input_len(&self, key: impl SlotKey) -> Result<usize, AdError> {
        let slot = self.input_index(key)?;
        Ok(self.fwd_seed[slot].len())
    }

    /// Number of entries in an output slot.
    pub fn output_len(&self, key: impl SlotKey) -> Result<usize, AdError> {
        let slot = self.output_index(key)?;
        Ok(self.fwd_sens[slot].len())
    }

    // --- Primal ---

    pub fn set_input(&mut self, key: impl SlotKey, values: &[f64]) -> Result<(), AdError> {
        let slot = self.input_index(key)?;
        self.check_len(SlotRole::Input, slot, values.len())?;
        self.write_input(slot, values);
        Ok(())
    }

    pub fn input(&self, key: impl SlotKey) -> Result<&[f64], AdError> {
        let slot = self.input_index(key)?;
        Ok(self.graph.values(&self.primal, self.graph.inputs()[slot]))
    }

    /// Runs the primal sweep with the inputs currently set.
    pub fn evaluate(&mut self) {
        primal_sweep(&self.graph, &mut self.primal);
        self.primal_current = true;
    }

    pub fn output(&self, key: impl SlotKey) -> Result<&[f64], AdError> {
        let slot = self.output_index(key)?;
        self.ensure_current()?;
        Ok(self.output_at(slot))
    }

    /// Sets every input, evaluates, and returns copies of every output.
    pub fn call(&mut self, inputs: &[&[f64]]) -> Result<Vec<Vec<f64>>, AdError> {
        self.check_all(SlotRole::Input, inputs)?;
        for (slot, values) in inputs.iter().enumerate() {
            self.write_input(slot, values);
        }
        self.evaluate();
        Ok((0..self.output_names.len())
            .map(|slot| self.output_at(slot).to_vec())
            .collect())
    }

    // --- Forward mode ---

    pub fn set_fwd_seed(&mut self, key: impl SlotKey, values: &[f64]) -> Result<(), AdError> {
        let slot = self.input_index(key)?;
        self.check_len(SlotRole::Input, slot, values.len())?;
        self.fwd_seed[slot].copy_from_slice(values);
        Ok(())
    }

    /// Propagates the current forward seeds. Requires current primal values.
    pub fn forward(&mut self) -> Result<(), AdError> {
        self.ensure_current()?;
        self.run_forward();
        Ok(())
    }

    pub fn fwd_sens(&self, key: impl SlotKey) -> Result<&[f64], AdError> {
        let slot = self.output_index(key)?;
        Ok(&self.fwd_sens[slot])
    }

    /// Sets all forward seeds (one array per input slot), propagates them, and returns the
    /// tangent of every output.
    pub fn forward_sweep(&mut self, seeds: &[&[f64]]) -> Result<Vec<Vec<f64>>, AdError> {
        self.ensure_current()?;
        self.check_all(SlotRole::Input, seeds)?;
        for (slot, seed) in seeds.iter().enumerate() {
            self.fwd_seed[slot].copy_from_slice(seed);
        }
        self.run_forward();
        Ok(self.fwd_sens.clone())
    }

    // --- Adjoint mode ---

    pub fn set_adj_seed(&mut self, key: impl SlotKey, values: &[f64]) -> Result<(), AdError> {
        let slot = self.output_index(key)?;
        self.check_len(SlotRole::Output, slot, values.len())?;
        self.adj_seed[slot].copy_from_slice(values);
        Ok(())
    }

    /// Propagates the current adjoint seeds. Requires current primal values.
    pub fn adjoint(&mut self) -> Result<(), AdError> {
        self.ensure_current()?;
        self.run_adjoint();
        Ok(())
    }

    pub fn adj_sens(&self, key: impl SlotKey) -> Result<&[f64], AdError> {
        let slot = self.input_index(key)?;
        Ok(&self.adj_sens[slot])
    }

    /// Sets all adjoint seeds (one array per output slot), propagates them, and returns the
    /// adjoint of every input.
    pub fn adjoint_sweep(&mut self, seeds: &[&[f64]]) -> Result<Vec<Vec<f64>>, AdError> {
        self.ensure_current()?;
        self.check_all(SlotRole::Output, seeds)?;
        for (slot, seed) in seeds.iter().enumerate() {
            self.adj_seed[slot].copy_from_slice(seed);
        }
        self.run_adjoint();
        Ok(self.adj_sens.clone())
    }

    // --- Derived quantities ---

    /// Dense Jacobian of one output with respect to one input, one forward sweep per
    /// input entry. Leaves all forward seeds at zero.
    pub fn jacobian(
        &mut self,
        input: impl SlotKey,
        output: impl SlotKey,
    ) -> Result<DMatrix<f64>, AdError> {
        let i = self.input_index(input)?;
        let o = self.output_index(output)?;
        self.ensure_current()?;

        let (n, m) = (self.fwd_seed[i].len(), self.fwd_sens[o].len());
        let mut jac = DMatrix::zeros(m, n);
        for seed in &mut self.fwd_seed {
            seed.fill(0.0);
        }
        for col in 0..n {
            self.fwd_seed[i][col] = 1.0;
            self.run_forward();
            self.fwd_seed[i][col] = 0.0;
            for (row, &v) in self.fwd_sens[o].iter().enumerate() {
                jac[(row, col)] = v;
            }
        }
        Ok(jac)
    }

    /// Gradient of a scalar output with respect to one input, from one adjoint sweep.
    /// Leaves the adjoint seeds set to that unit seed.
    pub fn gradient(&mut self, input: impl SlotKey, output: impl SlotKey) -> Result<Vec<f64>, AdError> {
        let i = self.input_index(input)?;
        let o = self.output_index(output)?;
        self.ensure_current()?;
        let found = self.slot_len(SlotRole::Output, o);
        if found != 1 {
            return Err(AdError::SizeMismatch {
                role: SlotRole::Output,
                name: self.output_names[o].clone(),
                expected: 1,
                found,
            });
        }

        for seed in &mut self.adj_seed {
            seed.fill(0.0);
        }
        self.adj_seed[o][0] = 1.0;
        self.run_adjoint();
        Ok(self.adj_sens[i].clone())
    }

    // --- Unchecked access for callers that validated slots up front ---

    pub(crate) fn write_input(&mut self, slot: usize, values: &[f64]) {
        let span = self.graph.span(self.graph.inputs()[slot].index());
        self.primal[span].copy_from_slice(values);
        self.primal_current = false;
    }

    pub(crate) fn output_at(&self, slot: usize) -> &[f64] {
        self.graph.values(&self.primal, self.graph.outputs()[slot])
    }

    pub(crate) fn write_fwd_seed(&mut self, slot: usize, values: &[f64]) {
        self.fwd_seed[slot].copy_from_slice(values);
    }

    pub(crate) fn fwd_sens_at(&self, slot: usize) -> &[f64] {
        &self.fwd_sens[slot]
    }

    pub(crate) fn write_adj_seed(&mut self, slot: usize, values: &[f64]) {
        self.adj_seed[slot].copy_from_slice(values);
    }

    pub(crate) fn adj_sens_at(&self, slot: usize) -> &[f64] {
        &self.adj_sens[slot]
    }

    pub(crate) fn run_forward(&mut self) {
        let graph = &self.graph;
        for (slot, r) in graph.inputs().iter().enumerate() {
            self.tangent[graph.span(r.index())].copy_from_slice(&self.fwd_seed[slot]);
        }
        tangent_sweep(graph, &self.primal, &mut self.tangent);
        for (slot, &r) in graph.outputs().iter().enumerate() {
            self.fwd_sens[slot].copy_from_slice(graph.values(&self.tangent, r));
        }
    }

    pub(crate) fn run_adjoint(&mut self) {
        let graph = &self.graph;
        self.adjoint.fill(0.0);
        // An output declared twice (or also an input) receives the sum of its seeds.
        for (slot, r) in graph.outputs().iter().enumerate() {
            let span = graph.span(r.index());
            for (v, &s) in self.adjoint[span].iter_mut().zip(&self.adj_seed[slot]) {
                *v += s;
            }
        }
        adjoint_sweep(graph, &self.primal, &mut self.adjoint);
        for (slot, &r) in graph.inputs().iter().enumerate() {
            self.adj_sens[slot].copy_from_slice(graph.values(&self.adjoint, r));
        }
    }

    fn ensure_current(&self) -> Result<(), AdError> {
        if self.primal_current {
            Ok(())
        } else {
            Err(AdError::StalePrimal)
        }
    }

    fn slot_len(&self, role: SlotRole, slot: usize) -> usize {
        match role {
            SlotRole::Input => self.fwd_seed[slot].len(),
            SlotRole::Output => self.fwd_sens[slot].len(),
        }
    }

    fn check_len(&self, role: SlotRole, slot: usize, found: usize) -> Result<(), AdError> {
        let expected = self.slot_len(role, slot);
        if expected == found {
            return Ok(());
        }
        let name = match role {
            SlotRole::Input => self.input_names[slot].clone(),
            SlotRole::Output => self.output_names[slot].clone(),
        };
        Err(AdError::SizeMismatch {
            role,
            name,
            expected,
            found,
        })
    }

    fn check_all(&self, role: SlotRole, arrays: &[&[f64]]) -> Result<(), AdError> {
        let expected = match role {
            SlotRole::Input => self.input_names.len(),
            SlotRole::Output => self.output_names.len(),
        };
        if arrays.len() != expected {
            return Err(AdError::SlotCount {
                role,
                expected,
                found: arrays.len(),
            });
        }
        for (slot, values) in arrays.iter().enumerate() {
            self.check_len(role, slot, values.len())?;
        }
        Ok(())
    }
}

/// Names address slots, so each one may appear once per side.
fn check_unique(role: SlotRole, names: &[&str]) -> Result<(), AdError> {
    for (i, name) in names.iter().enumerate() {
        if names[..i].contains(name) {
            return Err(AdError::DuplicateSlot {
                role,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Shape};
    use std::thread;

    /// `max_ = max(x, y)`, `min_ = min(x, y)` with inputs `x`, `y`.
    fn min_max() -> Function {
        let mut builder = GraphBuilder::new();
        let x = builder.add_input(Shape::scalar());
        let y = builder.add_input(Shape::scalar());
        let hi = builder.max(x, y).unwrap();
        let lo = builder.min(x, y).unwrap();
        let graph = builder.finalize(&[hi, lo]).unwrap();
        Function::with_names(Arc::new(graph), &["x", "y"], &["max", "min"]).unwrap()
    }

    fn fwd(f: &mut Function, dx: f64, dy: f64) -> (f64, f64) {
        f.set_fwd_seed("x", &[dx]).unwrap();
        f.set_fwd_seed("y", &[dy]).unwrap();
        f.forward().unwrap();
        (f.fwd_sens("max").unwrap()[0], f.fwd_sens("min").unwrap()[0])
    }

    fn adj(f: &mut Function, bar_max: f64, bar_min: f64) -> (f64, f64) {
        f.set_adj_seed("max", &[bar_max]).unwrap();
        f.set_adj_seed("min", &[bar_min]).unwrap();
        f.adjoint().unwrap();
        (f.adj_sens("x").unwrap()[0], f.adj_sens("y").unwrap()[0])
    }

    #[test]
    fn min_max_values_and_sensitivities() {
        let mut f = min_max();
        f.set_input("x", &[4.0]).unwrap();
        f.set_input("y", &[6.0]).unwrap();
        f.evaluate();
        assert_eq!(f.output("max").unwrap(), &[6.0]);
        assert_eq!(f.output("min").unwrap(), &[4.0]);

        // max ignores the smaller argument, min follows it
        assert_eq!(fwd(&mut f, 1.0, 0.0), (0.0, 1.0));
        assert_eq!(fwd(&mut f, 0.0, 1.0), (1.0, 0.0));

        assert_eq!(adj(&mut f, 1.0, 0.0), (0.0, 1.0));
        assert_eq!(adj(&mut f, 0.0, 1.0), (1.0, 0.0));
    }

    #[test]
    fn min_max_ties_go_to_first_argument() {
        let mut f = min_max();
        f.set_input("x", &[5.0]).unwrap();
        f.set_input("y", &[5.0]).unwrap();
        f.evaluate();
        assert_eq!(f.output("max").unwrap(), &[5.0]);
        assert_eq!(f.output("min").unwrap(), &[5.0]);

        assert_eq!(fwd(&mut f, 1.0, 0.0), (1.0, 1.0));
        assert_eq!(fwd(&mut f, 0.0, 1.0), (0.0, 0.0));

        assert_eq!(adj(&mut f, 1.0, 0.0), (1.0, 0.0));
        assert_eq!(adj(&mut f, 0.0, 1.0), (1.0, 0.0));
    }

    #[test]
    fn sweeps_require_current_primal_values() {
        let mut f = min_max();
        assert_eq!(f.forward(), Err(AdError::StalePrimal));
        assert_eq!(f.adjoint(), Err(AdError::StalePrimal));
        assert_eq!(f.output("max"), Err(AdError::StalePrimal));

        f.set_input("x", &[1.0]).unwrap();
        f.set_input("y", &[2.0]).unwrap();
        f.evaluate();
        assert!(f.forward().is_ok());

        f.set_input("x", &[3.0]).unwrap();
        assert_eq!(f.adjoint(), Err(AdError::StalePrimal));
        assert_eq!(
            f.forward_sweep(&[&[1.0], &[0.0]]),
            Err(AdError::StalePrimal)
        );
    }

    #[test]
    fn unknown_slots_are_reported() {
        let mut f = min_max();
        let err = f.set_input("z", &[1.0]).unwrap_err();
        assert_eq!(
            err,
            AdError::UnknownSlot {
                role: SlotRole::Input,
                name: "z".to_string(),
            }
        );
        assert!(matches!(
            f.fwd_sens(2usize),
            Err(AdError::UnknownSlot {
                role: SlotRole::Output,
                ..
            })
        ));
        assert!(f.adj_sens("max").is_err());
        assert_eq!(f.input_index("y"), Ok(1));
        assert_eq!(f.output_index(1usize), Ok(1));
    }

    #[test]
    fn failed_calls_leave_buffers_untouched() {
        let mut f = min_max();
        f.call(&[&[4.0], &[6.0]]).unwrap();
        f.set_fwd_seed("x", &[1.0]).unwrap();

        let err = f.set_input("x", &[1.0, 2.0]).unwrap_err();
        assert_eq!(
            err,
            AdError::SizeMismatch {
                role: SlotRole::Input,
                name: "x".to_string(),
                expected: 1,
                found: 2,
            }
        );
        assert_eq!(f.input("x").unwrap(), &[4.0]);
        assert_eq!(f.output("max").unwrap(), &[6.0]);

        let err = f.forward_sweep(&[&[0.0], &[1.0, 1.0]]).unwrap_err();
        assert!(matches!(err, AdError::SizeMismatch { .. }));
        f.forward().unwrap();
        assert_eq!(f.fwd_sens("min").unwrap(), &[1.0]);

        let err = f.call(&[&[9.0]]).unwrap_err();
        assert_eq!(
            err,
            AdError::SlotCount {
                role: SlotRole::Input,
                expected: 2,
                found: 1,
            }
        );
        assert_eq!(f.input("x").unwrap(), &[4.0]);
    }

    #[test]
    fn atomic_sweeps_return_all_slots() {
        let mut f = min_max();
        let outputs = f.call(&[&[4.0], &[6.0]]).unwrap();
        assert_eq!(outputs, vec![vec![6.0], vec![4.0]]);

        let tangents = f.forward_sweep(&[&[0.0], &[1.0]]).unwrap();
        assert_eq!(tangents, vec![vec![1.0], vec![0.0]]);

        let adjoints = f.adjoint_sweep(&[&[1.0], &[1.0]]).unwrap();
        assert_eq!(adjoints, vec![vec![1.0], vec![1.0]]);
    }

    /// f(v, s) = [sin(v0 * s), v1^2 + exp(s), v0 / v1]
    fn smooth_vector_function() -> Function {
        let mut b = GraphBuilder::new();
        let v = b.add_input(Shape::vector(2));
        let s = b.add_input(Shape::scalar());
        let v0 = b.index(v, 0).unwrap();
        let v1 = b.index(v, 1).unwrap();
        let p = b.mul(v0, s).unwrap();
        let f0 = b.sin(p).unwrap();
        let sq = b.square(v1).unwrap();
        let es = b.exp(s).unwrap();
        let f1 = b.add(sq, es).unwrap();
        let f2 = b.div(v0, v1).unwrap();
        let out = b.concat(&[f0, f1, f2]).unwrap();
        let total = b.sum(out).unwrap();
        let graph = b.finalize(&[out, total]).unwrap();
        Function::with_names(Arc::new(graph), &["v", "s"], &["f", "total"]).unwrap()
    }

    #[test]
    fn forward_jacobian_matches_adjoint_rows() {
        let mut f = smooth_vector_function();
        f.call(&[&[0.3, 1.7], &[0.9]]).unwrap();

        let jac = f.jacobian("v", "f").unwrap();
        assert_eq!(jac.shape(), (3, 2));
        for row in 0..3 {
            let mut seed = vec![0.0; 3];
            seed[row] = 1.0;
            let adjoints = f.adjoint_sweep(&[&seed, &[0.0]]).unwrap();
            for col in 0..2 {
                assert!((jac[(row, col)] - adjoints[0][col]).abs() < 1e-12);
            }
        }

        let (v0, v1, s) = (0.3_f64, 1.7_f64, 0.9_f64);
        assert!((jac[(0, 0)] - s * (v0 * s).cos()).abs() < 1e-12);
        assert!((jac[(1, 1)] - 2.0 * v1).abs() < 1e-12);
        assert!((jac[(2, 1)] + v0 / (v1 * v1)).abs() < 1e-12);
    }

    #[test]
    fn gradient_equals_unit_forward_tangents() {
        let mut f = smooth_vector_function();
        f.call(&[&[0.3, 1.7], &[0.9]]).unwrap();

        let grad_v = f.gradient("v", "total").unwrap();
        let grad_s = f.gradient("s", "total").unwrap();
        for (k, expected) in grad_v.iter().enumerate() {
            let mut seed = vec![0.0; 2];
            seed[k] = 1.0;
            let t = f.forward_sweep(&[&seed, &[0.0]]).unwrap();
            assert!((t[1][0] - expected).abs() < 1e-12);
        }
        let t = f.forward_sweep(&[&[0.0, 0.0], &[1.0]]).unwrap();
        assert!((t[1][0] - grad_s[0]).abs() < 1e-12);

        let err = f.gradient("v", "f").unwrap_err();
        assert!(matches!(err, AdError::SizeMismatch { expected: 1, found: 3, .. }));
    }

    #[test]
    fn sweeps_never_change_the_graph() {
        let mut f = smooth_vector_function();
        let snapshot = (**f.graph()).clone();
        f.call(&[&[0.3, 1.7], &[0.9]]).unwrap();
        f.forward_sweep(&[&[1.0, 0.0], &[0.0]]).unwrap();
        f.adjoint_sweep(&[&[1.0, 1.0, 1.0], &[1.0]]).unwrap();
        f.jacobian(0usize, 0usize).unwrap();
        assert_eq!(**f.graph(), snapshot);
        assert_eq!(f.node_count(), snapshot.len());
        assert_eq!(f.work_size(), snapshot.storage_len());
    }

    #[test]
    fn functions_sharing_a_graph_run_on_threads() {
        let graph = Arc::clone(min_max().graph());
        let handles: Vec<_> = (0..4)
            .map(|k| {
                let graph = Arc::clone(&graph);
                thread::spawn(move || {
                    let mut f = Function::new(graph);
                    let x = k as f64;
                    let out = f.call(&[&[x], &[1.5]]).unwrap();
                    let adj = f.adjoint_sweep(&[&[1.0], &[0.0]]).unwrap();
                    (out[0][0], adj[0][0])
                })
            })
            .collect();
        for (k, handle) in handles.into_iter().enumerate() {
            let (hi, dx) = handle.join().unwrap();
            let x = k as f64;
            assert_eq!(hi, x.max(1.5));
            assert_eq!(dx, if x >= 1.5 { 1.0 } else { 0.0 });
        }
    }

    #[test]
    fn default_names_and_name_count_checks() {
        let f = min_max();
        let g = Function::new(Arc::clone(f.graph()));
        assert_eq!(g.input_names(), &["i0".to_string(), "i1".to_string()]);
        assert_eq!(g.output_names(), &["o0".to_string(), "o1".to_string()]);

        let err = Function::with_names(Arc::clone(f.graph()), &["x"], &["a", "b"]).unwrap_err();
        assert!(matches!(err, AdError::SlotCount { role: SlotRole::Input, .. }));
    }

    #[test]
    fn repeated_slot_names_are_rejected() {
        let graph = Arc::clone(min_max().graph());
        let err = Function::with_names(Arc::clone(&graph), &["x", "x"], &["max", "min"]).unwrap_err();
        assert_eq!(
            err,
            AdError::DuplicateSlot {
                role: SlotRole::Input,
                name: "x".to_string(),
            }
        );
        let err = Function::with_names(graph, &["x", "y"], &["out", "out"]).unwrap_err();
        assert!(matches!(
            err,
            AdError::DuplicateSlot {
                role: SlotRole::Output,
                ..
            }
        ));
    }

    #[test]
    fn gradient_reports_non_scalar_output_size() {
        let mut f = smooth_vector_function();
        f.call(&[&[0.3, 1.7], &[0.9]]).unwrap();
        let err = f.gradient("s", "f").unwrap_err();
        assert_eq!(
            err,
            AdError::SizeMismatch {
                role: SlotRole::Output,
                name: "f".to_string(),
                expected: 1,
                found: 3,
            }
        );
        assert_eq!(err.to_string(), "output slot `f` holds 1 value(s), got 3");
    }
}
