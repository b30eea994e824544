use crate::function::Function;
use crate::solvers::{Euler, RK4};
use crate::traits::{DynamicalSystem, Steppable};
use anyhow::{bail, Context, Result};
use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepperKind {
    Euler,
    Rk4,
}

impl StepperKind {
    fn build(self, dim: usize) -> InternalStepper {
        match self {
            StepperKind::Euler => InternalStepper::Euler(Euler::new(dim)),
            StepperKind::Rk4 => InternalStepper::Rk4(RK4::new(dim)),
        }
    }
}

enum InternalStepper {
    Euler(Euler<f64>),
    Rk4(RK4<f64>),
}

impl InternalStepper {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) {
        match self {
            InternalStepper::Euler(s) => s.step(system, t, state, dt),
            InternalStepper::Rk4(s) => s.step(system, t, state, dt),
        }
    }
}

/// Fixed-step horizon and checkpoint stride for the whole-trajectory entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratorSettings {
    pub t0: f64,
    pub tf: f64,
    pub steps: usize,
    /// Forward states are stored every this many steps; the backward pass replays the rest.
    pub steps_per_checkpoint: usize,
    pub stepper: StepperKind,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            t0: 0.0,
            tf: 1.0,
            steps: 100,
            steps_per_checkpoint: 10,
            stepper: StepperKind::Rk4,
        }
    }
}

impl IntegratorSettings {
    fn validate(&self) -> Result<()> {
        if !self.t0.is_finite() || !self.tf.is_finite() {
            bail!("Integration horizon must be finite.");
        }
        if self.tf <= self.t0 {
            bail!("Final time must exceed initial time.");
        }
        if self.steps == 0 {
            bail!("Integration requires at least one step.");
        }
        if self.steps_per_checkpoint == 0 {
            bail!("steps_per_checkpoint must be at least 1.");
        }
        Ok(())
    }

    fn dt(&self) -> f64 {
        (self.tf - self.t0) / self.steps as f64
    }

    fn time_at(&self, step: usize) -> f64 {
        self.t0 + step as f64 * self.dt()
    }
}

/// Forward state stored at a step boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: usize,
    pub t: f64,
    pub x: Vec<f64>,
    pub q: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratorOutput {
    pub xf: Vec<f64>,
    pub qf: Vec<f64>,
    pub trajectory: Vec<Checkpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjointSensitivities {
    pub adj_x0: Vec<f64>,
    pub adj_p: Vec<f64>,
    pub xf: Vec<f64>,
    pub qf: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSensitivities {
    pub xf: Vec<f64>,
    pub qf: Vec<f64>,
    pub dxf: Vec<f64>,
    pub dqf: Vec<f64>,
}

/// Slot positions of the right-hand side function, resolved once.
#[derive(Debug, Clone, Copy)]
struct Layout {
    t: Option<usize>,
    x: usize,
    p: Option<usize>,
    ode: usize,
    quad: Option<usize>,
    nx: usize,
    np: usize,
    nq: usize,
}

impl Layout {
    fn resolve(function: &Function) -> Result<Self> {
        for name in function.input_names() {
            if !matches!(name.as_str(), "t" | "x" | "p") {
                bail!("Unexpected input slot `{}`; expected `t`, `x` and `p`.", name);
            }
        }
        for name in function.output_names() {
            if !matches!(name.as_str(), "ode" | "quad") {
                bail!("Unexpected output slot `{}`; expected `ode` and `quad`.", name);
            }
        }

        let x = function
            .input_index("x")
            .context("Right-hand side needs a state input named `x`.")?;
        let nx = function.input_len(x)?;
        if nx == 0 {
            bail!("State input `x` must have positive dimension.");
        }
        let t = function.input_index("t").ok();
        if let Some(slot) = t {
            if function.input_len(slot)? != 1 {
                bail!("Time input `t` must be scalar.");
            }
        }
        let p = function.input_index("p").ok();
        let np = match p {
            Some(slot) => function.input_len(slot)?,
            None => 0,
        };

        let ode = function
            .output_index("ode")
            .context("Right-hand side needs an output named `ode`.")?;
        let n_ode = function.output_len(ode)?;
        if n_ode != nx {
            bail!(
                "Output `ode` has {} entries but state `x` has {}.",
                n_ode,
                nx
            );
        }
        let quad = function.output_index("quad").ok();
        let nq = match quad {
            Some(slot) => function.output_len(slot)?,
            None => 0,
        };

        Ok(Self {
            t,
            x,
            p,
            ode,
            quad,
            nx,
            np,
            nq,
        })
    }
}

fn check_len(what: &str, values: &[f64], expected: usize) -> Result<()> {
    if values.len() != expected {
        bail!(
            "{} has {} entries, expected {}.",
            what,
            values.len(),
            expected
        );
    }
    Ok(())
}

/// Sensitivity-aware wrapper that turns a right-hand side `Function` into callbacks for a
/// black-box stepper.
///
/// The function's inputs are `t` (scalar, optional), `x` (state) and `p` (parameters,
/// optional); its outputs are `ode` (same size as `x`) and `quad` (optional quadrature
/// integrand). The stepper only ever sees `&self`, so the function sits behind a `RefCell`
/// and the adapter is `!Sync`.
#[derive(Debug)]
pub struct SensitivityIntegrator {
    function: RefCell<Function>,
    layout: Layout,
    settings: IntegratorSettings,
}

impl SensitivityIntegrator {
    pub fn new(mut function: Function, settings: IntegratorSettings) -> Result<Self> {
        settings.validate()?;
        let layout = Layout::resolve(&function)?;
        // Time is never a sensitivity direction.
        if let Some(slot) = layout.t {
            function.write_fwd_seed(slot, &[0.0]);
        }
        debug!(
            "integrator over {} nodes: nx={}, np={}, nq={}, {} steps of {:?}",
            function.node_count(),
            layout.nx,
            layout.np,
            layout.nq,
            settings.steps,
            settings.stepper
        );
        Ok(Self {
            function: RefCell::new(function),
            layout,
            settings,
        })
    }

    pub fn settings(&self) -> &IntegratorSettings {
        &self.settings
    }

    pub fn state_dim(&self) -> usize {
        self.layout.nx
    }

    pub fn param_dim(&self) -> usize {
        self.layout.np
    }

    pub fn quad_dim(&self) -> usize {
        self.layout.nq
    }

    /// One primal evaluation: `(xdot, quad_increment)`.
    pub fn rhs(&self, t: f64, x: &[f64], p: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        self.check_point(x, p)?;
        let Layout { nx, nq, .. } = self.layout;
        let mut out = vec![0.0; nx + nq];
        self.primal_into(t, x, p, &mut out);
        let quad = out.split_off(nx);
        Ok((out, quad))
    }

    /// Backward right-hand side at one time point:
    /// `(xdot, lam' df/dx + mu' dq/dx, lam' df/dp + mu' dq/dp)`.
    pub fn rhs_adjoint_step(
        &self,
        t: f64,
        x: &[f64],
        p: &[f64],
        lam: &[f64],
        mu: &[f64],
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>)> {
        self.check_point(x, p)?;
        let Layout { nx, np, nq, .. } = self.layout;
        check_len("State adjoint", lam, nx)?;
        check_len("Quadrature adjoint", mu, nq)?;

        let mut out = vec![0.0; 2 * nx + np];
        self.adjoint_into(t, x, p, lam, mu, &mut out);
        let adj_p = out.split_off(2 * nx);
        let adj_x = out.split_off(nx);
        Ok((out, adj_x, adj_p))
    }

    /// Forward sensitivity right-hand side at one time point:
    /// `(xdot, quad, df/dx x_seed + df/dp p_seed, dq/dx x_seed + dq/dp p_seed)`.
    pub fn rhs_forward_step(
        &self,
        t: f64,
        x: &[f64],
        p: &[f64],
        x_seed: &[f64],
        p_seed: &[f64],
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>)> {
        self.check_point(x, p)?;
        let Layout { nx, np, nq, .. } = self.layout;
        check_len("State seed", x_seed, nx)?;
        check_len("Parameter seed", p_seed, np)?;

        let mut out = vec![0.0; 2 * (nx + nq)];
        self.tangent_into(t, x, p, x_seed, p_seed, &mut out);
        let dq = out.split_off(2 * nx + nq);
        let dx = out.split_off(nx + nq);
        let quad = out.split_off(nx);
        Ok((out, quad, dx, dq))
    }

    /// Integrates state and quadrature over the horizon, storing a checkpoint every
    /// `steps_per_checkpoint` steps and at the final step.
    pub fn integrate(&self, x0: &[f64], p: &[f64]) -> Result<IntegratorOutput> {
        self.check_point(x0, p)?;
        let trajectory = self.forward_pass(x0, p);
        let last = trajectory
            .last()
            .context("Forward pass produced no checkpoints.")?;
        Ok(IntegratorOutput {
            xf: last.x.clone(),
            qf: last.q.clone(),
            trajectory,
        })
    }

    /// Adjoint sensitivities of `adj_xf . x(tf) + adj_qf . q(tf)` with respect to the
    /// initial state and the parameters.
    ///
    /// Integrates `lam' = -(df/dx)' lam - (dq/dx)' mu` and `nu' = -(df/dp)' lam - (dq/dp)' mu`
    /// backward from `lam(tf) = adj_xf`, `nu(tf) = 0`, with `mu = adj_qf` held constant.
    /// Each backward step restarts from the forward state replayed out of the nearest
    /// checkpoint, so both passes meet at the same step boundaries.
    pub fn rhs_adjoint(
        &self,
        x0: &[f64],
        p: &[f64],
        adj_xf: &[f64],
        adj_qf: &[f64],
    ) -> Result<AdjointSensitivities> {
        self.check_point(x0, p)?;
        let Layout { nx, np, nq, .. } = self.layout;
        check_len("Terminal state adjoint", adj_xf, nx)?;
        check_len("Terminal quadrature adjoint", adj_qf, nq)?;

        let trajectory = self.forward_pass(x0, p);
        let last = trajectory
            .last()
            .context("Forward pass produced no checkpoints.")?;
        let (xf, qf) = (last.x.clone(), last.q.clone());

        let dt = self.settings.dt();
        let system = AdjointSystem {
            integrator: self,
            p,
            mu: adj_qf,
        };
        let mut stepper = self.settings.stepper.build(2 * nx + np);
        let mut state = vec![0.0; 2 * nx + np];
        state[nx..2 * nx].copy_from_slice(adj_xf);

        for window in trajectory.windows(2).rev() {
            let (start, end) = (&window[0], &window[1]);
            let states = self.replay(start, end.step, p);
            for step in (start.step + 1..=end.step).rev() {
                state[..nx].copy_from_slice(&states[step - start.step]);
                let mut t = self.settings.time_at(step);
                stepper.step(&system, &mut t, &mut state, -dt);
            }
            trace!("adjoint reached checkpoint at t={}", start.t);
        }

        debug!("adjoint pass over {} checkpoints finished", trajectory.len());
        Ok(AdjointSensitivities {
            adj_x0: state[nx..2 * nx].to_vec(),
            adj_p: state[2 * nx..].to_vec(),
            xf,
            qf,
        })
    }

    /// Directional derivatives of `(xf, qf)` along `(x0_seed, p_seed)`, integrating the
    /// variational equations alongside the state.
    pub fn forward_sensitivity(
        &self,
        x0: &[f64],
        p: &[f64],
        x0_seed: &[f64],
        p_seed: &[f64],
    ) -> Result<ForwardSensitivities> {
        self.check_point(x0, p)?;
        let Layout { nx, np, nq, .. } = self.layout;
        check_len("Initial state seed", x0_seed, nx)?;
        check_len("Parameter seed", p_seed, np)?;

        let system = VariationalSystem {
            integrator: self,
            p,
            p_seed,
        };
        let dim = 2 * (nx + nq);
        let mut stepper = self.settings.stepper.build(dim);
        let mut state = vec![0.0; dim];
        state[..nx].copy_from_slice(x0);
        state[nx + nq..2 * nx + nq].copy_from_slice(x0_seed);

        let dt = self.settings.dt();
        for step in 0..self.settings.steps {
            let mut t = self.settings.time_at(step);
            stepper.step(&system, &mut t, &mut state, dt);
        }

        let dqf = state.split_off(2 * nx + nq);
        let dxf = state.split_off(nx + nq);
        let qf = state.split_off(nx);
        Ok(ForwardSensitivities {
            xf: state,
            qf,
            dxf,
            dqf,
        })
    }

    /// `d [xf; qf] / d x0`: state rows first, then quadrature rows. One forward sensitivity
    /// pass per state component.
    pub fn jacobian_x0(&self, x0: &[f64], p: &[f64]) -> Result<DMatrix<f64>> {
        let Layout { nx, np, .. } = self.layout;
        let p_seed = vec![0.0; np];
        self.terminal_jacobian(nx, |col| {
            let mut seed = vec![0.0; nx];
            seed[col] = 1.0;
            self.forward_sensitivity(x0, p, &seed, &p_seed)
        })
    }

    /// `d [xf; qf] / d p`, laid out like `jacobian_x0`. One pass per parameter.
    pub fn jacobian_p(&self, x0: &[f64], p: &[f64]) -> Result<DMatrix<f64>> {
        let Layout { nx, np, .. } = self.layout;
        let x0_seed = vec![0.0; nx];
        self.terminal_jacobian(np, |col| {
            let mut seed = vec![0.0; np];
            seed[col] = 1.0;
            self.forward_sensitivity(x0, p, &x0_seed, &seed)
        })
    }

    fn terminal_jacobian(
        &self,
        cols: usize,
        mut column: impl FnMut(usize) -> Result<ForwardSensitivities>,
    ) -> Result<DMatrix<f64>> {
        let Layout { nx, nq, .. } = self.layout;
        let mut jac = DMatrix::zeros(nx + nq, cols);
        for col in 0..cols {
            let sens = column(col)?;
            let rows = [sens.dxf, sens.dqf].concat();
            jac.set_column(col, &DVector::from_vec(rows));
        }
        Ok(jac)
    }

    fn check_point(&self, x: &[f64], p: &[f64]) -> Result<()> {
        check_len("State", x, self.layout.nx)?;
        check_len("Parameter vector", p, self.layout.np)
    }

    fn load(&self, function: &mut Function, t: f64, x: &[f64], p: &[f64]) {
        if let Some(slot) = self.layout.t {
            function.write_input(slot, &[t]);
        }
        function.write_input(self.layout.x, x);
        if let Some(slot) = self.layout.p {
            function.write_input(slot, p);
        }
        function.evaluate();
    }

    /// `out = [xdot | qdot]`
    fn primal_into(&self, t: f64, x: &[f64], p: &[f64], out: &mut [f64]) {
        let Layout { nx, ode, quad, .. } = self.layout;
        let mut function = self.function.borrow_mut();
        self.load(&mut function, t, x, p);
        out[..nx].copy_from_slice(function.output_at(ode));
        if let Some(slot) = quad {
            out[nx..].copy_from_slice(function.output_at(slot));
        }
    }

    /// `out = [xdot | adj_x | adj_p]`
    fn adjoint_into(&self, t: f64, x: &[f64], p: &[f64], lam: &[f64], mu: &[f64], out: &mut [f64]) {
        let layout = self.layout;
        let nx = layout.nx;
        let mut function = self.function.borrow_mut();
        self.load(&mut function, t, x, p);
        function.write_adj_seed(layout.ode, lam);
        if let Some(slot) = layout.quad {
            function.write_adj_seed(slot, mu);
        }
        function.run_adjoint();

        out[..nx].copy_from_slice(function.output_at(layout.ode));
        out[nx..2 * nx].copy_from_slice(function.adj_sens_at(layout.x));
        if let Some(slot) = layout.p {
            out[2 * nx..].copy_from_slice(function.adj_sens_at(slot));
        }
    }

    /// `out = [xdot | qdot | dxdot | dqdot]`
    fn tangent_into(&self, t: f64, x: &[f64], p: &[f64], dx: &[f64], dp: &[f64], out: &mut [f64]) {
        let layout = self.layout;
        let (nx, nq) = (layout.nx, layout.nq);
        let mut function = self.function.borrow_mut();
        self.load(&mut function, t, x, p);
        function.write_fwd_seed(layout.x, dx);
        if let Some(slot) = layout.p {
            function.write_fwd_seed(slot, dp);
        }
        function.run_forward();

        out[..nx].copy_from_slice(function.output_at(layout.ode));
        out[nx + nq..2 * nx + nq].copy_from_slice(function.fwd_sens_at(layout.ode));
        if let Some(slot) = layout.quad {
            out[nx..nx + nq].copy_from_slice(function.output_at(slot));
            out[2 * nx + nq..].copy_from_slice(function.fwd_sens_at(slot));
        }
    }

    fn forward_pass(&self, x0: &[f64], p: &[f64]) -> Vec<Checkpoint> {
        let Layout { nx, nq, .. } = self.layout;
        let settings = &self.settings;
        let system = PrimalSystem { integrator: self, p };
        let mut stepper = settings.stepper.build(nx + nq);
        let mut state = vec![0.0; nx + nq];
        state[..nx].copy_from_slice(x0);

        let checkpoint = |step: usize, state: &[f64]| Checkpoint {
            step,
            t: settings.time_at(step),
            x: state[..nx].to_vec(),
            q: state[nx..].to_vec(),
        };

        let mut trajectory = vec![checkpoint(0, &state)];
        for step in 0..settings.steps {
            let mut t = settings.time_at(step);
            stepper.step(&system, &mut t, &mut state, settings.dt());
            let done = step + 1;
            if done % settings.steps_per_checkpoint == 0 || done == settings.steps {
                trace!("checkpoint at step {} (t={})", done, settings.time_at(done));
                trajectory.push(checkpoint(done, &state));
            }
        }
        debug!(
            "forward pass: {} steps, {} checkpoints",
            settings.steps,
            trajectory.len()
        );
        trajectory
    }

    /// Re-integrates from `start` up to `end_step`, returning the state at every step
    /// boundary in between (both ends included).
    fn replay(&self, start: &Checkpoint, end_step: usize, p: &[f64]) -> Vec<Vec<f64>> {
        let Layout { nx, nq, .. } = self.layout;
        let system = PrimalSystem { integrator: self, p };
        let mut stepper = self.settings.stepper.build(nx + nq);
        let mut state = [start.x.as_slice(), start.q.as_slice()].concat();

        let mut states = Vec::with_capacity(end_step - start.step + 1);
        states.push(start.x.clone());
        for step in start.step..end_step {
            let mut t = self.settings.time_at(step);
            stepper.step(&system, &mut t, &mut state, self.settings.dt());
            states.push(state[..nx].to_vec());
        }
        states
    }
}

/// `[x | q]' = [f | q]`
struct PrimalSystem<'a> {
    integrator: &'a SensitivityIntegrator,
    p: &'a [f64],
}

impl DynamicalSystem<f64> for PrimalSystem<'_> {
    fn dimension(&self) -> usize {
        self.integrator.layout.nx + self.integrator.layout.nq
    }

    fn apply(&self, t: f64, y: &[f64], out: &mut [f64]) {
        let nx = self.integrator.layout.nx;
        self.integrator.primal_into(t, &y[..nx], self.p, out);
    }
}

/// `[x | lam | nu]' = [f | -adj_x | -adj_p]`, stepped with negative `dt`.
struct AdjointSystem<'a> {
    integrator: &'a SensitivityIntegrator,
    p: &'a [f64],
    mu: &'a [f64],
}

impl DynamicalSystem<f64> for AdjointSystem<'_> {
    fn dimension(&self) -> usize {
        2 * self.integrator.layout.nx + self.integrator.layout.np
    }

    fn apply(&self, t: f64, y: &[f64], out: &mut [f64]) {
        let nx = self.integrator.layout.nx;
        let (x, lam) = (&y[..nx], &y[nx..2 * nx]);
        self.integrator.adjoint_into(t, x, self.p, lam, self.mu, out);
        for v in &mut out[nx..] {
            *v = -*v;
        }
    }
}

/// `[x | q | dx | dq]' = [f | q | f_x dx + f_p dp | q_x dx + q_p dp]`
struct VariationalSystem<'a> {
    integrator: &'a SensitivityIntegrator,
    p: &'a [f64],
    p_seed: &'a [f64],
}

impl DynamicalSystem<f64> for VariationalSystem<'_> {
    fn dimension(&self) -> usize {
        2 * (self.integrator.layout.nx + self.integrator.layout.nq)
    }

    fn apply(&self, t: f64, y: &[f64], out: &mut [f64]) {
        let Layout { nx, nq, .. } = self.integrator.layout;
        let (x, dx) = (&y[..nx], &y[nx + nq..2 * nx + nq]);
        self.integrator
            .tangent_into(t, x, self.p, dx, self.p_seed, out);
    }
}
