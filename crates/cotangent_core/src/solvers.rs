use crate::traits::{DynamicalSystem, Scalar, Steppable};

/// Explicit Euler: y_next = y + dt * f(t, y)
pub struct Euler<T: Scalar> {
    k: Vec<T>,
}

impl<T: Scalar> Euler<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Euler<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        system.apply(*t, state, &mut self.k);
        for (y, &k) in state.iter_mut().zip(&self.k) {
            *y = *y + dt * k;
        }
        *t = *t + dt;
    }
}

/// `out = y + h * k`, entry by entry.
fn offset<T: Scalar>(out: &mut [T], y: &[T], h: T, k: &[T]) {
    for ((o, &y), &k) in out.iter_mut().zip(y).zip(k) {
        *o = y + h * k;
    }
}

/// Classic fourth-order Runge-Kutta with fixed step.
///
/// Stage slopes are kept between calls so a step allocates nothing.
pub struct RK4<T: Scalar> {
    slopes: [Vec<T>; 4],
    stage: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            slopes: std::array::from_fn(|_| vec![T::zero(); dim]),
            stage: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(&mut self, system: &impl DynamicalSystem<T>, t: &mut T, state: &mut [T], dt: T) {
        let two = T::one() + T::one();
        let half_dt = dt / two;
        let t0 = *t;
        let [k1, k2, k3, k4] = &mut self.slopes;
        let stage = &mut self.stage;

        system.apply(t0, state, k1);
        offset(stage, state, half_dt, k1);
        system.apply(t0 + half_dt, stage, k2);
        offset(stage, state, half_dt, k2);
        system.apply(t0 + half_dt, stage, k3);
        offset(stage, state, dt, k3);
        system.apply(t0 + dt, stage, k4);

        // Simpson weights 1, 2, 2, 1 over six.
        let w = dt / (two + two + two);
        for i in 0..state.len() {
            state[i] = state[i] + w * (k1[i] + two * (k2[i] + k3[i]) + k4[i]);
        }
        *t = t0 + dt;
    }
}
