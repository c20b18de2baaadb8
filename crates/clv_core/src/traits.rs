use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

/// A continuous-time dynamical system supplied by the caller as a pure
/// right-hand side together with its analytic Jacobian.
///
/// Parameters live on the implementing struct as immutable values and are
/// surfaced through [`VectorField::parameters`] so every emitted record can
/// carry them as metadata.
pub trait VectorField {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates d(state)/dt at `state` into `out`.
    fn rhs(&self, state: &DVector<f64>, out: &mut DVector<f64>);

    /// Evaluates the Jacobian of the right-hand side at `state` into `out`.
    fn jacobian(&self, state: &DVector<f64>, out: &mut DMatrix<f64>);

    /// Named parameters recorded on observation and result containers.
    fn parameters(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// The solver-facing view of a system: a first-order ODE over a flat state
/// vector. The tangent integrator implements this for the augmented
/// trajectory + perturbation flow.
pub trait OdeSystem {
    /// Returns the dimension of the flat state vector.
    fn dimension(&self) -> usize;

    /// Evaluates the time derivative of `x` at time `t` into `out`.
    fn apply(&self, t: f64, x: &DVector<f64>, out: &mut DVector<f64>);
}
