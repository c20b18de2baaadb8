use crate::traits::VectorField;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The Lorenz-63 system, the standard three-variable chaotic oscillator.
///
/// ```text
/// dx/dt = sigma (y - x)
/// dy/dt = x (rho - z) - y
/// dz/dt = x y - beta z
/// ```
///
/// With the classic parameters the trace of the Jacobian is constant at
/// `-(sigma + 1 + beta)`, so the Lyapunov exponents sum to -13.666...
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Lorenz63 {
    pub sigma: f64,
    pub rho: f64,
    pub beta: f64,
}

impl Default for Lorenz63 {
    fn default() -> Self {
        Self {
            sigma: 10.0,
            rho: 28.0,
            beta: 8.0 / 3.0,
        }
    }
}

impl VectorField for Lorenz63 {
    fn dimension(&self) -> usize {
        3
    }

    fn rhs(&self, state: &DVector<f64>, out: &mut DVector<f64>) {
        let (x, y, z) = (state[0], state[1], state[2]);
        out[0] = self.sigma * (y - x);
        out[1] = x * (self.rho - z) - y;
        out[2] = x * y - self.beta * z;
    }

    fn jacobian(&self, state: &DVector<f64>, out: &mut DMatrix<f64>) {
        let (x, y, z) = (state[0], state[1], state[2]);
        out[(0, 0)] = -self.sigma;
        out[(0, 1)] = self.sigma;
        out[(0, 2)] = 0.0;
        out[(1, 0)] = self.rho - z;
        out[(1, 1)] = -1.0;
        out[(1, 2)] = -x;
        out[(2, 0)] = y;
        out[(2, 1)] = x;
        out[(2, 2)] = -self.beta;
    }

    fn parameters(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("sigma".to_owned(), self.sigma),
            ("rho".to_owned(), self.rho),
            ("beta".to_owned(), self.beta),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::Lorenz63;
    use crate::traits::VectorField;
    use nalgebra::{DMatrix, DVector};

    #[test]
    fn jacobian_matches_finite_differences() {
        let field = Lorenz63::default();
        let state = DVector::from_column_slice(&[1.3, -2.1, 17.0]);
        let mut jacobian = DMatrix::zeros(3, 3);
        field.jacobian(&state, &mut jacobian);

        let h = 1e-7;
        let mut base = DVector::zeros(3);
        field.rhs(&state, &mut base);
        for j in 0..3 {
            let mut bumped = state.clone();
            bumped[j] += h;
            let mut out = DVector::zeros(3);
            field.rhs(&bumped, &mut out);
            for i in 0..3 {
                let fd = (out[i] - base[i]) / h;
                assert!(
                    (jacobian[(i, j)] - fd).abs() < 1e-5,
                    "J[{i},{j}] = {} vs fd {}",
                    jacobian[(i, j)],
                    fd
                );
            }
        }
    }

    #[test]
    fn trace_is_constant() {
        let field = Lorenz63::default();
        let mut jacobian = DMatrix::zeros(3, 3);
        field.jacobian(&DVector::from_column_slice(&[0.3, 9.0, -4.0]), &mut jacobian);
        let trace = jacobian.trace();
        assert!((trace + (field.sigma + 1.0 + field.beta)).abs() < 1e-12);
    }
}
