use crate::solvers::{Method, SolverError, SolverSettings};
use crate::tangent::TangentIntegrator;
use crate::traits::VectorField;
use anyhow::{bail, Result};
use nalgebra::linalg::QR;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

/// QR decomposition with the convention that `diag(R)` is non-negative.
///
/// When a raw diagonal entry of `R` is negative, the corresponding column of
/// `Q` and row of `R` are sign-flipped. The product `Q * R` is unchanged.
pub fn pos_qr(m: &DMatrix<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
    let dim = m.nrows();
    let qr = QR::new(m.clone());
    let (mut q, mut r) = qr.unpack();
    for i in 0..dim {
        if r[(i, i)] < 0.0 {
            for row in 0..dim {
                q[(row, i)] = -q[(row, i)];
            }
            for col in i..dim {
                r[(i, col)] = -r[(i, col)];
            }
        }
    }
    (q, r)
}

/// Forward Gram-Schmidt stepper: integrates a full perturbation basis over
/// one renormalization interval `tau` at a time, one column per replay of the
/// same base trajectory, and re-orthonormalizes via [`pos_qr`].
///
/// Column `i` of `Q` corresponds to Lyapunov index `i` throughout a run.
pub struct BennetinStepper<F: VectorField> {
    integrator: TangentIntegrator<F>,
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    tau: f64,
    ndim: usize,
}

impl<F: VectorField> BennetinStepper<F> {
    pub fn new(
        field: F,
        trajectory_ic: DVector<f64>,
        q_ic: DMatrix<f64>,
        tau: f64,
        method: Method,
        settings: SolverSettings,
    ) -> Result<Self> {
        let ndim = field.dimension();
        if tau <= 0.0 {
            bail!("Renormalization interval tau must be positive, got {tau}.");
        }
        if q_ic.nrows() != ndim || q_ic.ncols() != ndim {
            bail!(
                "Basis dimension mismatch. Expected {ndim}x{ndim}, got {}x{}.",
                q_ic.nrows(),
                q_ic.ncols()
            );
        }
        let perturbation_ic = q_ic.column(0).into_owned();
        let integrator =
            TangentIntegrator::new(field, trajectory_ic, perturbation_ic, method, settings)?;
        Ok(Self {
            integrator,
            q: q_ic,
            r: DMatrix::zeros(ndim, ndim),
            tau,
            ndim,
        })
    }

    /// One Bennetin step: replay the same base state once per basis column,
    /// integrate each column forward by `tau`, then QR-decompose the
    /// stretched matrix. Advances the stepper's time by exactly `tau`.
    pub fn step(&mut self) -> Result<(), SolverError> {
        let n = self.ndim;
        let base_time = self.integrator.time();
        let base_trajectory = self.integrator.trajectory().clone();
        let mut p = DMatrix::zeros(n, n);

        for i in 0..n {
            self.integrator.set_time(base_time);
            self.integrator.set_trajectory(&base_trajectory);
            let column = self.q.column(i).into_owned();
            self.integrator.set_perturbation(&column);
            self.integrator.run(self.tau)?;
            p.set_column(i, self.integrator.perturbation());
        }
        // The endpoint trajectory only depends on the trajectory equation, so
        // every replay lands on the same point; the final commit stands.

        let (q, r) = pos_qr(&p);
        self.q = q;
        self.r = r;
        Ok(())
    }

    /// Runs `n` steps back to back. Used for transient burn-in.
    pub fn many_steps(&mut self, n: usize) -> Result<(), SolverError> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Finite-time backward Lyapunov exponents of the last step,
    /// `ln(diag R) / tau`, indexed by Lyapunov index.
    pub fn ftble(&self) -> DVector<f64> {
        self.r.diagonal().map(|d| d.ln() / self.tau)
    }

    /// Zeroes the clock, e.g. after a transient, so stored time coordinates
    /// start at zero.
    pub fn reset_time(&mut self) {
        self.integrator.set_time(0.0);
    }

    pub fn q(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn time(&self) -> f64 {
        self.integrator.time()
    }

    pub fn trajectory(&self) -> &DVector<f64> {
        self.integrator.trajectory()
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn parameters(&self) -> BTreeMap<String, f64> {
        self.integrator.parameters()
    }
}
