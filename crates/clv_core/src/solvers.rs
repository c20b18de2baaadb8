use crate::traits::OdeSystem;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the step solver. Every variant is fatal for the current run:
/// a trajectory that stopped satisfying the tolerances poisons every
/// downstream QR step, so these must propagate.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("integration duration must be positive, got {duration}")]
    InvalidDuration { duration: f64 },
    #[error("step size underflowed to {step:.3e} at t = {time:.6}")]
    StepSizeUnderflow { time: f64, step: f64 },
    #[error("step budget of {max_steps} exhausted at t = {time:.6} before reaching t = {target:.6}")]
    StepBudgetExceeded {
        time: f64,
        target: f64,
        max_steps: usize,
    },
    #[error("state became non-finite at t = {time:.6}")]
    NonFinite { time: f64 },
}

/// Integration method tag. `Rk45` is the adaptive Dormand-Prince 5(4) pair
/// and the default; `Rk4` is the classic fixed-step fourth-order method.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub enum Method {
    #[default]
    Rk45,
    Rk4,
}

/// Local error control and step budget for the solver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverSettings {
    pub rtol: f64,
    pub atol: f64,
    /// Initial trial step for `Rk45`; fixed step hint for `Rk4`.
    pub initial_step: f64,
    /// Maximum number of attempted steps per `integrate` call.
    pub max_steps: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-10,
            initial_step: 1e-3,
            max_steps: 100_000,
        }
    }
}

/// Advances `state` from `t0` to `t0 + duration` under `system`.
pub fn integrate(
    system: &impl OdeSystem,
    method: Method,
    settings: &SolverSettings,
    t0: f64,
    duration: f64,
    state: &mut DVector<f64>,
) -> Result<(), SolverError> {
    if !(duration > 0.0) {
        return Err(SolverError::InvalidDuration { duration });
    }
    match method {
        Method::Rk45 => Dopri54::new(system.dimension()).integrate(system, settings, t0, duration, state),
        Method::Rk4 => Rk4::new(system.dimension()).integrate(system, settings, t0, duration, state),
    }
}

/// Dormand-Prince 5(4) embedded pair with per-component
/// `atol + rtol * |y|` weighting and safety-factor step control.
pub struct Dopri54 {
    k1: DVector<f64>,
    k2: DVector<f64>,
    k3: DVector<f64>,
    k4: DVector<f64>,
    k5: DVector<f64>,
    k6: DVector<f64>,
    k7: DVector<f64>,
    tmp: DVector<f64>,
    y_next: DVector<f64>,
}

impl Dopri54 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: DVector::zeros(dim),
            k2: DVector::zeros(dim),
            k3: DVector::zeros(dim),
            k4: DVector::zeros(dim),
            k5: DVector::zeros(dim),
            k6: DVector::zeros(dim),
            k7: DVector::zeros(dim),
            tmp: DVector::zeros(dim),
            y_next: DVector::zeros(dim),
        }
    }

    pub fn integrate(
        &mut self,
        system: &impl OdeSystem,
        settings: &SolverSettings,
        t0: f64,
        duration: f64,
        state: &mut DVector<f64>,
    ) -> Result<(), SolverError> {
        // Dormand-Prince coefficients.
        let c2 = 0.2;
        let c3 = 0.3;
        let c4 = 0.8;
        let c5 = 8.0 / 9.0;

        let a21 = 0.2;

        let a31 = 3.0 / 40.0;
        let a32 = 9.0 / 40.0;

        let a41 = 44.0 / 45.0;
        let a42 = -56.0 / 15.0;
        let a43 = 32.0 / 9.0;

        let a51 = 19372.0 / 6561.0;
        let a52 = -25360.0 / 2187.0;
        let a53 = 64448.0 / 6561.0;
        let a54 = -212.0 / 729.0;

        let a61 = 9017.0 / 3168.0;
        let a62 = -355.0 / 33.0;
        let a63 = 46732.0 / 5247.0;
        let a64 = 49.0 / 176.0;
        let a65 = -5103.0 / 18656.0;

        // 5th-order solution weights (b2 = 0).
        let b1 = 35.0 / 384.0;
        let b3 = 500.0 / 1113.0;
        let b4 = 125.0 / 192.0;
        let b5 = -2187.0 / 6784.0;
        let b6 = 11.0 / 84.0;

        // Difference between the 5th- and embedded 4th-order weights.
        let e1 = 71.0 / 57600.0;
        let e3 = -71.0 / 16695.0;
        let e4 = 71.0 / 1920.0;
        let e5 = -17253.0 / 339200.0;
        let e6 = 22.0 / 525.0;
        let e7 = -1.0 / 40.0;

        let dim = state.len();
        let t_end = t0 + duration;
        let mut t = t0;
        let mut h = settings.initial_step.min(duration).max(f64::MIN_POSITIVE);
        let mut attempted = 0usize;

        while t < t_end {
            if attempted >= settings.max_steps {
                return Err(SolverError::StepBudgetExceeded {
                    time: t,
                    target: t_end,
                    max_steps: settings.max_steps,
                });
            }
            let min_step = 16.0 * f64::EPSILON * t.abs().max(1.0);
            // The final clamped step may be arbitrarily short; underflow only
            // matters while the controller still owns the step size.
            let last = t + h >= t_end;
            if last {
                h = t_end - t;
            } else if h < min_step {
                return Err(SolverError::StepSizeUnderflow { time: t, step: h });
            }
            attempted += 1;

            system.apply(t, state, &mut self.k1);

            for i in 0..dim {
                self.tmp[i] = state[i] + h * a21 * self.k1[i];
            }
            system.apply(t + c2 * h, &self.tmp, &mut self.k2);

            for i in 0..dim {
                self.tmp[i] = state[i] + h * (a31 * self.k1[i] + a32 * self.k2[i]);
            }
            system.apply(t + c3 * h, &self.tmp, &mut self.k3);

            for i in 0..dim {
                self.tmp[i] =
                    state[i] + h * (a41 * self.k1[i] + a42 * self.k2[i] + a43 * self.k3[i]);
            }
            system.apply(t + c4 * h, &self.tmp, &mut self.k4);

            for i in 0..dim {
                self.tmp[i] = state[i]
                    + h * (a51 * self.k1[i]
                        + a52 * self.k2[i]
                        + a53 * self.k3[i]
                        + a54 * self.k4[i]);
            }
            system.apply(t + c5 * h, &self.tmp, &mut self.k5);

            for i in 0..dim {
                self.tmp[i] = state[i]
                    + h * (a61 * self.k1[i]
                        + a62 * self.k2[i]
                        + a63 * self.k3[i]
                        + a64 * self.k4[i]
                        + a65 * self.k5[i]);
            }
            system.apply(t + h, &self.tmp, &mut self.k6);

            for i in 0..dim {
                self.y_next[i] = state[i]
                    + h * (b1 * self.k1[i]
                        + b3 * self.k3[i]
                        + b4 * self.k4[i]
                        + b5 * self.k5[i]
                        + b6 * self.k6[i]);
            }
            system.apply(t + h, &self.y_next, &mut self.k7);

            // Weighted RMS of the embedded error estimate.
            let mut err = 0.0;
            for i in 0..dim {
                let e = h
                    * (e1 * self.k1[i]
                        + e3 * self.k3[i]
                        + e4 * self.k4[i]
                        + e5 * self.k5[i]
                        + e6 * self.k6[i]
                        + e7 * self.k7[i]);
                let sk = settings.atol + settings.rtol * state[i].abs().max(self.y_next[i].abs());
                err += (e / sk) * (e / sk);
            }
            err = (err / dim as f64).sqrt();

            if err.is_finite() && err <= 1.0 {
                t += h;
                state.copy_from(&self.y_next);
                if state.iter().any(|v| !v.is_finite()) {
                    return Err(SolverError::NonFinite { time: t });
                }
                if last {
                    break;
                }
                let factor = (0.9 * err.max(1e-10).powf(-0.2)).clamp(0.2, 5.0);
                h *= factor;
            } else {
                let factor = if err.is_finite() {
                    (0.9 * err.powf(-0.2)).clamp(0.2, 1.0)
                } else {
                    0.2
                };
                h *= factor;
            }
        }

        Ok(())
    }
}

/// Classic Runge-Kutta 4th order, fixed step.
pub struct Rk4 {
    k1: DVector<f64>,
    k2: DVector<f64>,
    k3: DVector<f64>,
    k4: DVector<f64>,
    tmp: DVector<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: DVector::zeros(dim),
            k2: DVector::zeros(dim),
            k3: DVector::zeros(dim),
            k4: DVector::zeros(dim),
            tmp: DVector::zeros(dim),
        }
    }

    pub fn integrate(
        &mut self,
        system: &impl OdeSystem,
        settings: &SolverSettings,
        t0: f64,
        duration: f64,
        state: &mut DVector<f64>,
    ) -> Result<(), SolverError> {
        let hint = settings.initial_step.max(f64::MIN_POSITIVE);
        let n_steps = ((duration / hint).ceil() as usize).max(1);
        if n_steps > settings.max_steps {
            return Err(SolverError::StepBudgetExceeded {
                time: t0,
                target: t0 + duration,
                max_steps: settings.max_steps,
            });
        }
        let h = duration / n_steps as f64;
        let dim = state.len();
        let mut t = t0;

        for _ in 0..n_steps {
            system.apply(t, state, &mut self.k1);

            for i in 0..dim {
                self.tmp[i] = state[i] + 0.5 * h * self.k1[i];
            }
            system.apply(t + 0.5 * h, &self.tmp, &mut self.k2);

            for i in 0..dim {
                self.tmp[i] = state[i] + 0.5 * h * self.k2[i];
            }
            system.apply(t + 0.5 * h, &self.tmp, &mut self.k3);

            for i in 0..dim {
                self.tmp[i] = state[i] + h * self.k3[i];
            }
            system.apply(t + h, &self.tmp, &mut self.k4);

            for i in 0..dim {
                state[i] += h / 6.0
                    * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
            }
            t += h;
        }

        if state.iter().any(|v| !v.is_finite()) {
            return Err(SolverError::NonFinite { time: t });
        }
        Ok(())
    }
}
