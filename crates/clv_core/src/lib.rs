//! The `clv_core` crate computes Lyapunov exponents and Lyapunov vectors for
//! continuous-time dynamical systems supplied as a right-hand side plus an
//! analytic Jacobian.
//!
//! Key components:
//! - **Traits**: `VectorField` (user systems), `OdeSystem` (solver-facing view).
//! - **Solvers**: adaptive Dormand-Prince 5(4) and fixed-step RK4 integrators.
//! - **Tangent**: joint trajectory/perturbation integration under the linearized flow.
//! - **Bennetin**: the QR-based stepper producing backward Lyapunov vectors and FTBLEs.
//! - **Observers**: bounded-memory recording of (time, Q, R, trajectory) series in blocks.
//! - **Ginelli**: the forward/backward pipeline producing covariant Lyapunov vectors
//!   and FTCLEs from block-persisted Bennetin data.

pub mod bennetin;
pub mod ginelli;
pub mod models;
pub mod observer;
pub mod solvers;
pub mod storage;
pub mod tangent;
pub mod traits;
