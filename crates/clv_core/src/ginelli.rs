use crate::bennetin::BennetinStepper;
use crate::observer::BennetinObserver;
use crate::solvers::{Method, SolverSettings};
use crate::storage::{self, BennetinRecord, ClvRecord};
use crate::traits::VectorField;
use anyhow::{bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Failures specific to the backward passes.
#[derive(Debug, Error)]
pub enum GinelliError {
    #[error(
        "stretching matrix R is singular at t = {time:.6}; \
         the basis is degenerate or insufficiently converged \
         (blv_transient_len / clv_transient_steps too small)"
    )]
    SingularStretching { time: f64 },
}

/// Knobs of the CLV computation. `tau` and the transient lengths are
/// caller-supplied; nothing here is adapted automatically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GinelliSettings {
    /// Renormalization interval; each Bennetin step spans exactly `tau`.
    pub tau: f64,
    /// Steps run before observations begin, letting Q converge to the
    /// backward Lyapunov basis.
    pub blv_transient_len: usize,
    /// Steps past the observation window used to converge the coefficient
    /// matrix A on the way back.
    pub clv_transient_steps: usize,
    /// Steps over which CLVs are reported.
    pub clv_observation_steps: usize,
    /// Observations per persisted block; bounds peak memory.
    pub block_size: usize,
    /// Include the backward Lyapunov vectors in the result blocks.
    pub save_blv: bool,
    /// Include the finite-time backward exponents in the result blocks.
    pub save_ftble: bool,
    pub method: Method,
    pub solver: SolverSettings,
}

impl Default for GinelliSettings {
    fn default() -> Self {
        Self {
            tau: 0.1,
            blv_transient_len: 1000,
            clv_transient_steps: 1000,
            clv_observation_steps: 100,
            block_size: 100,
            save_blv: false,
            save_ftble: false,
            method: Method::Rk45,
            solver: SolverSettings::default(),
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct ClvSummary {
    pub dimension: usize,
    pub observation_steps: usize,
    pub blocks_written: usize,
    pub output_dir: PathBuf,
}

/// Pushes the coefficient matrix one step backward: solves `R . A_new = A`
/// and rescales every column of `A_new` to unit 2-norm. Returns the new
/// matrix together with the pre-normalization column norms.
pub fn push_backward(
    r: &DMatrix<f64>,
    a: &DMatrix<f64>,
    time: f64,
) -> Result<(DMatrix<f64>, DVector<f64>), GinelliError> {
    let mut pushed = r
        .solve_upper_triangular(a)
        .ok_or(GinelliError::SingularStretching { time })?;
    let n = pushed.ncols();
    let mut norms = DVector::zeros(n);
    for j in 0..n {
        let norm = pushed.column(j).norm();
        if norm <= f64::EPSILON {
            return Err(GinelliError::SingularStretching { time });
        }
        norms[j] = norm;
        pushed.column_mut(j).unscale_mut(norm);
    }
    Ok((pushed, norms))
}

/// Computes covariant Lyapunov vectors via the Ginelli forward/backward
/// procedure.
///
/// Stages, each a hard barrier for the next:
/// 1. BLV transient (`blv_transient_len` discarded steps, clock reset to 0).
/// 2. Forward observation pass: Q and R stored in blocks under
///    `work_dir/observation`.
/// 3. Forward convergence pass: R only, under `work_dir/convergence`.
/// 4. Backward convergence: A pushed from identity through the convergence
///    blocks in reverse, output discarded.
/// 5. Backward observation: CLVs, FTCLEs (and optionally BLVs, FTBLEs)
///    emitted per block to `output_dir` in chronological order.
/// 6. Cleanup: `work_dir` is removed, on success only. A failed run leaves
///    its intermediate blocks on disk for inspection.
pub fn compute_clvs<F: VectorField>(
    field: F,
    initial_state: DVector<f64>,
    work_dir: &Path,
    output_dir: &Path,
    settings: &GinelliSettings,
) -> Result<ClvSummary> {
    let ndim = field.dimension();
    if ndim == 0 {
        bail!("System must have positive dimension.");
    }
    if initial_state.len() != ndim {
        bail!(
            "Initial condition dimension mismatch. Expected {ndim}, got {}.",
            initial_state.len()
        );
    }
    if settings.clv_observation_steps == 0 {
        bail!("clv_observation_steps must be at least 1.");
    }
    if settings.block_size == 0 {
        bail!("block_size must be at least 1.");
    }
    // Nesting either way is as fatal as equality: the work dir is removed on
    // success, and removing it must never take the results with it.
    if output_dir.starts_with(work_dir) || work_dir.starts_with(output_dir) {
        bail!("Intermediate storage and output location must not coincide or nest.");
    }

    let q_ic = DMatrix::identity(ndim, ndim) * 1.0e-6;
    let mut stepper = BennetinStepper::new(
        field,
        initial_state,
        q_ic,
        settings.tau,
        settings.method,
        settings.solver,
    )?;

    info!(
        steps = settings.blv_transient_len,
        tau = settings.tau,
        "running backward-basis transient"
    );
    stepper
        .many_steps(settings.blv_transient_len)
        .context("backward-basis transient failed")?;
    stepper.reset_time();

    let observation_dir = work_dir.join("observation");
    let convergence_dir = work_dir.join("convergence");

    let mut observer = BennetinObserver::new(&mut stepper);
    info!(
        steps = settings.clv_observation_steps,
        block_size = settings.block_size,
        "forward observation pass"
    );
    observer
        .make_observations_in_blocks(
            &observation_dir,
            settings.clv_observation_steps,
            settings.block_size,
        )
        .context("forward observation pass failed")?;

    observer.store_q = false;
    info!(
        steps = settings.clv_transient_steps,
        "forward convergence pass"
    );
    observer
        .make_observations_in_blocks(
            &convergence_dir,
            settings.clv_transient_steps,
            settings.block_size,
        )
        .context("forward convergence pass failed")?;
    drop(observer);

    // Backward convergence: A converges to the correct coefficient subspace
    // regardless of its initial value, given enough backward steps. Nothing
    // is emitted here.
    info!("backward convergence pass");
    let mut a = DMatrix::identity(ndim, ndim);
    for (index, path) in storage::list_blocks_descending(&convergence_dir)
        .context("discovering convergence blocks")?
    {
        let record: BennetinRecord =
            storage::read_record(&path).with_context(|| format!("reading convergence block {index}"))?;
        debug!(block = index, rows = record.len(), "pushing A through convergence block");
        for step in (0..record.len()).rev() {
            let r = record
                .r_at(step)
                .context("convergence block is missing its R series")?;
            let (next, _norms) = push_backward(&r, &a, record.times[step])
                .with_context(|| format!("backward push failed in convergence block {index}"))?;
            a = next;
        }
    }

    // Backward observation: emit CLVs and FTCLEs per block, reassembled in
    // forward chronological order. Source blocks are never mutated.
    info!("backward observation pass");
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
    let mut blocks_written = 0usize;
    for (index, path) in storage::list_blocks_descending(&observation_dir)
        .context("discovering observation blocks")?
    {
        let record: BennetinRecord =
            storage::read_record(&path).with_context(|| format!("reading observation block {index}"))?;
        let rows = record.len();
        debug!(block = index, rows, "computing CLVs for observation block");

        let mut clv_rev: Vec<DMatrix<f64>> = Vec::with_capacity(rows);
        let mut ftcle_rev: Vec<DVector<f64>> = Vec::with_capacity(rows);
        let mut blv_rev: Vec<DMatrix<f64>> = Vec::new();
        let mut ftble_rev: Vec<DVector<f64>> = Vec::new();

        for step in (0..rows).rev() {
            let q = record
                .q_at(step)
                .context("observation block is missing its Q series")?;
            let r = record
                .r_at(step)
                .context("observation block is missing its R series")?;
            let time = record.times[step];

            // Covariant vectors in the original basis, before the push.
            clv_rev.push(&q * &a);

            let (next, norms) = push_backward(&r, &a, time)
                .with_context(|| format!("backward push failed in observation block {index}"))?;
            a = next;

            // Computed walking backward, reported for forward time.
            ftcle_rev.push(norms.map(|v| -v.ln() / settings.tau));

            if settings.save_blv {
                blv_rev.push(q);
            }
            if settings.save_ftble {
                ftble_rev.push(r.diagonal().map(|d| d.ln() / settings.tau));
            }
        }

        let mut clv = Vec::with_capacity(rows * ndim * ndim);
        for m in clv_rev.iter().rev() {
            storage::flatten_matrix(&mut clv, m);
        }
        let mut ftcle = Vec::with_capacity(rows * ndim);
        for v in ftcle_rev.iter().rev() {
            ftcle.extend(v.iter());
        }
        let blv = settings.save_blv.then(|| {
            let mut flat = Vec::with_capacity(rows * ndim * ndim);
            for m in blv_rev.iter().rev() {
                storage::flatten_matrix(&mut flat, m);
            }
            flat
        });
        let ftble = settings.save_ftble.then(|| {
            let mut flat = Vec::with_capacity(rows * ndim);
            for v in ftble_rev.iter().rev() {
                flat.extend(v.iter());
            }
            flat
        });

        let result = ClvRecord {
            ndim,
            times: record.times.clone(),
            parameters: record.parameters.clone(),
            clv,
            ftcle,
            blv,
            ftble,
            trajectory: record.trajectory.clone(),
        };
        let out_path = storage::block_path(output_dir, index);
        storage::write_record(&out_path, &result)
            .with_context(|| format!("writing result block {index}"))?;
        blocks_written += 1;
    }

    storage::remove_store(work_dir).context("failed to remove intermediate block storage")?;
    info!(
        blocks = blocks_written,
        output = %output_dir.display(),
        "covariant Lyapunov vectors written"
    );

    Ok(ClvSummary {
        dimension: ndim,
        observation_steps: settings.clv_observation_steps,
        blocks_written,
        output_dir: output_dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::{compute_clvs, push_backward, GinelliError, GinelliSettings};
    use crate::models::Lorenz63;
    use crate::solvers::SolverSettings;
    use crate::storage::{self, ClvRecord};
    use crate::tangent::tests::LinearField;
    use nalgebra::{DMatrix, DVector};
    use tempfile::TempDir;

    #[test]
    fn push_backward_with_identity_r_only_normalizes() {
        let r = DMatrix::identity(3, 3);
        let a = DMatrix::identity(3, 3) * 2.0;
        let (next, norms) = push_backward(&r, &a, 0.0).unwrap();
        assert!((next - DMatrix::identity(3, 3)).norm() < 1e-12);
        for j in 0..3 {
            assert!((norms[j] - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn push_backward_surfaces_singular_r() {
        let mut r = DMatrix::identity(3, 3);
        r[(1, 1)] = 0.0;
        let a = DMatrix::identity(3, 3);
        let err = push_backward(&r, &a, 4.2).unwrap_err();
        assert!(matches!(err, GinelliError::SingularStretching { .. }));
    }

    #[test]
    fn backward_convergence_forgets_initial_coefficients() {
        // Fixed stretching matrix with well-separated positive diagonal;
        // repeated backward pushes drive any upper-triangular start onto the
        // same coefficient directions, up to sign.
        let r = DMatrix::from_row_slice(
            3,
            3,
            &[2.0, 0.4, -0.1, 0.0, 1.0, 0.3, 0.0, 0.0, 0.5],
        );
        let mut a1 = DMatrix::identity(3, 3);
        let mut a2 = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.7, -0.2, 0.0, 0.9, 0.4, 0.0, 0.0, 1.3],
        );
        for _ in 0..200 {
            a1 = push_backward(&r, &a1, 0.0).unwrap().0;
            a2 = push_backward(&r, &a2, 0.0).unwrap().0;
        }
        for j in 0..3 {
            let dot: f64 = a1.column(j).dot(&a2.column(j));
            assert!(
                (dot.abs() - 1.0).abs() < 1e-9,
                "column {j} directions disagree: |dot| = {}",
                dot.abs()
            );
            assert!((a1.column(j).norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn end_to_end_linear_system_recovers_rates() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let rates = [0.5, -0.3, -1.0];
        let tmp = TempDir::new().unwrap();
        let work_dir = tmp.path().join("work");
        let output_dir = tmp.path().join("results");
        let settings = GinelliSettings {
            tau: 0.1,
            blv_transient_len: 50,
            clv_transient_steps: 50,
            clv_observation_steps: 100,
            block_size: 100,
            save_blv: true,
            save_ftble: true,
            ..GinelliSettings::default()
        };

        let summary = compute_clvs(
            LinearField {
                rates: rates.to_vec(),
            },
            DVector::from_element(3, 1.0),
            &work_dir,
            &output_dir,
            &settings,
        )
        .unwrap();

        assert_eq!(summary.dimension, 3);
        assert_eq!(summary.blocks_written, 1);
        // Intermediate storage is gone after a successful run.
        assert!(!work_dir.exists());

        let blocks = storage::list_blocks(&output_dir).unwrap();
        assert_eq!(blocks.len(), 1);
        let record: ClvRecord = storage::read_record(&blocks[0].1).unwrap();

        // One full block plus the shared initial observation.
        assert_eq!(record.len(), 101);
        assert_eq!(record.times[0], 0.0);
        assert!((record.times[100] - 10.0).abs() < 1e-9);
        assert_eq!(record.clv.len(), 101 * 9);
        assert_eq!(record.ftcle.len(), 101 * 3);
        assert_eq!(record.blv.as_ref().unwrap().len(), 101 * 9);
        assert_eq!(record.ftble.as_ref().unwrap().len(), 101 * 3);
        assert_eq!(record.trajectory.len(), 101 * 3);

        // For a decoupled diagonal system the CLVs are the coordinate axes
        // and every finite-time exponent equals its rate.
        for step in 0..record.len() {
            let ftcle = record.ftcle_at(step);
            let clv = record.clv_at(step);
            for (i, rate) in rates.iter().enumerate() {
                assert!(
                    (ftcle[i] - rate).abs() < 1e-5,
                    "step {step} le_index {i}: ftcle {} vs rate {}",
                    ftcle[i],
                    rate
                );
                assert!((clv[(i, i)].abs() - 1.0).abs() < 1e-8);
            }
        }
        let ftble = record.ftble.as_ref().unwrap();
        for (i, rate) in rates.iter().enumerate() {
            // Skip the first row: its R is left over from the transient seed.
            assert!((ftble[3 + i] - rate).abs() < 1e-5);
        }
    }

    #[test]
    fn lorenz_exponent_sums_match_the_trace() {
        let field = Lorenz63::default();
        let expected_sum = -(field.sigma + 1.0 + field.beta);
        let tmp = TempDir::new().unwrap();
        let work_dir = tmp.path().join("work");
        let output_dir = tmp.path().join("results");
        let settings = GinelliSettings {
            tau: 0.1,
            blv_transient_len: 100,
            clv_transient_steps: 100,
            clv_observation_steps: 100,
            block_size: 30,
            save_blv: false,
            save_ftble: true,
            ..GinelliSettings::default()
        };

        let summary = compute_clvs(
            field,
            DVector::from_column_slice(&[1.0, 1.0, 1.0]),
            &work_dir,
            &output_dir,
            &settings,
        )
        .unwrap();
        // 100 / 30 = 3 full blocks + 1 remainder block.
        assert_eq!(summary.blocks_written, 4);

        let blocks = storage::list_blocks(&output_dir).unwrap();
        let mut ftcle_sum_accum = 0.0;
        let mut rows_total = 0usize;
        for (index, path) in &blocks {
            let record: ClvRecord = storage::read_record(path).unwrap();
            let ftble = record.ftble.as_ref().unwrap();
            for step in 0..record.len() {
                // The instantaneous FTBLE sum equals the (constant) trace of
                // the Lorenz Jacobian at every step.
                if !(*index == 0 && step == 0) {
                    let sum: f64 = ftble[step * 3..(step + 1) * 3].iter().sum();
                    assert!(
                        (sum - expected_sum).abs() < 1e-4,
                        "block {index} step {step}: FTBLE sum {sum} vs {expected_sum}"
                    );
                }
                ftcle_sum_accum += record.ftcle_at(step).sum();
                rows_total += 1;
            }
        }
        // FTCLE sums only match the trace on time average.
        let mean = ftcle_sum_accum / rows_total as f64;
        assert!(
            (mean - expected_sum).abs() < 1.5,
            "mean FTCLE sum {mean} vs {expected_sum}"
        );

        assert!(!work_dir.exists());
        assert_eq!(blocks.len(), 4);
        // Remainder block: 100 = 3 * 30 + 10.
        let last: ClvRecord = storage::read_record(&blocks[3].1).unwrap();
        assert_eq!(last.len(), 10);
        // First block carries the shared initial observation.
        let first: ClvRecord = storage::read_record(&blocks[0].1).unwrap();
        assert_eq!(first.len(), 31);
    }

    #[test]
    fn colliding_work_and_output_dirs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("shared");
        let result = compute_clvs(
            LinearField {
                rates: vec![0.1, -0.1],
            },
            DVector::from_element(2, 1.0),
            &dir,
            &dir,
            &GinelliSettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn nested_work_and_output_dirs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let work_dir = tmp.path().join("work");
        // Output inside the work area would be deleted by the final cleanup.
        let result = compute_clvs(
            LinearField {
                rates: vec![0.1, -0.1],
            },
            DVector::from_element(2, 1.0),
            &work_dir,
            &work_dir.join("results"),
            &GinelliSettings::default(),
        );
        assert!(result.is_err());

        // Work area inside the output dir is the converse hazard.
        let output_dir = tmp.path().join("results");
        let result = compute_clvs(
            LinearField {
                rates: vec![0.1, -0.1],
            },
            DVector::from_element(2, 1.0),
            &output_dir.join("work"),
            &output_dir,
            &GinelliSettings::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn integration_failure_aborts_the_run() {
        let tmp = TempDir::new().unwrap();
        let settings = GinelliSettings {
            blv_transient_len: 10,
            clv_transient_steps: 10,
            clv_observation_steps: 10,
            block_size: 5,
            solver: SolverSettings {
                max_steps: 2,
                initial_step: 1e-6,
                ..SolverSettings::default()
            },
            ..GinelliSettings::default()
        };
        let result = compute_clvs(
            LinearField {
                rates: vec![1.0, -1.0],
            },
            DVector::from_element(2, 1.0),
            &tmp.path().join("work"),
            &tmp.path().join("results"),
            &settings,
        );
        assert!(result.is_err());
    }
}
