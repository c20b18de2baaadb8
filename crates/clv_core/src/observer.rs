use crate::bennetin::BennetinStepper;
use crate::storage::{
    self, BennetinRecord, ScalarRecord, StorageError, TrajectoryRecord,
};
use crate::tangent::TangentIntegrator;
use crate::traits::VectorField;
use anyhow::{bail, Context, Result};
use nalgebra::DVector;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Capability interface for accumulating time series from an integrator and
/// persisting them as self-describing records.
///
/// Concrete observers are selected at construction. `dump` on an empty
/// buffer is a logged no-op, never a crash.
pub trait Observer {
    type Record: Serialize;

    /// Appends the source's current state to the in-memory buffers.
    fn look(&mut self);

    /// Number of buffered observations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assembles the buffered series into a record.
    fn observations(&self) -> Result<Self::Record, StorageError>;

    /// Erases the buffers.
    fn wipe(&mut self);

    /// Hook run after each successful non-empty dump.
    fn dumped(&mut self) {}

    /// Persists the buffered series to `path` and wipes the buffers.
    fn dump(&mut self, path: &Path) -> Result<(), StorageError> {
        if self.is_empty() {
            warn!(path = %path.display(), "dump requested with no observations; skipping");
            return Ok(());
        }
        let record = self.observations()?;
        storage::write_record(path, &record)?;
        debug!(path = %path.display(), rows = self.len(), "observations written");
        self.wipe();
        self.dumped();
        Ok(())
    }
}

/// Observes `(time, Q, R, trajectory)` of a [`BennetinStepper`].
///
/// `store_q` and `store_r` may be switched off independently to save memory
/// when a stage only needs part of the data; toggle them only while the
/// buffers are empty.
pub struct BennetinObserver<'a, F: VectorField> {
    stepper: &'a mut BennetinStepper<F>,
    pub store_q: bool,
    pub store_r: bool,
    times: Vec<f64>,
    q_series: Vec<f64>,
    r_series: Vec<f64>,
    trajectory_series: Vec<f64>,
    dump_count: u64,
    primed: bool,
}

impl<'a, F: VectorField> BennetinObserver<'a, F> {
    pub fn new(stepper: &'a mut BennetinStepper<F>) -> Self {
        Self {
            stepper,
            store_q: true,
            store_r: true,
            times: Vec::new(),
            q_series: Vec::new(),
            r_series: Vec::new(),
            trajectory_series: Vec::new(),
            dump_count: 0,
            primed: false,
        }
    }

    /// Total number of dumps performed over this observer's lifetime.
    pub fn dump_count(&self) -> u64 {
        self.dump_count
    }

    /// Records the stepper's current state once, then alternates `step()`
    /// and `look()` exactly `n` times. An observer that has already looked
    /// skips the initial look: the current state was recorded by the
    /// previous run, and recording it again would duplicate the boundary
    /// row.
    pub fn make_observations(&mut self, n: usize) -> Result<()> {
        if !self.primed {
            self.look();
        }
        for _ in 0..n {
            self.stepper.step()?;
            self.look();
        }
        Ok(())
    }

    /// Partitions `total` observations into `total / block_size` full blocks
    /// plus one remainder block when `total % block_size != 0`, dumping each
    /// block to `dir` under its sequential index as soon as it completes.
    /// Peak memory is bounded by one block regardless of `total`.
    ///
    /// On a fresh observer the initial shared observation lands in the first
    /// block, which therefore holds one extra row; a run that continues an
    /// already-primed observer starts stepping immediately, so the boundary
    /// row between two runs is recorded exactly once. Returns the number of
    /// blocks written.
    pub fn make_observations_in_blocks(
        &mut self,
        dir: &Path,
        total: usize,
        block_size: usize,
    ) -> Result<u64> {
        if block_size == 0 {
            bail!("block_size must be at least 1.");
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create block directory {}", dir.display()))?;

        let full_blocks = total / block_size;
        let remainder = total % block_size;

        if !self.primed {
            self.look();
        }
        let mut block_index = 0u64;
        for _ in 0..full_blocks {
            self.observe_block(block_size)?;
            self.dump(&storage::block_path(dir, block_index))?;
            block_index += 1;
        }
        if remainder > 0 {
            self.observe_block(remainder)?;
            self.dump(&storage::block_path(dir, block_index))?;
            block_index += 1;
        }
        Ok(block_index)
    }

    fn observe_block(&mut self, steps: usize) -> Result<()> {
        for _ in 0..steps {
            self.stepper.step()?;
            self.look();
        }
        Ok(())
    }
}

impl<F: VectorField> Observer for BennetinObserver<'_, F> {
    type Record = BennetinRecord;

    fn look(&mut self) {
        self.primed = true;
        self.times.push(self.stepper.time());
        if self.store_q {
            storage::flatten_matrix(&mut self.q_series, self.stepper.q());
        }
        if self.store_r {
            storage::flatten_matrix(&mut self.r_series, self.stepper.r());
        }
        self.trajectory_series
            .extend(self.stepper.trajectory().iter());
    }

    fn len(&self) -> usize {
        self.times.len()
    }

    fn observations(&self) -> Result<BennetinRecord, StorageError> {
        if self.times.is_empty() {
            return Err(StorageError::EmptyObservations);
        }
        Ok(BennetinRecord {
            ndim: self.stepper.ndim(),
            times: self.times.clone(),
            parameters: self.stepper.parameters(),
            q: self.store_q.then(|| self.q_series.clone()),
            r: self.store_r.then(|| self.r_series.clone()),
            trajectory: self.trajectory_series.clone(),
        })
    }

    fn wipe(&mut self) {
        self.times.clear();
        self.q_series.clear();
        self.r_series.clear();
        self.trajectory_series.clear();
    }

    fn dumped(&mut self) {
        self.dump_count += 1;
    }
}

/// Observes `(time, trajectory)` of a [`TangentIntegrator`].
pub struct TrajectoryObserver<'a, F: VectorField> {
    integrator: &'a mut TangentIntegrator<F>,
    times: Vec<f64>,
    trajectory_series: Vec<f64>,
}

impl<'a, F: VectorField> TrajectoryObserver<'a, F> {
    pub fn new(integrator: &'a mut TangentIntegrator<F>) -> Self {
        Self {
            integrator,
            times: Vec::new(),
            trajectory_series: Vec::new(),
        }
    }

    /// Takes an initial look, then alternates `run(frequency)` and `look()`
    /// exactly `n` times.
    pub fn make_observations(&mut self, n: usize, frequency: f64) -> Result<()> {
        self.look();
        for _ in 0..n {
            self.integrator.run(frequency)?;
            self.look();
        }
        Ok(())
    }
}

impl<F: VectorField> Observer for TrajectoryObserver<'_, F> {
    type Record = TrajectoryRecord;

    fn look(&mut self) {
        self.times.push(self.integrator.time());
        self.trajectory_series
            .extend(self.integrator.trajectory().iter());
    }

    fn len(&self) -> usize {
        self.times.len()
    }

    fn observations(&self) -> Result<TrajectoryRecord, StorageError> {
        if self.times.is_empty() {
            return Err(StorageError::EmptyObservations);
        }
        Ok(TrajectoryRecord {
            ndim: self.integrator.ndim(),
            times: self.times.clone(),
            parameters: self.integrator.parameters(),
            trajectory: self.trajectory_series.clone(),
        })
    }

    fn wipe(&mut self) {
        self.times.clear();
        self.trajectory_series.clear();
    }
}

/// Observes a named scalar function of the trajectory.
pub struct ScalarObserver<'a, F, S>
where
    F: VectorField,
    S: Fn(&DVector<f64>) -> f64,
{
    integrator: &'a mut TangentIntegrator<F>,
    name: String,
    function: S,
    times: Vec<f64>,
    values: Vec<f64>,
}

impl<'a, F, S> ScalarObserver<'a, F, S>
where
    F: VectorField,
    S: Fn(&DVector<f64>) -> f64,
{
    pub fn new(integrator: &'a mut TangentIntegrator<F>, function: S, name: &str) -> Self {
        Self {
            integrator,
            name: name.to_owned(),
            function,
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn make_observations(&mut self, n: usize, frequency: f64) -> Result<()> {
        self.look();
        for _ in 0..n {
            self.integrator.run(frequency)?;
            self.look();
        }
        Ok(())
    }
}

impl<F, S> Observer for ScalarObserver<'_, F, S>
where
    F: VectorField,
    S: Fn(&DVector<f64>) -> f64,
{
    type Record = ScalarRecord;

    fn look(&mut self) {
        self.times.push(self.integrator.time());
        self.values.push((self.function)(self.integrator.trajectory()));
    }

    fn len(&self) -> usize {
        self.times.len()
    }

    fn observations(&self) -> Result<ScalarRecord, StorageError> {
        if self.times.is_empty() {
            return Err(StorageError::EmptyObservations);
        }
        Ok(ScalarRecord {
            name: self.name.clone(),
            times: self.times.clone(),
            parameters: self.integrator.parameters(),
            values: self.values.clone(),
        })
    }

    fn wipe(&mut self) {
        self.times.clear();
        self.values.clear();
    }
}
