use nalgebra::{DMatrix, DVector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension used for block files. The stem is the block index in decimal.
pub const BLOCK_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed block container: {0}")]
    Json(#[from] serde_json::Error),
    #[error("block file name {name:?} does not encode a numeric index")]
    BadBlockName { name: String },
    #[error("block index {index} appears more than once under {dir}")]
    DuplicateBlockIndex { index: u64, dir: PathBuf },
    #[error("series {series:?} holds {got} values, expected {expected} for the recorded times")]
    InconsistentSeries {
        series: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("no observations buffered")]
    EmptyObservations,
}

/// One block of Bennetin observations over a contiguous time span.
///
/// `q` and `r` hold one row-major `ndim x ndim` matrix per recorded time,
/// flattened time-major; `trajectory` holds one `ndim` vector per time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BennetinRecord {
    pub ndim: usize,
    pub times: Vec<f64>,
    pub parameters: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Vec<f64>>,
    pub trajectory: Vec<f64>,
}

impl BennetinRecord {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn q_at(&self, step: usize) -> Option<DMatrix<f64>> {
        self.q.as_deref().map(|flat| matrix_at(flat, self.ndim, step))
    }

    pub fn r_at(&self, step: usize) -> Option<DMatrix<f64>> {
        self.r.as_deref().map(|flat| matrix_at(flat, self.ndim, step))
    }

    pub fn trajectory_at(&self, step: usize) -> DVector<f64> {
        let n = self.ndim;
        DVector::from_column_slice(&self.trajectory[step * n..(step + 1) * n])
    }
}

/// One block of final results: CLVs and FTCLEs over a contiguous time span,
/// optionally with the BLVs and FTBLEs recovered from the same data, plus the
/// trajectory passed through from the source observation block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClvRecord {
    pub ndim: usize,
    pub times: Vec<f64>,
    pub parameters: BTreeMap<String, f64>,
    /// time x le_index x component, row-major per step.
    pub clv: Vec<f64>,
    /// time x le_index.
    pub ftcle: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blv: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftble: Option<Vec<f64>>,
    pub trajectory: Vec<f64>,
}

impl ClvRecord {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clv_at(&self, step: usize) -> DMatrix<f64> {
        matrix_at(&self.clv, self.ndim, step)
    }

    pub fn ftcle_at(&self, step: usize) -> DVector<f64> {
        let n = self.ndim;
        DVector::from_column_slice(&self.ftcle[step * n..(step + 1) * n])
    }
}

/// Trajectory-only observations of a tangent integrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub ndim: usize,
    pub times: Vec<f64>,
    pub parameters: BTreeMap<String, f64>,
    pub trajectory: Vec<f64>,
}

/// A named scalar function of the trajectory, sampled over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub name: String,
    pub times: Vec<f64>,
    pub parameters: BTreeMap<String, f64>,
    pub values: Vec<f64>,
}

/// Appends `m` to `flat` in row-major order.
pub fn flatten_matrix(flat: &mut Vec<f64>, m: &DMatrix<f64>) {
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            flat.push(m[(i, j)]);
        }
    }
}

fn matrix_at(flat: &[f64], ndim: usize, step: usize) -> DMatrix<f64> {
    let len = ndim * ndim;
    DMatrix::from_row_slice(ndim, ndim, &flat[step * len..(step + 1) * len])
}

/// Path of the block with the given index under `dir`.
pub fn block_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{index}.{BLOCK_EXTENSION}"))
}

pub fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StorageError> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), record)?;
    Ok(())
}

pub fn read_record<T: DeserializeOwned + Validate>(path: &Path) -> Result<T, StorageError> {
    let file = File::open(path)?;
    let record: T = serde_json::from_reader(BufReader::new(file))?;
    record.validate()?;
    Ok(record)
}

/// Shape consistency of a record's flattened series against its time axis.
///
/// Checked on every read, so a truncated or hand-edited block file surfaces
/// as a typed error instead of a slice panic deep in a backward pass.
pub trait Validate {
    fn validate(&self) -> Result<(), StorageError>;
}

fn check_series(series: &'static str, got: usize, expected: usize) -> Result<(), StorageError> {
    if got == expected {
        Ok(())
    } else {
        Err(StorageError::InconsistentSeries {
            series,
            got,
            expected,
        })
    }
}

impl Validate for BennetinRecord {
    fn validate(&self) -> Result<(), StorageError> {
        let steps = self.times.len();
        if let Some(q) = &self.q {
            check_series("q", q.len(), steps * self.ndim * self.ndim)?;
        }
        if let Some(r) = &self.r {
            check_series("r", r.len(), steps * self.ndim * self.ndim)?;
        }
        check_series("trajectory", self.trajectory.len(), steps * self.ndim)
    }
}

impl Validate for ClvRecord {
    fn validate(&self) -> Result<(), StorageError> {
        let steps = self.times.len();
        check_series("clv", self.clv.len(), steps * self.ndim * self.ndim)?;
        check_series("ftcle", self.ftcle.len(), steps * self.ndim)?;
        if let Some(blv) = &self.blv {
            check_series("blv", blv.len(), steps * self.ndim * self.ndim)?;
        }
        if let Some(ftble) = &self.ftble {
            check_series("ftble", ftble.len(), steps * self.ndim)?;
        }
        check_series("trajectory", self.trajectory.len(), steps * self.ndim)
    }
}

impl Validate for TrajectoryRecord {
    fn validate(&self) -> Result<(), StorageError> {
        check_series(
            "trajectory",
            self.trajectory.len(),
            self.times.len() * self.ndim,
        )
    }
}

impl Validate for ScalarRecord {
    fn validate(&self) -> Result<(), StorageError> {
        check_series("values", self.values.len(), self.times.len())
    }
}

/// Discovers block files under `dir`, sorted by ascending numeric index.
///
/// The sort is over the parsed integer, never the raw file name: block 10
/// must sort after block 9 even though "10" < "9" lexically. A file whose
/// stem is not a decimal integer, or two files resolving to the same index
/// (e.g. `7` and `007`), are consistency errors.
pub fn list_blocks(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StorageError> {
    let mut blocks = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXTENSION) {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let index: u64 = stem.parse().map_err(|_| StorageError::BadBlockName {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })?;
        blocks.push((index, path));
    }
    blocks.sort_by_key(|(index, _)| *index);
    for pair in blocks.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(StorageError::DuplicateBlockIndex {
                index: pair[0].0,
                dir: dir.to_path_buf(),
            });
        }
    }
    Ok(blocks)
}

/// Discovers block files in descending numeric index order, the order the
/// backward passes consume them in.
pub fn list_blocks_descending(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StorageError> {
    let mut blocks = list_blocks(dir)?;
    blocks.reverse();
    Ok(blocks)
}

/// Removes an entire block storage area. Called only after a successful run;
/// failed runs keep their blocks on disk for inspection.
pub fn remove_store(dir: &Path) -> Result<(), StorageError> {
    fs::remove_dir_all(dir)?;
    Ok(())
}
