//! # ionsim Core
//!
//! Shared types for the ionsim cellular electrophysiology engine.
//!
//! ## Components
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`IonsimError`] | Error taxonomy shared by every crate in the workspace |
//! | [`SolverFailureKind`] | Fine-grained reasons reported by the ODE solver |
//! | [`DataLog`] | Insertion-ordered, append-only variable log |
//! | [`SensitivityLog`] | One dependents x independents matrix per logged point |
//!
//! ## Design Philosophy
//!
//! 1. Every failure is a value, never a panic
//! 2. Logs are append-only and fail loudly
//! 3. Numerics stay in plain `f64` slices on hot paths

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

/// Reason an ODE solver gave up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolverFailureKind {
    /// Maximum number of internal steps exhausted
    TooMuchWork,
    /// Requested tolerances cannot be met in double precision
    TooMuchAccuracy,
    /// Local error test failed too many times in a single step
    ErrorTestFailures,
    /// Newton iteration failed to converge too many times in a single step
    ConvergenceFailures,
    /// Iteration matrix could not be factored
    LinearSetupFailed,
    /// Linear solve with the factored iteration matrix failed
    LinearSolveFailed,
    /// Right-hand side reported an unrecoverable failure
    RhsFailure,
    /// Right-hand side failed at the very first evaluation
    FirstRhsFailure,
    /// Right-hand side failed recoverably too many times in a row
    RepeatedRhsFailures,
    /// Root function evaluation failed
    RootFunctionFailure,
    /// Output time too close to the start time to estimate a first step
    TooClose,
    /// Invalid argument handed to the solver
    IllegalInput(String),
}

impl fmt::Display for SolverFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooMuchWork => write!(f, "maximum number of steps taken"),
            Self::TooMuchAccuracy => write!(f, "requested accuracy cannot be reached"),
            Self::ErrorTestFailures => write!(f, "error test failed repeatedly"),
            Self::ConvergenceFailures => write!(f, "Newton iteration failed to converge repeatedly"),
            Self::LinearSetupFailed => write!(f, "iteration matrix is singular"),
            Self::LinearSolveFailed => write!(f, "linear solve failed"),
            Self::RhsFailure => write!(f, "right-hand side failed unrecoverably"),
            Self::FirstRhsFailure => write!(f, "right-hand side failed at the first call"),
            Self::RepeatedRhsFailures => write!(f, "right-hand side failed repeatedly"),
            Self::RootFunctionFailure => write!(f, "root function failed"),
            Self::TooClose => write!(f, "output time too close to start time"),
            Self::IllegalInput(msg) => write!(f, "illegal input: {msg}"),
        }
    }
}

/// Common errors
#[derive(Debug, Error)]
pub enum IonsimError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Solver failure at t = {time}: {kind}")]
    SolverFailure { kind: SolverFailureKind, time: Time },

    #[error("Maximum number of consecutive zero-length steps ({steps}) taken at t = {time}")]
    ZeroProgressExhausted { steps: usize, time: Time },

    #[error("Failed to append to log: {0}")]
    LoggingAppendFailure(String),

    #[error("Sensitivity configuration error: {0}")]
    SensitivityConfiguration(String),

    #[error("Simulation cancelled by user")]
    UserCancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IonsimError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (uA/cm^2)
pub type Current = f64;

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting.
pub fn try_zeroed(len: usize, what: &str) -> Result<Vec<f64>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|e| IonsimError::OutOfMemory(format!("{what} ({len} values): {e}")))?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

// ============================================================================
// DATA LOG
// ============================================================================

/// A single named column of a [`DataLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSeries {
    /// Fully qualified variable name
    pub name: String,
    /// Logged values, one per logged point
    pub values: Vec<f64>,
}

/// Insertion-ordered mapping from variable name to an append-only series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLog {
    time_key: Option<String>,
    series: Vec<LogSeries>,
}

impl DataLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log whose time column is `time_key`.
    pub fn with_time_key(time_key: &str) -> Self {
        Self {
            time_key: Some(time_key.to_string()),
            series: Vec::new(),
        }
    }

    pub fn time_key(&self) -> Option<&str> {
        self.time_key.as_deref()
    }

    /// Register a new, empty series and return its index.
    pub fn add(&mut self, name: &str) -> Result<usize> {
        if self.index_of(name).is_some() {
            return Err(IonsimError::InvalidInput(format!(
                "Duplicate log entry: {name}"
            )));
        }
        self.series.push(LogSeries {
            name: name.to_string(),
            values: Vec::new(),
        });
        Ok(self.series.len() - 1)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.series.iter().position(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.series
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.values.as_slice())
    }

    /// Values of the time column, if one is set and present.
    pub fn time(&self) -> Option<&[f64]> {
        self.time_key.as_deref().and_then(|key| self.get(key))
    }

    /// Append `value` to the series at `index`.
    pub fn push(&mut self, index: usize, value: f64) -> Result<()> {
        let series = self.series.get_mut(index).ok_or_else(|| {
            IonsimError::LoggingAppendFailure(format!("No log series at index {index}"))
        })?;
        series
            .values
            .try_reserve(1)
            .map_err(|e| IonsimError::LoggingAppendFailure(format!("{}: {e}", series.name)))?;
        series.values.push(value);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.iter().map(|s| s.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogSeries> {
        self.series.iter()
    }

    /// Number of series in the log.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Number of logged points (length of the longest series).
    pub fn len(&self) -> usize {
        self.series.iter().map(|s| s.values.len()).max().unwrap_or(0)
    }

    /// True if no point has been logged yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the log as comma-separated values, one column per series.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> Result<()> {
        let header: Vec<String> = self.series.iter().map(|s| format!("\"{}\"", s.name)).collect();
        writeln!(writer, "{}", header.join(","))?;
        for row in 0..self.len() {
            let cells: Vec<String> = self
                .series
                .iter()
                .map(|s| s.values.get(row).map(|v| format!("{v:e}")).unwrap_or_default())
                .collect();
            writeln!(writer, "{}", cells.join(","))?;
        }
        Ok(())
    }
}

// ============================================================================
// SENSITIVITY LOG
// ============================================================================

/// Append-only list of sensitivity matrices (dependents x independents).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivityLog {
    /// Names of the quantities whose sensitivity is logged (rows)
    pub dependents: Vec<String>,
    /// Names of the parameters and initial values differentiated against (columns)
    pub independents: Vec<String>,
    matrices: Vec<Array2<f64>>,
}

impl SensitivityLog {
    pub fn new(dependents: Vec<String>, independents: Vec<String>) -> Self {
        Self {
            dependents,
            independents,
            matrices: Vec::new(),
        }
    }

    /// Append one matrix; its shape must match the dependents and independents.
    pub fn push(&mut self, matrix: Array2<f64>) -> Result<()> {
        let expected = (self.dependents.len(), self.independents.len());
        if matrix.dim() != expected {
            return Err(IonsimError::LoggingAppendFailure(format!(
                "Sensitivity matrix has shape {:?}, expected {:?}",
                matrix.dim(),
                expected
            )));
        }
        self.matrices
            .try_reserve(1)
            .map_err(|e| IonsimError::LoggingAppendFailure(format!("sensitivities: {e}")))?;
        self.matrices.push(matrix);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Array2<f64>> {
        self.matrices.get(index)
    }

    pub fn matrices(&self) -> &[Array2<f64>] {
        &self.matrices
    }

    /// Trace of d(dependent)/d(independent) over all logged points.
    pub fn trace(&self, dependent: usize, independent: usize) -> Vec<f64> {
        self.matrices
            .iter()
            .filter_map(|m| m.get((dependent, independent)).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_log_keeps_insertion_order() {
        let mut log = DataLog::with_time_key("engine.time");
        let t = log.add("engine.time").unwrap();
        let v = log.add("membrane.V").unwrap();
        log.push(t, 0.0).unwrap();
        log.push(v, -80.0).unwrap();
        log.push(t, 0.5).unwrap();
        log.push(v, -79.5).unwrap();

        let names: Vec<&str> = log.names().collect();
        assert_eq!(names, vec!["engine.time", "membrane.V"]);
        assert_eq!(log.time().unwrap(), &[0.0, 0.5]);
        assert_eq!(log.get("membrane.V").unwrap(), &[-80.0, -79.5]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_data_log_rejects_duplicates() {
        let mut log = DataLog::new();
        log.add("x").unwrap();
        assert!(matches!(log.add("x"), Err(IonsimError::InvalidInput(_))));
    }

    #[test]
    fn test_data_log_push_to_missing_series() {
        let mut log = DataLog::new();
        assert!(matches!(
            log.push(3, 1.0),
            Err(IonsimError::LoggingAppendFailure(_))
        ));
    }

    #[test]
    fn test_write_csv() {
        let mut log = DataLog::new();
        let a = log.add("a").unwrap();
        let b = log.add("b").unwrap();
        log.push(a, 1.0).unwrap();
        log.push(b, 2.0).unwrap();

        let mut out = Vec::new();
        log.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "\"a\",\"b\"");
        assert_eq!(lines[1], "1e0,2e0");
    }

    #[test]
    fn test_sensitivity_log_shape() {
        let mut log = SensitivityLog::new(vec!["x".into()], vec!["k".into(), "init(x)".into()]);
        log.push(Array2::from_shape_vec((1, 2), vec![0.5, 1.0]).unwrap())
            .unwrap();
        assert!(log.push(Array2::zeros((2, 2))).is_err());
        assert_eq!(log.len(), 1);
        assert_eq!(log.trace(0, 1), vec![1.0]);
    }

    #[test]
    fn test_try_zeroed() {
        let v = try_zeroed(4, "states").unwrap();
        assert_eq!(v, vec![0.0; 4]);
    }
}
