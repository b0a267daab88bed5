//! # ionsim Simulation
//!
//! Drives a [`Model`] through time with a stiff solver, interleaved with
//! pacing protocols and variable logging.
//!
//! ## Layers
//!
//! - [`Engine`]: one run as a resumable state machine
//!   (`Uninitialized -> Initialized -> Stepping -> Finished | Failed`).
//!   Each call to [`Engine::step`] performs a bounded batch of solver steps so
//!   the caller can check for cancellation in between.
//! - [`Simulation`]: stateful front end that remembers time, state, constants
//!   and protocols across runs.
//! - [`sweep`]: isolated simulations over a list of parameter values, in
//!   parallel.
//!
//! ## Logging policies
//!
//! | Policy | Points | Values |
//! |--------|--------|--------|
//! | [`LogTimes::Dynamic`] | every accepted step | live solver state |
//! | [`LogTimes::Periodic`] | `tmin + k * interval` in `[tmin, tmax)` | dense output + RHS |
//! | [`LogTimes::Points`] | caller-supplied, non-decreasing, in `[tmin, tmax)` | dense output + RHS |

use ionsim_bdf::{Bdf, BdfOptions, Integrator, OdeProblem, RhsError, SolverStats};
use ionsim_core::{try_zeroed, DataLog, IonsimError, Result, SensitivityLog, Time};
use ionsim_model::{
    CellModel, Independent, Model, SensitivitySpec, Topology, Variable, VariableCategory,
};
use ionsim_pacing::{FixedFormProtocol, PacingSystem, Protocol, ProtocolSpec};
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Solver and step-loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Absolute tolerance
    pub abs_tol: f64,
    /// Relative tolerance
    pub rel_tol: f64,
    /// Minimum step size (0 = unbounded)
    pub min_step: Time,
    /// Maximum step size (0 = unbounded)
    pub max_step: Time,
    /// Consecutive zero-length steps tolerated before giving up
    pub max_zero_steps: usize,
    /// Solver steps per call to [`Engine::step`]
    pub steps_per_batch: usize,
    /// Maximum number of solver steps per run (0 = unbounded)
    pub max_steps: u64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1e-6,
            rel_tol: 1e-4,
            min_step: 0.0,
            max_step: 0.0,
            max_zero_steps: 500,
            steps_per_batch: 100,
            max_steps: 0,
        }
    }
}

impl SolverSettings {
    pub fn bdf_options(&self) -> BdfOptions {
        BdfOptions {
            rtol: self.rel_tol,
            atol: self.abs_tol,
            min_step: self.min_step,
            max_step: self.max_step,
            max_steps: self.max_steps,
            ..BdfOptions::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bdf_options()
            .validate()
            .map_err(|kind| IonsimError::InvalidInput(kind.to_string()))?;
        if self.max_zero_steps == 0 {
            return Err(IonsimError::InvalidInput(
                "Maximum number of zero-length steps must be at least 1".into(),
            ));
        }
        if self.steps_per_batch == 0 {
            return Err(IonsimError::InvalidInput(
                "Steps per batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// When to log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTimes {
    /// Every accepted solver step
    #[default]
    Dynamic,
    /// Every `interval` time units from the start of the run
    Periodic(Time),
    /// At the given non-decreasing times
    Points(Vec<Time>),
}

impl LogTimes {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Dynamic => Ok(()),
            Self::Periodic(interval) => {
                if !(*interval > 0.0 && interval.is_finite()) {
                    return Err(IonsimError::InvalidInput(format!(
                        "Log interval must be positive, got {interval}"
                    )));
                }
                Ok(())
            }
            Self::Points(points) => {
                if points.iter().any(|t| !t.is_finite()) {
                    return Err(IonsimError::InvalidInput(
                        "Log times must be finite".into(),
                    ));
                }
                if let Some(w) = points.windows(2).find(|w| w[1] < w[0]) {
                    return Err(IonsimError::InvalidInput(format!(
                        "Log times must be non-decreasing ({} follows {})",
                        w[1], w[0]
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Whole variable categories to log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFlags {
    pub states: bool,
    pub derivatives: bool,
    pub bound: bool,
    pub intermediary: bool,
}

impl LogFlags {
    pub const NONE: Self = Self {
        states: false,
        derivatives: false,
        bound: false,
        intermediary: false,
    };

    pub const ALL: Self = Self {
        states: true,
        derivatives: true,
        bound: true,
        intermediary: true,
    };

    pub fn contains(&self, category: VariableCategory) -> bool {
        match category {
            VariableCategory::State => self.states,
            VariableCategory::Derivative => self.derivatives,
            VariableCategory::Bound => self.bound,
            VariableCategory::Intermediary => self.intermediary,
        }
    }

    pub fn insert(&mut self, category: VariableCategory) {
        match category {
            VariableCategory::State => self.states = true,
            VariableCategory::Derivative => self.derivatives = true,
            VariableCategory::Bound => self.bound = true,
            VariableCategory::Intermediary => self.intermediary = true,
        }
    }

    /// True if logging these categories needs a right-hand side evaluation.
    pub fn needs_evaluation(&self) -> bool {
        self.derivatives || self.intermediary
    }

    /// Names of every variable in the selected categories, bound variables first.
    pub fn names(&self, topology: &Topology) -> Vec<String> {
        [
            VariableCategory::Bound,
            VariableCategory::State,
            VariableCategory::Derivative,
            VariableCategory::Intermediary,
        ]
        .into_iter()
        .filter(|category| self.contains(*category))
        .flat_map(|category| topology.variables(category))
        .map(|variable| topology.name_of(variable))
        .collect()
    }
}

/// What to log in a run.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRequest {
    Flags(LogFlags),
    Names(Vec<String>),
    /// Append to an existing log; its series names select the variables
    Continue(DataLog),
}

impl Default for LogRequest {
    fn default() -> Self {
        Self::Flags(LogFlags {
            states: true,
            bound: true,
            ..LogFlags::NONE
        })
    }
}

/// Per-run options for [`Simulation::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub log: LogRequest,
    pub log_times: LogTimes,
    /// Sensitivity log to append to; a new one is created when absent
    pub sensitivity_log: Option<SensitivityLog>,
}

/// Threshold crossing detection on one state variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootFinding {
    pub state: usize,
    pub threshold: f64,
}

/// A located threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RootCrossing {
    pub time: Time,
    /// +1 when crossing upwards, -1 when crossing downwards
    pub direction: i32,
}

/// Everything one run needs, by value.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub tmin: Time,
    pub tmax: Time,
    pub state: Vec<f64>,
    /// One row per sensitivity independent
    pub state_sensitivities: Vec<Vec<f64>>,
    /// Literal values (model defaults when `None`)
    pub literals: Option<Vec<f64>>,
    /// Parameter values (model defaults when `None`)
    pub parameters: Option<Vec<f64>>,
    /// Pacing protocols by binding label
    pub protocols: Vec<(String, ProtocolSpec)>,
    pub log_times: LogTimes,
    pub solver: SolverSettings,
    pub root: Option<RootFinding>,
    /// Skip right-hand side calls whose inputs have not changed
    pub use_cache: bool,
    /// Log to append to, pre-populated with the variables to log
    pub log: DataLog,
    /// Sensitivity log; sensitivities are only logged when present
    pub sensitivity_log: Option<SensitivityLog>,
}

impl RunConfig {
    pub fn new(tmin: Time, tmax: Time, state: Vec<f64>) -> Self {
        Self {
            tmin,
            tmax,
            state,
            state_sensitivities: Vec::new(),
            literals: None,
            parameters: None,
            protocols: Vec::new(),
            log_times: LogTimes::Dynamic,
            solver: SolverSettings::default(),
            root: None,
            use_cache: true,
            log: DataLog::new(),
            sensitivity_log: None,
        }
    }
}

// ============================================================================
// RESULTS AND FAILURES
// ============================================================================

/// Inputs and last good state at the moment a run failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureSnapshot {
    pub time: Time,
    pub pace: Vec<f64>,
    pub realtime: f64,
    pub evaluations: u64,
    pub state: Vec<f64>,
    pub state_sensitivities: Vec<Vec<f64>>,
}

/// A failed run, with everything logged up to the failure.
#[derive(Debug, Error)]
#[error("{error} (last good state at t = {})", .snapshot.time)]
pub struct RunFailure {
    #[source]
    pub error: IonsimError,
    pub snapshot: FailureSnapshot,
    pub log: DataLog,
    pub sensitivities: Option<SensitivityLog>,
    pub crossings: Vec<RootCrossing>,
}

impl RunFailure {
    /// Failure before any step was taken.
    pub fn before_start(error: IonsimError, time: Time, state: Vec<f64>) -> Self {
        Self {
            error,
            snapshot: FailureSnapshot {
                time,
                state,
                ..FailureSnapshot::default()
            },
            log: DataLog::new(),
            sensitivities: None,
            crossings: Vec::new(),
        }
    }
}

/// A completed run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub log: DataLog,
    pub sensitivities: Option<SensitivityLog>,
    pub crossings: Vec<RootCrossing>,
    pub time: Time,
    pub state: Vec<f64>,
    pub state_sensitivities: Vec<Vec<f64>>,
    /// Right-hand side evaluations made during the run
    pub evaluations: u64,
    pub stats: SolverStats,
    /// Wall-clock duration in seconds
    pub realtime: f64,
}

/// Action potential starts and durations from threshold crossings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Apds {
    pub starts: Vec<Time>,
    pub durations: Vec<Time>,
}

impl Apds {
    /// Pair every upward crossing with the next downward one. A downward
    /// crossing without a preceding upward one is ignored.
    pub fn from_crossings(crossings: &[RootCrossing]) -> Self {
        let mut apds = Self::default();
        let mut start = None;
        for crossing in crossings {
            if crossing.direction > 0 {
                start = Some(crossing.time);
            } else if let Some(t0) = start.take() {
                apds.starts.push(t0);
                apds.durations.push(crossing.time - t0);
            }
        }
        apds
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

/// Receives progress between step batches.
pub trait ProgressReporter {
    fn enter(&mut self, _message: &str) {}

    fn exit(&mut self) {}

    /// Report the completed fraction; return `false` to cancel the run.
    fn update(&mut self, progress: f64) -> bool;
}

/// Reporter that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn update(&mut self, _progress: f64) -> bool {
        true
    }
}

// ============================================================================
// SOLVER ADAPTER
// ============================================================================

fn fill_pace(pacing: &PacingSystem, pace_map: &[Option<usize>], t: Time, out: &mut [f64]) {
    for (value, slot) in out.iter_mut().zip(pace_map) {
        *value = slot.map_or(0.0, |s| pacing.level(s, t));
    }
}

/// Presents a model and its pacing to the solver.
struct ModelProblem<'a> {
    model: &'a mut Model,
    pacing: &'a PacingSystem,
    pace_map: &'a [Option<usize>],
    pace: &'a mut [f64],
    root: Option<RootFinding>,
    realtime: f64,
}

impl OdeProblem for ModelProblem<'_> {
    fn dimension(&self) -> usize {
        self.model.n_states()
    }

    fn rhs(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> std::result::Result<(), RhsError> {
        // Event levels are already current; fixed-form tables are read at t
        fill_pace(self.pacing, self.pace_map, t, self.pace);
        self.model
            .set_bound_variables(t, self.pace, self.realtime)
            .map_err(|_| RhsError::Unrecoverable)?;
        self.model.set_states(y).map_err(|_| RhsError::Unrecoverable)?;
        self.model
            .evaluate_derivatives()
            .map_err(|_| RhsError::Unrecoverable)?;
        let derivatives = self.model.derivatives();
        if derivatives.iter().any(|v| !v.is_finite()) {
            return Err(RhsError::Recoverable);
        }
        ydot.copy_from_slice(derivatives);
        Ok(())
    }

    fn sensitivity_count(&self) -> usize {
        self.model.independents().len()
    }

    fn sensitivity_parameter(&self, index: usize) -> Option<f64> {
        match self.model.independents().get(index)? {
            Independent::Parameter(p) => self.model.parameters().get(*p).copied(),
            Independent::InitialState(_) => None,
        }
    }

    fn set_sensitivity_parameter(&mut self, index: usize, value: f64) {
        if let Some(Independent::Parameter(p)) = self.model.independents().get(index).copied() {
            if let Err(e) = self.model.set_parameter(p, value) {
                warn!("Could not perturb parameter {p}: {e}");
            }
        }
    }

    fn root_count(&self) -> usize {
        usize::from(self.root.is_some())
    }

    fn roots(&mut self, _t: f64, y: &[f64], g: &mut [f64]) -> std::result::Result<(), RhsError> {
        if let Some(root) = self.root {
            g[0] = y[root.state] - root.threshold;
        }
        Ok(())
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Lifecycle of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Stepping,
    Finished,
    Failed,
}

/// Result of one step batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepStatus {
    /// Still running; resume from this time
    Running(Time),
    Finished,
}

/// Everything owned by one live run.
struct RunContext {
    model: Model,
    pacing: PacingSystem,
    pace_map: Vec<Option<usize>>,
    pace: Vec<f64>,
    integrator: Box<dyn Integrator>,
    settings: SolverSettings,
    tmin: Time,
    tmax: Time,
    t: Time,
    tnext: Time,
    /// Solver state `[y, s_0, s_1, ...]`
    y: Vec<f64>,
    /// Interpolation buffer for periodic and point-list logging
    y_log: Vec<f64>,
    /// Backup of the last accepted state
    y_last: Vec<f64>,
    t_last: Time,
    zero_steps: usize,
    log: DataLog,
    bindings: Vec<(usize, Variable)>,
    flags: LogFlags,
    sens_log: Option<SensitivityLog>,
    log_times: LogTimes,
    tlog: Time,
    ilog: usize,
    root: Option<RootFinding>,
    crossings: Vec<RootCrossing>,
    started: Instant,
}

impl RunContext {
    fn create(
        definition: Arc<dyn CellModel>,
        sensitivities: Option<&SensitivitySpec>,
        config: RunConfig,
        mut integrator: Box<dyn Integrator>,
    ) -> Result<Self> {
        let RunConfig {
            tmin,
            tmax,
            state,
            state_sensitivities,
            literals,
            parameters,
            protocols,
            log_times,
            solver,
            root,
            use_cache,
            log,
            sensitivity_log,
        } = config;

        if !(tmin.is_finite() && tmax.is_finite()) || tmax < tmin {
            return Err(IonsimError::InvalidInput(format!(
                "Invalid time interval [{tmin}, {tmax}]"
            )));
        }
        solver.validate()?;
        log_times.validate()?;
        let topology = definition.topology();
        let n = topology.n_states();
        if state.len() != n {
            return Err(IonsimError::InvalidInput(format!(
                "Expected {n} initial state values, got {}",
                state.len()
            )));
        }
        if let Some(root) = root {
            if root.state >= n || !root.threshold.is_finite() {
                return Err(IonsimError::InvalidInput(format!(
                    "Invalid root finding on state {} with threshold {}",
                    root.state, root.threshold
                )));
            }
        }

        // Model
        let mut model = match sensitivities {
            Some(spec) => Model::with_sensitivities(Arc::clone(&definition), spec)?,
            None => Model::new(Arc::clone(&definition))?,
        };
        model.set_cache(use_cache);
        if let Some(values) = &literals {
            model.set_literals(values)?;
        }
        if let Some(values) = &parameters {
            model.set_parameters(values)?;
        }
        model.set_states(&state)?;
        let ns = model.independents().len();
        if ns == 0 && !state_sensitivities.is_empty() {
            return Err(IonsimError::SensitivityConfiguration(
                "State sensitivities given for a run without sensitivities".into(),
            ));
        }
        if ns > 0 && state_sensitivities.len() != ns {
            return Err(IonsimError::InvalidInput(format!(
                "Expected {ns} state sensitivity rows, got {}",
                state_sensitivities.len()
            )));
        }
        for (j, row) in state_sensitivities.iter().enumerate() {
            model.set_state_sensitivities(j, row)?;
        }

        // Pacing
        let mut pacing = PacingSystem::new();
        for (label, spec) in &protocols {
            pacing.add_spec(label, spec)?;
        }
        let model_labels = topology.pace_labels();
        for label in pacing.labels() {
            if !model_labels.contains(&label.as_str()) {
                warn!(
                    "Protocol bound to '{label}' is not used by model {}",
                    definition.name()
                );
            }
        }
        let pace_map: Vec<Option<usize>> =
            model_labels.iter().map(|label| pacing.slot(label)).collect();
        pacing.advance_time(tmin)?;
        let mut pace = try_zeroed(pace_map.len(), "pace values")?;

        // Logging
        let mut bindings = Vec::with_capacity(log.series_count());
        let mut flags = LogFlags::NONE;
        for (index, name) in log.names().enumerate() {
            let variable = topology.resolve(name).ok_or_else(|| {
                IonsimError::InvalidInput(format!("Unknown variable in log: {name}"))
            })?;
            let category = variable.category().ok_or_else(|| {
                IonsimError::InvalidInput(format!("Constant {name} cannot be logged"))
            })?;
            flags.insert(category);
            bindings.push((index, variable));
        }
        if let Some(sens_log) = &sensitivity_log {
            if !model.has_sensitivities() {
                return Err(IonsimError::SensitivityConfiguration(
                    "Sensitivity log given for a run without sensitivities".into(),
                ));
            }
            if sens_log.dependents.len() != model.dependents().len()
                || sens_log.independents.len() != ns
            {
                return Err(IonsimError::InvalidInput(
                    "Sensitivity log shape does not match the sensitivity specification".into(),
                ));
            }
            if !log.is_empty() && sens_log.len() != log.len() {
                return Err(IonsimError::InvalidInput(format!(
                    "Sensitivity log has {} entries but the data log has {}",
                    sens_log.len(),
                    log.len()
                )));
            }
        }

        // Solver state
        let total = n * (1 + ns);
        let mut y = try_zeroed(total, "solver state")?;
        y[..n].copy_from_slice(&state);
        for (j, row) in state_sensitivities.iter().enumerate() {
            y[n * (j + 1)..n * (j + 2)].copy_from_slice(row);
        }
        let y_log = try_zeroed(total, "log interpolation buffer")?;
        let y_last = y.clone();

        if model.is_ode() {
            let mut problem = ModelProblem {
                model: &mut model,
                pacing: &pacing,
                pace_map: &pace_map,
                pace: &mut pace,
                root,
                realtime: 0.0,
            };
            integrator
                .initialize(&mut problem, tmin, &y)
                .map_err(|kind| IonsimError::SolverFailure { kind, time: tmin })?;
        }

        let tnext = pacing.next_time().min(tmax);
        let (tlog, ilog) = first_log_point(&log_times, tmin);
        debug!(
            "Run of {} initialised on [{tmin}, {tmax}]: {n} states, {ns} independents, {} pacing sources",
            definition.name(),
            pacing.len()
        );

        let mut context = Self {
            model,
            pacing,
            pace_map,
            pace,
            integrator,
            settings: solver,
            tmin,
            tmax,
            t: tmin,
            tnext,
            y,
            y_log,
            y_last,
            t_last: tmin,
            zero_steps: 0,
            log,
            bindings,
            flags,
            sens_log: sensitivity_log,
            log_times,
            tlog,
            ilog,
            root,
            crossings: Vec::new(),
            started: Instant::now(),
        };

        // A continued log already holds this point
        if context.log_times == LogTimes::Dynamic && context.log.is_empty() {
            context.log_point(tmin, false)?;
        }
        Ok(context)
    }

    fn reached_end(&self) -> bool {
        self.t >= self.tmax || self.tmax - self.t <= 4.0 * f64::EPSILON * self.tmax.abs().max(1.0)
    }

    fn step_batch(&mut self) -> Result<StepStatus> {
        for _ in 0..self.settings.steps_per_batch {
            if self.reached_end() {
                return Ok(StepStatus::Finished);
            }
            self.advance()?;
        }
        if self.reached_end() {
            Ok(StepStatus::Finished)
        } else {
            Ok(StepStatus::Running(self.t))
        }
    }

    /// One elementary step of the driver.
    fn advance(&mut self) -> Result<()> {
        self.y_last.copy_from_slice(&self.y);
        self.t_last = self.t;
        let realtime = self.started.elapsed().as_secs_f64();
        let t_previous = self.t;
        let mut landed_on_boundary = false;

        let t_new = if self.model.is_ode() {
            let mut problem = ModelProblem {
                model: &mut self.model,
                pacing: &self.pacing,
                pace_map: &self.pace_map,
                pace: &mut self.pace,
                root: self.root,
                realtime,
            };
            let report = self
                .integrator
                .step(&mut problem, self.tnext)
                .map_err(|kind| IonsimError::SolverFailure {
                    kind,
                    time: t_previous,
                })?;

            if report.t <= t_previous {
                self.zero_steps += 1;
                if self.zero_steps >= self.settings.max_zero_steps {
                    return Err(IonsimError::ZeroProgressExhausted {
                        steps: self.zero_steps,
                        time: t_previous,
                    });
                }
            } else {
                self.zero_steps = 0;
            }

            if report.t > self.tnext {
                // Went past a discontinuity: rewind to it. Crossings found in
                // the overshooting step are dropped with it.
                self.integrator
                    .interpolate(self.tnext, &mut self.y)
                    .map_err(|kind| IonsimError::SolverFailure {
                        kind,
                        time: t_previous,
                    })?;
                landed_on_boundary = true;
                self.tnext
            } else {
                self.y.copy_from_slice(self.integrator.solution());
                self.crossings
                    .extend(report.roots.iter().map(|root| RootCrossing {
                        time: root.time,
                        direction: root.direction,
                    }));
                landed_on_boundary = report.t == self.tnext;
                report.t
            }
        } else {
            self.y_log.copy_from_slice(&self.y);
            self.tnext
        };
        self.t = t_new;

        if self.log_times != LogTimes::Dynamic {
            // Half-open: a point at t_new is logged by the next step
            while self.tlog < t_new {
                let tlog = self.tlog;
                if self.model.is_ode() {
                    self.integrator
                        .interpolate(tlog, &mut self.y_log)
                        .map_err(|kind| IonsimError::SolverFailure {
                            kind,
                            time: t_previous,
                        })?;
                }
                self.log_point(tlog, true)?;
                self.next_log_point();
            }
        }

        self.pacing.advance_time(self.t)?;
        self.tnext = self.pacing.next_time().min(self.tmax);

        // A point on a boundary sees the level that starts there
        if self.log_times == LogTimes::Dynamic && t_new > t_previous {
            self.log_point(t_new, false)?;
        }

        if landed_on_boundary && self.model.is_ode() && !self.reached_end() {
            let mut problem = ModelProblem {
                model: &mut self.model,
                pacing: &self.pacing,
                pace_map: &self.pace_map,
                pace: &mut self.pace,
                root: self.root,
                realtime,
            };
            self.integrator
                .reinitialize(&mut problem, self.t, &self.y)
                .map_err(|kind| IonsimError::SolverFailure { kind, time: t_new })?;
            debug!("Solver reinitialised at t = {}", self.t);
        }
        Ok(())
    }

    fn next_log_point(&mut self) {
        self.ilog += 1;
        self.tlog = match &self.log_times {
            LogTimes::Periodic(interval) => self.tmin + self.ilog as f64 * interval,
            LogTimes::Points(points) => points.get(self.ilog).copied().unwrap_or(f64::INFINITY),
            LogTimes::Dynamic => f64::INFINITY,
        };
    }

    /// Append one point, read from the live state or the interpolation buffer.
    fn log_point(&mut self, time: Time, from_buffer: bool) -> Result<()> {
        let n = self.model.n_states();
        fill_pace(&self.pacing, &self.pace_map, time, &mut self.pace);
        let realtime = self.started.elapsed().as_secs_f64();
        self.model.set_bound_variables(time, &self.pace, realtime)?;
        let z = if from_buffer { &self.y_log } else { &self.y };
        self.model.set_states(&z[..n])?;
        if self.flags.needs_evaluation() {
            self.model.evaluate_derivatives()?;
        }
        for &(series, variable) in &self.bindings {
            self.log.push(series, self.model.value(variable))?;
        }
        if let Some(sens_log) = self.sens_log.as_mut() {
            for j in 0..self.model.independents().len() {
                self.model
                    .set_state_sensitivities(j, &z[n * (j + 1)..n * (j + 2)])?;
            }
            self.model.evaluate_sensitivity_outputs()?;
            if let Some(outputs) = self.model.sensitivity_outputs() {
                sens_log.push(outputs.clone())?;
            }
        }
        Ok(())
    }

    fn sensitivity_rows(&self, y: &[f64]) -> Vec<Vec<f64>> {
        let n = self.model.n_states();
        (0..self.model.independents().len())
            .map(|j| y[n * (j + 1)..n * (j + 2)].to_vec())
            .collect()
    }

    fn into_failure(mut self, error: IonsimError) -> RunFailure {
        let n = self.model.n_states();
        fill_pace(&self.pacing, &self.pace_map, self.t_last, &mut self.pace);
        let snapshot = FailureSnapshot {
            time: self.t_last,
            pace: self.pace.clone(),
            realtime: self.started.elapsed().as_secs_f64(),
            evaluations: self.model.evaluations(),
            state: self.y_last[..n].to_vec(),
            state_sensitivities: self.sensitivity_rows(&self.y_last),
        };
        RunFailure {
            error,
            snapshot,
            log: self.log,
            sensitivities: self.sens_log,
            crossings: self.crossings,
        }
    }

    fn into_output(self) -> RunOutput {
        let n = self.model.n_states();
        RunOutput {
            state: self.y[..n].to_vec(),
            state_sensitivities: self.sensitivity_rows(&self.y),
            time: self.t,
            evaluations: self.model.evaluations(),
            stats: self.integrator.stats(),
            realtime: self.started.elapsed().as_secs_f64(),
            log: self.log,
            sensitivities: self.sens_log,
            crossings: self.crossings,
        }
    }
}

fn first_log_point(log_times: &LogTimes, tmin: Time) -> (Time, usize) {
    match log_times {
        LogTimes::Dynamic => (f64::INFINITY, 0),
        LogTimes::Periodic(_) => (tmin, 0),
        LogTimes::Points(points) => {
            // Points before the start are skipped
            let first = points.partition_point(|&t| t < tmin);
            (points.get(first).copied().unwrap_or(f64::INFINITY), first)
        }
    }
}

/// A single run, stepped in batches.
///
/// At most one run is live per engine; every exit path releases the run's
/// model, pacing and solver.
pub struct Engine {
    state: EngineState,
    run: Option<Box<RunContext>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            run: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Current time of the live run
    pub fn time(&self) -> Option<Time> {
        self.run.as_ref().map(|run| run.t)
    }

    /// Variable categories the live run is logging
    pub fn logging_flags(&self) -> Option<LogFlags> {
        self.run.as_ref().map(|run| run.flags)
    }

    /// Set up a run with the default BDF solver.
    pub fn init(
        &mut self,
        definition: Arc<dyn CellModel>,
        sensitivities: Option<&SensitivitySpec>,
        config: RunConfig,
    ) -> Result<()> {
        config.solver.validate()?;
        let solver = Bdf::new(config.solver.bdf_options())
            .map_err(|kind| IonsimError::InvalidInput(kind.to_string()))?;
        self.init_with_integrator(definition, sensitivities, config, Box::new(solver))
    }

    /// Set up a run with a caller-supplied integrator.
    pub fn init_with_integrator(
        &mut self,
        definition: Arc<dyn CellModel>,
        sensitivities: Option<&SensitivitySpec>,
        config: RunConfig,
        integrator: Box<dyn Integrator>,
    ) -> Result<()> {
        if self.run.is_some() {
            return Err(IonsimError::InvalidInput(
                "A run is already in progress; clean the engine first".into(),
            ));
        }
        match RunContext::create(definition, sensitivities, config, integrator) {
            Ok(run) => {
                self.run = Some(Box::new(run));
                self.state = EngineState::Initialized;
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Run one batch of solver steps.
    ///
    /// On failure the run is torn down and returned with its partial logs.
    pub fn step(&mut self) -> std::result::Result<StepStatus, RunFailure> {
        match self.state {
            EngineState::Finished => return Ok(StepStatus::Finished),
            EngineState::Initialized | EngineState::Stepping => {}
            EngineState::Uninitialized | EngineState::Failed => {
                return Err(not_initialised());
            }
        }
        let Some(run) = self.run.as_mut() else {
            return Err(not_initialised());
        };
        self.state = EngineState::Stepping;
        match run.step_batch() {
            Ok(StepStatus::Finished) => {
                self.state = EngineState::Finished;
                Ok(StepStatus::Finished)
            }
            Ok(running) => Ok(running),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Abort the live run as cancelled by the user.
    pub fn cancel(&mut self) -> RunFailure {
        self.fail(IonsimError::UserCancelled)
    }

    fn fail(&mut self, error: IonsimError) -> RunFailure {
        self.state = EngineState::Failed;
        match self.run.take() {
            Some(run) => {
                warn!("Run failed at t = {}: {error}", run.t_last);
                (*run).into_failure(error)
            }
            None => RunFailure::before_start(error, 0.0, Vec::new()),
        }
    }

    /// Hand over the results of a finished run.
    pub fn finish(&mut self) -> Result<RunOutput> {
        if self.state != EngineState::Finished {
            return Err(IonsimError::InvalidInput(format!(
                "Cannot finish a run in state {:?}",
                self.state
            )));
        }
        let run = self.run.take().ok_or_else(|| {
            IonsimError::InvalidInput("Run results were already taken".into())
        })?;
        Ok((*run).into_output())
    }

    /// Release everything; safe to call repeatedly.
    pub fn clean(&mut self) {
        if self.run.take().is_some() {
            debug!("Released live run");
        }
        self.state = EngineState::Uninitialized;
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn not_initialised() -> RunFailure {
    RunFailure::before_start(
        IonsimError::InvalidInput("Engine has no live run".into()),
        0.0,
        Vec::new(),
    )
}

// ============================================================================
// SIMULATION
// ============================================================================

/// Stateful simulation of one model.
///
/// Time, state and sensitivity state carry over from one [`Simulation::run`]
/// to the next. Protocols are anchored at time zero.
#[derive(Clone)]
pub struct Simulation {
    definition: Arc<dyn CellModel>,
    sensitivities: Option<SensitivitySpec>,
    time: Time,
    state: Vec<f64>,
    default_state: Vec<f64>,
    s_state: Vec<Vec<f64>>,
    default_s_state: Vec<Vec<f64>>,
    literals: Vec<f64>,
    parameters: Vec<f64>,
    protocols: Vec<(String, ProtocolSpec)>,
    settings: SolverSettings,
    root: Option<RootFinding>,
    use_cache: bool,
    last_state: Option<Vec<f64>>,
    last_evaluations: u64,
    last_steps: u64,
}

impl Simulation {
    /// Create a simulation, validating the sensitivity specification.
    pub fn new(
        definition: Arc<dyn CellModel>,
        sensitivities: Option<SensitivitySpec>,
    ) -> Result<Self> {
        let model = match &sensitivities {
            Some(spec) => Model::with_sensitivities(Arc::clone(&definition), spec)?,
            None => Model::new(Arc::clone(&definition))?,
        };
        let default_state = model.default_state();
        let n = default_state.len();
        // Initial-value independents start with unit sensitivity to themselves
        let default_s_state: Vec<Vec<f64>> = model
            .independents()
            .iter()
            .map(|independent| {
                let mut row = vec![0.0; n];
                if let Independent::InitialState(i) = independent {
                    row[*i] = 1.0;
                }
                row
            })
            .collect();
        Ok(Self {
            literals: model.literals().to_vec(),
            parameters: model.parameters().to_vec(),
            state: default_state.clone(),
            default_state,
            s_state: default_s_state.clone(),
            default_s_state,
            time: 0.0,
            protocols: Vec::new(),
            settings: SolverSettings::default(),
            root: None,
            use_cache: true,
            last_state: None,
            last_evaluations: 0,
            last_steps: 0,
            sensitivities,
            definition,
        })
    }

    pub fn definition(&self) -> &Arc<dyn CellModel> {
        &self.definition
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn default_state(&self) -> &[f64] {
        &self.default_state
    }

    /// State sensitivities, one row per independent
    pub fn sensitivity_state(&self) -> &[Vec<f64>] {
        &self.s_state
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Final state of the last run, or the last good state if it failed.
    pub fn last_state(&self) -> Option<&[f64]> {
        self.last_state.as_deref()
    }

    pub fn last_number_of_evaluations(&self) -> u64 {
        self.last_evaluations
    }

    pub fn last_number_of_steps(&self) -> u64 {
        self.last_steps
    }

    /// Rewind to time zero and the default state.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.state = self.default_state.clone();
        self.s_state = self.default_s_state.clone();
    }

    pub fn set_state(&mut self, state: &[f64]) -> Result<()> {
        self.check_state(state)?;
        self.state = state.to_vec();
        Ok(())
    }

    pub fn set_default_state(&mut self, state: &[f64]) -> Result<()> {
        self.check_state(state)?;
        self.default_state = state.to_vec();
        Ok(())
    }

    fn check_state(&self, state: &[f64]) -> Result<()> {
        if state.len() != self.default_state.len() {
            return Err(IonsimError::InvalidInput(format!(
                "Expected {} state values, got {}",
                self.default_state.len(),
                state.len()
            )));
        }
        Ok(())
    }

    /// Change a literal or parameter.
    pub fn set_constant(&mut self, name: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(IonsimError::InvalidInput(format!(
                "Value for {name} must be finite"
            )));
        }
        match self.definition.topology().resolve(name) {
            Some(Variable::Literal(i)) => self.literals[i] = value,
            Some(Variable::Parameter(i)) => self.parameters[i] = value,
            Some(_) => {
                return Err(IonsimError::InvalidInput(format!(
                    "{name} is not a literal or parameter"
                )))
            }
            None => {
                return Err(IonsimError::InvalidInput(format!(
                    "Unknown variable: {name}"
                )))
            }
        }
        Ok(())
    }

    /// Set or clear the protocol for a binding label.
    pub fn set_protocol_spec(&mut self, label: &str, spec: Option<ProtocolSpec>) -> Result<()> {
        if let Some(spec) = &spec {
            // Fails early on malformed protocols
            let mut check = PacingSystem::new();
            check.add_spec(label, spec)?;
            if !self.definition.topology().pace_labels().contains(&label) {
                warn!(
                    "Model {} has no variable bound to '{label}'",
                    self.definition.name()
                );
            }
        }
        self.protocols.retain(|(l, _)| l != label);
        if let Some(spec) = spec {
            self.protocols.push((label.to_string(), spec));
        }
        Ok(())
    }

    pub fn set_protocol(&mut self, protocol: Option<&Protocol>, label: &str) -> Result<()> {
        self.set_protocol_spec(label, protocol.map(ProtocolSpec::events))
    }

    pub fn set_fixed_form_protocol(
        &mut self,
        protocol: Option<&FixedFormProtocol>,
        label: &str,
    ) -> Result<()> {
        self.set_protocol_spec(label, protocol.map(ProtocolSpec::fixed_form))
    }

    pub fn set_solver_settings(&mut self, settings: SolverSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn set_tolerance(&mut self, abs_tol: f64, rel_tol: f64) -> Result<()> {
        self.set_solver_settings(SolverSettings {
            abs_tol,
            rel_tol,
            ..self.settings.clone()
        })
    }

    /// Maximum step size; 0 removes the bound.
    pub fn set_max_step_size(&mut self, max_step: Time) -> Result<()> {
        self.set_solver_settings(SolverSettings {
            max_step,
            ..self.settings.clone()
        })
    }

    /// Minimum step size; 0 removes the bound.
    pub fn set_min_step_size(&mut self, min_step: Time) -> Result<()> {
        self.set_solver_settings(SolverSettings {
            min_step,
            ..self.settings.clone()
        })
    }

    pub fn set_max_zero_steps(&mut self, max_zero_steps: usize) -> Result<()> {
        self.set_solver_settings(SolverSettings {
            max_zero_steps,
            ..self.settings.clone()
        })
    }

    /// Enable or disable the evaluation cache for subsequent runs.
    pub fn set_cache(&mut self, enabled: bool) {
        self.use_cache = enabled;
    }

    /// Detect crossings of `threshold` by a state variable, or stop detecting.
    pub fn set_root_finding(&mut self, root: Option<(&str, f64)>) -> Result<()> {
        self.root = match root {
            None => None,
            Some((name, threshold)) => match self.definition.topology().resolve(name) {
                Some(Variable::State(state)) => Some(RootFinding { state, threshold }),
                _ => {
                    return Err(IonsimError::InvalidInput(format!(
                        "Root finding needs a state variable, got {name}"
                    )))
                }
            },
        };
        Ok(())
    }

    /// Derivatives at the current time for `state` (the current state if `None`).
    pub fn eval_derivatives(&self, state: Option<&[f64]>) -> Result<Vec<f64>> {
        let mut model = Model::new(Arc::clone(&self.definition))?;
        model.set_literals(&self.literals)?;
        model.set_parameters(&self.parameters)?;
        let mut pacing = PacingSystem::new();
        for (label, spec) in &self.protocols {
            pacing.add_spec(label, spec)?;
        }
        pacing.advance_time(self.time)?;
        let pace: Vec<f64> = self
            .definition
            .topology()
            .pace_labels()
            .iter()
            .map(|label| pacing.slot(label).map_or(0.0, |s| pacing.level(s, self.time)))
            .collect();
        model.set_bound_variables(self.time, &pace, 0.0)?;
        model.set_states(state.unwrap_or(self.state.as_slice()))?;
        model.evaluate_derivatives()?;
        Ok(model.derivatives().to_vec())
    }

    /// Run for `duration` from the current time and state.
    pub fn run(
        &mut self,
        duration: Time,
        options: RunOptions,
    ) -> std::result::Result<RunOutput, RunFailure> {
        self.execute(duration, options, &mut NoProgress, true)
    }

    pub fn run_with_progress(
        &mut self,
        duration: Time,
        options: RunOptions,
        reporter: &mut dyn ProgressReporter,
    ) -> std::result::Result<RunOutput, RunFailure> {
        self.execute(duration, options, reporter, true)
    }

    /// Run without logging and make the final state the new default state.
    /// The simulation time is left unchanged.
    pub fn pre(&mut self, duration: Time) -> std::result::Result<(), RunFailure> {
        let time = self.time;
        let options = RunOptions {
            log: LogRequest::Flags(LogFlags::NONE),
            ..RunOptions::default()
        };
        self.execute(duration, options, &mut NoProgress, false)?;
        self.time = time;
        self.default_state = self.state.clone();
        Ok(())
    }

    fn failure_before_start(&self, error: IonsimError) -> RunFailure {
        RunFailure::before_start(error, self.time, self.state.clone())
    }

    fn new_log(&self, names: &[String]) -> Result<DataLog> {
        let mut log = match self.definition.topology().time_name() {
            Some(time) => DataLog::with_time_key(time),
            None => DataLog::new(),
        };
        for name in names {
            log.add(name)?;
        }
        Ok(log)
    }

    fn execute(
        &mut self,
        duration: Time,
        options: RunOptions,
        reporter: &mut dyn ProgressReporter,
        log_sensitivities: bool,
    ) -> std::result::Result<RunOutput, RunFailure> {
        if !(duration >= 0.0 && duration.is_finite()) {
            return Err(self.failure_before_start(IonsimError::InvalidInput(format!(
                "Duration must be non-negative, got {duration}"
            ))));
        }
        let tmin = self.time;
        let tmax = tmin + duration;
        let RunOptions {
            log,
            log_times,
            sensitivity_log,
        } = options;
        let log = match log {
            LogRequest::Flags(flags) => self.new_log(&flags.names(self.definition.topology())),
            LogRequest::Names(names) => self.new_log(&names),
            LogRequest::Continue(log) => Ok(log),
        }
        .map_err(|e| self.failure_before_start(e))?;
        let sensitivity_log = match (&self.sensitivities, log_sensitivities) {
            (Some(spec), true) => Some(sensitivity_log.unwrap_or_else(|| {
                SensitivityLog::new(spec.dependents.clone(), spec.independents.clone())
            })),
            _ => None,
        };

        let config = RunConfig {
            tmin,
            tmax,
            state: self.state.clone(),
            state_sensitivities: self.s_state.clone(),
            literals: Some(self.literals.clone()),
            parameters: Some(self.parameters.clone()),
            protocols: self.protocols.clone(),
            log_times,
            solver: self.settings.clone(),
            root: self.root,
            use_cache: self.use_cache,
            log,
            sensitivity_log,
        };
        let mut engine = Engine::new();
        engine
            .init(
                Arc::clone(&self.definition),
                self.sensitivities.as_ref(),
                config,
            )
            .map_err(|e| self.failure_before_start(e))?;

        reporter.enter(&format!(
            "Running {} from t = {tmin} to t = {tmax}",
            self.definition.name()
        ));
        loop {
            match engine.step() {
                Ok(StepStatus::Finished) => break,
                Ok(StepStatus::Running(t)) => {
                    if !reporter.update((t - tmin) / duration) {
                        reporter.exit();
                        let failure = engine.cancel();
                        self.record_failure(&failure);
                        return Err(failure);
                    }
                }
                Err(failure) => {
                    reporter.exit();
                    self.record_failure(&failure);
                    return Err(failure);
                }
            }
        }
        reporter.exit();
        let output = engine
            .finish()
            .map_err(|e| self.failure_before_start(e))?;
        engine.clean();

        self.time = tmax;
        self.state = output.state.clone();
        self.s_state = output.state_sensitivities.clone();
        self.last_state = Some(output.state.clone());
        self.last_evaluations = output.evaluations;
        self.last_steps = output.stats.steps;
        Ok(output)
    }

    fn record_failure(&mut self, failure: &RunFailure) {
        self.last_state = Some(failure.snapshot.state.clone());
        self.last_evaluations = failure.snapshot.evaluations;
        self.last_steps = 0;
    }
}

// ============================================================================
// PARALLEL SWEEPS
// ============================================================================

/// Run an isolated copy of `simulation` for every value of `constant`.
/// Results are in the order of `values`.
pub fn sweep(
    simulation: &Simulation,
    constant: &str,
    values: &[f64],
    duration: Time,
    options: &RunOptions,
) -> Vec<std::result::Result<RunOutput, RunFailure>> {
    values
        .par_iter()
        .map(|&value| {
            let mut sim = simulation.clone();
            sim.set_constant(constant, value)
                .map_err(|e| sim.failure_before_start(e))?;
            sim.run(duration, options.clone())
        })
        .collect()
}

// ============================================================================
// SIMULATION CONFIG
// ============================================================================

/// Threshold for action potential duration measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApdSettings {
    pub variable: String,
    pub threshold: f64,
}

/// JSON description of a simulation.
///
/// ```json
/// {
///   "constants": { "ik.gK": 30.0 },
///   "protocols": {
///     "pace": { "kind": "events", "events": [
///       { "level": 1.0, "start": 5.0, "duration": 0.5, "period": 100.0 }
///     ] }
///   },
///   "duration": 300.0,
///   "log_interval": 0.1,
///   "log": ["engine.time", "membrane.V"],
///   "apd": { "variable": "membrane.V", "threshold": -40.0 }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub constants: BTreeMap<String, f64>,
    pub protocols: BTreeMap<String, ProtocolSpec>,
    pub solver: SolverSettings,
    pub duration: Option<Time>,
    /// Pre-pacing duration
    pub pre: Option<Time>,
    pub log: Vec<String>,
    pub log_flags: Option<LogFlags>,
    pub log_interval: Option<Time>,
    pub log_times: Option<Vec<Time>>,
    pub sensitivities: Option<SensitivitySpec>,
    pub apd: Option<ApdSettings>,
}

impl SimulationConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| IonsimError::InvalidInput(format!("Invalid simulation config: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| IonsimError::InvalidInput(format!("Cannot serialise config: {e}")))
    }

    /// Create a simulation with these constants, protocols and settings.
    pub fn build(&self, definition: Arc<dyn CellModel>) -> Result<Simulation> {
        let mut sim = Simulation::new(definition, self.sensitivities.clone())?;
        for (name, value) in &self.constants {
            sim.set_constant(name, *value)?;
        }
        for (label, spec) in &self.protocols {
            sim.set_protocol_spec(label, Some(spec.clone()))?;
        }
        sim.set_solver_settings(self.solver.clone())?;
        if let Some(apd) = &self.apd {
            sim.set_root_finding(Some((&apd.variable, apd.threshold)))?;
        }
        Ok(sim)
    }

    pub fn log_times(&self) -> Result<LogTimes> {
        match (self.log_interval, &self.log_times) {
            (Some(_), Some(_)) => Err(IonsimError::InvalidInput(
                "A log interval and explicit log times cannot both be given".into(),
            )),
            (Some(interval), None) => Ok(LogTimes::Periodic(interval)),
            (None, Some(points)) => Ok(LogTimes::Points(points.clone())),
            (None, None) => Ok(LogTimes::Dynamic),
        }
    }

    pub fn run_options(&self) -> Result<RunOptions> {
        let log = if !self.log.is_empty() {
            LogRequest::Names(self.log.clone())
        } else {
            self.log_flags
                .map_or_else(LogRequest::default, LogRequest::Flags)
        };
        Ok(RunOptions {
            log,
            log_times: self.log_times()?,
            sensitivity_log: None,
        })
    }
}
