//! # ionsim BDF
//!
//! Variable-order (1-5), variable-step backward differentiation formulas for
//! stiff cell models.
//!
//! The method keeps the solution history as a table of backward differences
//! scaled to the current step size (the form used by Shampine and Reichelt's
//! `ode15s`). Changing the step size is a small linear transformation of that
//! table, and the same table gives a dense-output polynomial for the last step.
//!
//! This crate provides:
//! - Modified Newton iteration with a difference-quotient Jacobian and an LU
//!   factored iteration matrix `I - c*J`
//! - Forward sensitivities carried as extra blocks of the state vector, with a
//!   difference-quotient sensitivity right-hand side
//! - Dense output anywhere inside the last accepted step
//! - Root functions located by the Illinois method on the dense output
//! - The [`Integrator`] trait used by the simulation driver
//!
//! Reference: Shampine, L.F. and Reichelt, M.W. The MATLAB ODE Suite.
//! SIAM J. Sci. Comput. 18(1), 1997.

use ionsim_core::SolverFailureKind;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Dyn, LU};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, SolverFailureKind>;

const MAX_ORDER: usize = 5;
const NEWTON_MAXITER: usize = 4;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const ROOT_MAXITER: usize = 60;
const MAX_HNIL_WARNINGS: u64 = 10;

// ============================================================================
// PROBLEM DEFINITION
// ============================================================================

/// Failure reported by a right-hand side or root function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RhsError {
    /// The solver may retry with a smaller step
    Recoverable,
    /// The solver must stop
    Unrecoverable,
}

/// An initial value problem `dy/dt = f(t, y; p)`.
pub trait OdeProblem {
    /// Dimension of the base system (without sensitivities)
    fn dimension(&self) -> usize;

    /// Evaluate `ydot = f(t, y)` for the base system.
    fn rhs(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> std::result::Result<(), RhsError>;

    /// Number of sensitivity blocks carried alongside the base system
    fn sensitivity_count(&self) -> usize {
        0
    }

    /// Value of the parameter behind sensitivity `index`, or `None` when the
    /// independent is an initial condition.
    fn sensitivity_parameter(&self, _index: usize) -> Option<f64> {
        None
    }

    /// Overwrite the parameter behind sensitivity `index`.
    fn set_sensitivity_parameter(&mut self, _index: usize, _value: f64) {}

    /// Number of root functions
    fn root_count(&self) -> usize {
        0
    }

    /// Evaluate the root functions `g(t, y)`.
    fn roots(&mut self, _t: f64, _y: &[f64], _g: &mut [f64]) -> std::result::Result<(), RhsError> {
        Ok(())
    }
}

// ============================================================================
// OPTIONS AND STATISTICS
// ============================================================================

/// Solver control parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BdfOptions {
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: f64,
    /// Minimum step size (0 = unbounded)
    pub min_step: f64,
    /// Maximum step size (0 = unbounded)
    pub max_step: f64,
    /// Maximum number of steps since initialisation (0 = unbounded)
    pub max_steps: u64,
    /// Highest order used (1-5)
    pub max_order: usize,
    /// Error test failures allowed in a single step
    pub max_error_test_failures: usize,
    /// Newton convergence failures allowed in a single step
    pub max_convergence_failures: usize,
}

impl Default for BdfOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-4,
            atol: 1e-6,
            min_step: 0.0,
            max_step: 0.0,
            max_steps: 0,
            max_order: MAX_ORDER,
            max_error_test_failures: 7,
            max_convergence_failures: 10,
        }
    }
}

impl BdfOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.rtol > 0.0 && self.rtol.is_finite()) {
            return Err(SolverFailureKind::IllegalInput(format!(
                "relative tolerance must be positive, got {}",
                self.rtol
            )));
        }
        if !(self.atol > 0.0 && self.atol.is_finite()) {
            return Err(SolverFailureKind::IllegalInput(format!(
                "absolute tolerance must be positive, got {}",
                self.atol
            )));
        }
        if !(self.min_step >= 0.0 && self.max_step >= 0.0) {
            return Err(SolverFailureKind::IllegalInput(
                "step size bounds must be non-negative".into(),
            ));
        }
        if self.max_step > 0.0 && self.min_step > self.max_step {
            return Err(SolverFailureKind::IllegalInput(format!(
                "minimum step {} exceeds maximum step {}",
                self.min_step, self.max_step
            )));
        }
        if self.max_order == 0 || self.max_order > MAX_ORDER {
            return Err(SolverFailureKind::IllegalInput(format!(
                "order must be between 1 and {MAX_ORDER}, got {}",
                self.max_order
            )));
        }
        if self.max_error_test_failures == 0 || self.max_convergence_failures == 0 {
            return Err(SolverFailureKind::IllegalInput(
                "failure limits must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Counters accumulated over the lifetime of a solver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverStats {
    pub steps: u64,
    pub rhs_evaluations: u64,
    pub jacobian_evaluations: u64,
    pub lu_decompositions: u64,
    pub error_test_failures: u64,
    pub convergence_failures: u64,
    pub zero_length_steps: u64,
}

/// A root function crossing located inside an accepted step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootEvent {
    /// Index of the root function
    pub index: usize,
    /// Located crossing time
    pub time: f64,
    /// +1 for an upward crossing, -1 for a downward one
    pub direction: i32,
}

/// Outcome of one accepted step
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Time before the step
    pub t_previous: f64,
    /// Time after the step (may equal `t_previous` for a zero-length step)
    pub t: f64,
    /// Root crossings in `(t_previous, t]`, sorted by time
    pub roots: Vec<RootEvent>,
}

// ============================================================================
// INTEGRATOR TRAIT
// ============================================================================

/// One-step interface used by the simulation driver.
///
/// The state vector is laid out as `[y, s_0, s_1, ...]`, with one block of
/// `dimension()` values per sensitivity.
pub trait Integrator {
    /// Start a new integration at `(t0, y0)`, resetting statistics.
    fn initialize(&mut self, problem: &mut dyn OdeProblem, t0: f64, y0: &[f64]) -> Result<()>;

    /// Restart at `(t, y)` after an externally forced change; statistics are kept.
    fn reinitialize(&mut self, problem: &mut dyn OdeProblem, t: f64, y: &[f64]) -> Result<()>;

    /// Take one internal step. `tout` is only used to size the first step.
    /// The step may pass `tout`.
    fn step(&mut self, problem: &mut dyn OdeProblem, tout: f64) -> Result<StepReport>;

    /// Dense output at `t` inside the last accepted step. Writes the first
    /// `out.len()` components of the state vector.
    fn interpolate(&self, t: f64, out: &mut [f64]) -> Result<()>;

    /// Current internal time
    fn time(&self) -> f64;

    /// Current solution, including sensitivity blocks
    fn solution(&self) -> &[f64];

    fn stats(&self) -> SolverStats;
}

// ============================================================================
// BDF SOLVER
// ============================================================================

struct NewtonOutcome {
    converged: bool,
    iterations: usize,
    y: DVector<f64>,
    d: DVector<f64>,
    rhs_failed: bool,
}

/// Variable-order BDF solver
pub struct Bdf {
    options: BdfOptions,
    n: usize,
    ns: usize,
    t: f64,
    t_old: f64,
    h_abs: f64,
    order: usize,
    n_equal_steps: usize,
    d: Vec<DVector<f64>>,
    jacobian: Option<DMatrix<f64>>,
    lu: Option<LU<f64, Dyn, Dyn>>,
    newton_tol: f64,
    gamma: [f64; MAX_ORDER + 1],
    alpha: [f64; MAX_ORDER + 1],
    error_const: [f64; MAX_ORDER + 2],
    pbar: Vec<f64>,
    g_old: Vec<f64>,
    needs_first_step: bool,
    initialized: bool,
    stats: SolverStats,
}

impl Bdf {
    pub fn new(options: BdfOptions) -> Result<Self> {
        options.validate()?;
        let mut gamma = [0.0; MAX_ORDER + 1];
        for k in 1..=MAX_ORDER {
            gamma[k] = gamma[k - 1] + 1.0 / k as f64;
        }
        let mut error_const = [0.0; MAX_ORDER + 2];
        for (k, c) in error_const.iter_mut().enumerate() {
            *c = 1.0 / (k as f64 + 1.0);
        }
        Ok(Self {
            newton_tol: newton_tolerance(options.rtol),
            options,
            n: 0,
            ns: 0,
            t: 0.0,
            t_old: 0.0,
            h_abs: 0.0,
            order: 1,
            n_equal_steps: 0,
            d: Vec::new(),
            jacobian: None,
            lu: None,
            gamma,
            // Pure BDF: no NDF correction term
            alpha: gamma,
            error_const,
            pbar: Vec::new(),
            g_old: Vec::new(),
            needs_first_step: true,
            initialized: false,
            stats: SolverStats::default(),
        })
    }

    pub fn options(&self) -> &BdfOptions {
        &self.options
    }

    /// Order used for the next step
    pub fn order(&self) -> usize {
        self.order
    }

    /// Step size proposed for the next step
    pub fn step_size(&self) -> f64 {
        self.h_abs
    }

    fn total_len(&self) -> usize {
        self.n * (1 + self.ns)
    }

    fn setup(&mut self, problem: &mut dyn OdeProblem, t0: f64, y0: &[f64]) -> Result<()> {
        let n = problem.dimension();
        let ns = problem.sensitivity_count();
        if n == 0 {
            return Err(SolverFailureKind::IllegalInput("empty system".into()));
        }
        if y0.len() != n * (1 + ns) {
            return Err(SolverFailureKind::IllegalInput(format!(
                "state vector has {} values, expected {}",
                y0.len(),
                n * (1 + ns)
            )));
        }
        if !t0.is_finite() || y0.iter().any(|v| !v.is_finite()) {
            return Err(SolverFailureKind::IllegalInput(
                "initial time and state must be finite".into(),
            ));
        }

        self.n = n;
        self.ns = ns;
        self.pbar = (0..ns)
            .map(|i| match problem.sensitivity_parameter(i) {
                Some(p) if p != 0.0 => p.abs(),
                _ => 1.0,
            })
            .collect();

        let len = self.total_len();
        let y = DVector::from_column_slice(y0);
        let mut f0 = DVector::zeros(len);
        if self.evaluate(problem, t0, &y, &mut f0).is_err() {
            return Err(SolverFailureKind::FirstRhsFailure);
        }

        self.d = vec![DVector::zeros(len); MAX_ORDER + 3];
        self.d[0] = y;
        // Scaled by the first step size once it is known
        self.d[1] = f0;
        self.t = t0;
        self.t_old = t0;
        self.h_abs = 0.0;
        self.order = 1;
        self.n_equal_steps = 0;
        self.jacobian = None;
        self.lu = None;
        self.needs_first_step = true;

        let nroots = problem.root_count();
        self.g_old = vec![0.0; nroots];
        if nroots > 0 {
            let mut g = vec![0.0; nroots];
            problem
                .roots(t0, &y0[..n], &mut g)
                .map_err(|_| SolverFailureKind::RootFunctionFailure)?;
            self.g_old = g;
        }
        self.initialized = true;
        Ok(())
    }

    /// Full right-hand side: base system plus difference-quotient sensitivities.
    fn evaluate(
        &mut self,
        problem: &mut dyn OdeProblem,
        t: f64,
        y: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> std::result::Result<(), RhsError> {
        let n = self.n;
        let y = y.as_slice();
        let out = out.as_mut_slice();
        let (base, sens) = out.split_at_mut(n);
        problem.rhs(t, &y[..n], base)?;
        self.stats.rhs_evaluations += 1;
        if base.iter().any(|v| !v.is_finite()) {
            return Err(RhsError::Recoverable);
        }
        if self.ns == 0 {
            return Ok(());
        }

        let rtol = self.options.rtol;
        let atol = self.options.atol;
        let delta = rtol.max(f64::EPSILON).sqrt();
        let mut ytemp = vec![0.0; n];
        let mut ftemp = vec![0.0; n];
        for (i, sdot) in sens.chunks_mut(n).enumerate() {
            let s = &y[n * (i + 1)..n * (i + 2)];
            let pbar = self.pbar[i];
            let norm_s = rms((0..n).map(|j| s[j] / (atol + rtol * y[j].abs()))) * pbar;
            let delta_y = pbar / norm_s.max(1.0 / delta);
            let parameter = problem.sensitivity_parameter(i);
            let sigma = match parameter {
                Some(_) => delta_y.min(pbar * delta),
                None => delta_y,
            };

            for j in 0..n {
                ytemp[j] = y[j] + sigma * s[j];
            }
            if let Some(p) = parameter {
                problem.set_sensitivity_parameter(i, p + sigma);
            }
            let result = problem.rhs(t, &ytemp, &mut ftemp);
            if let Some(p) = parameter {
                problem.set_sensitivity_parameter(i, p);
            }
            result?;
            self.stats.rhs_evaluations += 1;

            for j in 0..n {
                sdot[j] = (ftemp[j] - base[j]) / sigma;
            }
            if sdot.iter().any(|v| !v.is_finite()) {
                return Err(RhsError::Recoverable);
            }
        }
        Ok(())
    }

    /// Difference-quotient Jacobian of the base system.
    fn compute_jacobian(
        &mut self,
        problem: &mut dyn OdeProblem,
        t: f64,
        y: &DVector<f64>,
    ) -> std::result::Result<DMatrix<f64>, RhsError> {
        let n = self.n;
        let srur = f64::EPSILON.sqrt();
        let mut yb: Vec<f64> = y.as_slice()[..n].to_vec();
        let mut f0 = vec![0.0; n];
        let mut f1 = vec![0.0; n];
        problem.rhs(t, &yb, &mut f0)?;
        self.stats.rhs_evaluations += 1;

        let mut jac = DMatrix::zeros(n, n);
        for j in 0..n {
            let saved = yb[j];
            let scale = self.options.atol + self.options.rtol * saved.abs();
            yb[j] = saved + srur * saved.abs().max(scale);
            let inc = yb[j] - saved;
            problem.rhs(t, &yb, &mut f1)?;
            self.stats.rhs_evaluations += 1;
            yb[j] = saved;
            for i in 0..n {
                jac[(i, j)] = (f1[i] - f0[i]) / inc;
            }
        }
        if jac.iter().any(|v| !v.is_finite()) {
            return Err(RhsError::Recoverable);
        }
        self.stats.jacobian_evaluations += 1;
        Ok(jac)
    }

    fn factor_iteration_matrix(&mut self, c: f64) -> bool {
        let Some(jac) = self.jacobian.as_ref() else {
            return false;
        };
        let n = self.n;
        let m = DMatrix::identity(n, n) - jac * c;
        let lu = m.lu();
        self.stats.lu_decompositions += 1;
        if lu.is_invertible() {
            self.lu = Some(lu);
            true
        } else {
            self.lu = None;
            false
        }
    }

    /// Solve the block-diagonal Newton system, one base-sized block at a time.
    fn solve_blocks(&self, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        let lu = self.lu.as_ref()?;
        let n = self.n;
        let mut out = DVector::zeros(rhs.len());
        for (block, chunk) in rhs.as_slice().chunks(n).enumerate() {
            let x = lu.solve(&DVector::from_column_slice(chunk))?;
            out.rows_mut(block * n, n).copy_from(&x);
        }
        Some(out)
    }

    fn newton(
        &mut self,
        problem: &mut dyn OdeProblem,
        t_new: f64,
        y_predict: &DVector<f64>,
        c: f64,
        psi: &DVector<f64>,
        scale: &DVector<f64>,
    ) -> Result<NewtonOutcome> {
        let len = y_predict.len();
        let mut d = DVector::zeros(len);
        let mut y = y_predict.clone();
        let mut f = DVector::zeros(len);
        let mut dy_norm_old: Option<f64> = None;
        let mut converged = false;
        let mut rhs_failed = false;
        let mut iterations = 0;

        for k in 0..NEWTON_MAXITER {
            iterations = k + 1;
            match self.evaluate(problem, t_new, &y, &mut f) {
                Ok(()) => {}
                Err(RhsError::Recoverable) => {
                    rhs_failed = true;
                    break;
                }
                Err(RhsError::Unrecoverable) => return Err(SolverFailureKind::RhsFailure),
            }

            let residual = &f * c - psi - &d;
            let Some(dy) = self.solve_blocks(&residual) else {
                break;
            };
            let dy_norm = weighted_rms(&dy, scale);
            let rate = dy_norm_old.map(|old| dy_norm / old);

            if let Some(rate) = rate {
                if rate >= 1.0
                    || rate.powi((NEWTON_MAXITER - k) as i32) / (1.0 - rate) * dy_norm
                        > self.newton_tol
                {
                    break;
                }
            }

            y += &dy;
            d += &dy;

            if dy_norm == 0.0
                || rate.is_some_and(|rate| rate / (1.0 - rate) * dy_norm < self.newton_tol)
            {
                converged = true;
                break;
            }
            dy_norm_old = Some(dy_norm);
        }

        Ok(NewtonOutcome {
            converged,
            iterations,
            y,
            d,
            rhs_failed,
        })
    }

    fn select_initial_step(&mut self, problem: &mut dyn OdeProblem, tout: f64) -> Result<f64> {
        let interval = tout - self.t;
        if !(interval > 2.0 * f64::EPSILON * self.t.abs().max(tout.abs())) {
            return Err(SolverFailureKind::TooClose);
        }

        let y0 = self.d[0].clone();
        let f0 = self.d[1].clone();
        let scale = self.scale_of(&y0);
        let d0 = weighted_rms(&y0, &scale);
        let d1 = weighted_rms(&f0, &scale);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
        let h0 = h0.min(interval);

        let y1 = &y0 + &f0 * h0;
        let mut f1 = DVector::zeros(y0.len());
        self.evaluate(problem, self.t + h0, &y1, &mut f1)
            .map_err(|_| SolverFailureKind::RhsFailure)?;
        let d2 = weighted_rms(&(&f1 - &f0), &scale) / h0;

        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(1.0 / (self.order as f64 + 1.0))
        };

        let mut h = (100.0 * h0).min(h1).min(interval);
        if self.options.max_step > 0.0 {
            h = h.min(self.options.max_step);
        }
        Ok(h.max(self.options.min_step))
    }

    fn scale_of(&self, y: &DVector<f64>) -> DVector<f64> {
        y.map(|v| self.options.atol + self.options.rtol * v.abs())
    }

    fn rescale(&mut self, factor: f64) {
        self.h_abs *= factor;
        change_differences(&mut self.d, self.order, factor);
        self.n_equal_steps = 0;
    }

    fn advance(&mut self, problem: &mut dyn OdeProblem) -> Result<NewtonOutcomeAccepted> {
        let order = self.order;
        let mut jacobian_fresh = false;
        let mut error_failures = 0;
        let mut convergence_failures = 0;

        loop {
            if !(self.h_abs > 0.0 && self.h_abs.is_finite()) {
                return Err(SolverFailureKind::TooMuchAccuracy);
            }
            let h = self.h_abs;
            let t_new = self.t + h;

            let mut y_predict = self.d[0].clone();
            for row in &self.d[1..=order] {
                y_predict += row;
            }
            let scale = self.scale_of(&y_predict);
            let mut psi = DVector::zeros(y_predict.len());
            for (row, gamma) in self.d[1..=order].iter().zip(&self.gamma[1..=order]) {
                psi.axpy(*gamma, row, 1.0);
            }
            psi /= self.alpha[order];
            let c = h / self.alpha[order];

            let mut outcome = None;
            let mut rhs_failed = false;
            loop {
                if self.jacobian.is_none() {
                    match self.compute_jacobian(problem, t_new, &y_predict) {
                        Ok(jac) => self.jacobian = Some(jac),
                        Err(RhsError::Unrecoverable) => return Err(SolverFailureKind::RhsFailure),
                        Err(RhsError::Recoverable) => {
                            rhs_failed = true;
                            break;
                        }
                    }
                    jacobian_fresh = true;
                    self.lu = None;
                }
                if self.lu.is_none() && !self.factor_iteration_matrix(c) {
                    if jacobian_fresh {
                        break;
                    }
                    self.jacobian = None;
                    continue;
                }
                let result = self.newton(problem, t_new, &y_predict, c, &psi, &scale)?;
                rhs_failed = result.rhs_failed;
                let done = result.converged || jacobian_fresh;
                outcome = Some(result);
                if done {
                    break;
                }
                self.jacobian = None;
            }

            let outcome = match outcome {
                Some(outcome) if outcome.converged => outcome,
                _ => {
                    convergence_failures += 1;
                    self.stats.convergence_failures += 1;
                    let at_min = self.options.min_step > 0.0 && h <= self.options.min_step;
                    if convergence_failures >= self.options.max_convergence_failures || at_min {
                        return Err(if rhs_failed {
                            SolverFailureKind::RepeatedRhsFailures
                        } else {
                            SolverFailureKind::ConvergenceFailures
                        });
                    }
                    let factor = self.bounded_factor(0.5);
                    self.rescale(factor);
                    self.lu = None;
                    continue;
                }
            };

            let safety = 0.9 * (2 * NEWTON_MAXITER + 1) as f64
                / (2 * NEWTON_MAXITER + outcome.iterations) as f64;
            let scale = self.scale_of(&outcome.y);
            let error_norm = weighted_rms(&(&outcome.d * self.error_const[order]), &scale);

            if error_norm > 1.0 {
                error_failures += 1;
                self.stats.error_test_failures += 1;
                let at_min = self.options.min_step > 0.0 && h <= self.options.min_step;
                if error_failures >= self.options.max_error_test_failures || at_min {
                    return Err(SolverFailureKind::ErrorTestFailures);
                }
                let factor = MIN_FACTOR.max(safety * error_norm.powf(-1.0 / (order as f64 + 1.0)));
                let factor = self.bounded_factor(factor);
                self.rescale(factor);
                continue;
            }

            return Ok(NewtonOutcomeAccepted {
                t_new,
                y: outcome.y,
                d: outcome.d,
                safety,
                error_norm,
                scale,
            });
        }
    }

    /// Shrink factor limited so the step never drops below the minimum step.
    fn bounded_factor(&self, factor: f64) -> f64 {
        if self.options.min_step > 0.0 {
            factor.max(self.options.min_step / self.h_abs)
        } else {
            factor
        }
    }

    fn locate_roots(&mut self, problem: &mut dyn OdeProblem) -> Result<Vec<RootEvent>> {
        let nroots = self.g_old.len();
        if nroots == 0 {
            return Ok(Vec::new());
        }
        let n = self.n;
        let mut g_new = vec![0.0; nroots];
        problem
            .roots(self.t, &self.d[0].as_slice()[..n], &mut g_new)
            .map_err(|_| SolverFailureKind::RootFunctionFailure)?;

        let mut events = Vec::new();
        let mut y = vec![0.0; n];
        let mut g = vec![0.0; nroots];
        let ttol = 100.0 * f64::EPSILON * (self.t.abs() + (self.t - self.t_old).abs());
        for index in 0..nroots {
            let (ga, gb) = (self.g_old[index], g_new[index]);
            if ga == 0.0 || ga.signum() == gb.signum() && gb != 0.0 {
                continue;
            }
            let direction = if ga < 0.0 { 1 } else { -1 };

            // Illinois method on [a, b], keeping a sign change inside
            let (mut a, mut b) = (self.t_old, self.t);
            let (mut fa, mut fb) = (ga, gb);
            let mut side = 0;
            for _ in 0..ROOT_MAXITER {
                if fb == 0.0 || b - a <= ttol {
                    break;
                }
                let mut tm = b - fb * (b - a) / (fb - fa);
                if !(tm > a && tm < b) {
                    tm = 0.5 * (a + b);
                }
                self.interpolate_prefix(tm, &mut y);
                problem
                    .roots(tm, &y, &mut g)
                    .map_err(|_| SolverFailureKind::RootFunctionFailure)?;
                let fm = g[index];
                if fm == 0.0 {
                    b = tm;
                    fb = fm;
                } else if fm.signum() == fa.signum() {
                    a = tm;
                    fa = fm;
                    if side == -1 {
                        fb *= 0.5;
                    }
                    side = -1;
                } else {
                    b = tm;
                    fb = fm;
                    if side == 1 {
                        fa *= 0.5;
                    }
                    side = 1;
                }
            }
            events.push(RootEvent {
                index,
                time: b,
                direction,
            });
        }
        self.g_old = g_new;
        events.sort_by(|x, y| x.time.total_cmp(&y.time));
        Ok(events)
    }

    /// Evaluate the dense-output polynomial without range checks.
    fn interpolate_prefix(&self, t: f64, out: &mut [f64]) {
        let len = out.len();
        out.copy_from_slice(&self.d[0].as_slice()[..len]);
        if self.t == self.t_old || self.h_abs == 0.0 {
            return;
        }
        let h = self.h_abs;
        let mut p = 1.0;
        for j in 0..self.order {
            let shift = self.t - h * j as f64;
            p *= (t - shift) / (h * (j as f64 + 1.0));
            let row = &self.d[j + 1].as_slice()[..len];
            for (o, r) in out.iter_mut().zip(row) {
                *o += p * r;
            }
        }
    }
}

struct NewtonOutcomeAccepted {
    t_new: f64,
    y: DVector<f64>,
    d: DVector<f64>,
    safety: f64,
    error_norm: f64,
    scale: DVector<f64>,
}

impl Integrator for Bdf {
    fn initialize(&mut self, problem: &mut dyn OdeProblem, t0: f64, y0: &[f64]) -> Result<()> {
        self.stats = SolverStats::default();
        self.setup(problem, t0, y0)?;
        debug!("BDF initialised at t = {t0} with {} equations", y0.len());
        Ok(())
    }

    fn reinitialize(&mut self, problem: &mut dyn OdeProblem, t: f64, y: &[f64]) -> Result<()> {
        self.setup(problem, t, y)
    }

    fn step(&mut self, problem: &mut dyn OdeProblem, tout: f64) -> Result<StepReport> {
        if !self.initialized {
            return Err(SolverFailureKind::IllegalInput(
                "solver used before initialisation".into(),
            ));
        }
        if self.options.max_steps > 0 && self.stats.steps >= self.options.max_steps {
            return Err(SolverFailureKind::TooMuchWork);
        }

        if self.needs_first_step {
            let h = self.select_initial_step(problem, tout)?;
            self.h_abs = h;
            self.d[1] *= h;
            self.needs_first_step = false;
        }

        let scale = self.scale_of(&self.d[0]);
        if f64::EPSILON * weighted_rms(&self.d[0], &scale) > 1.0 {
            return Err(SolverFailureKind::TooMuchAccuracy);
        }

        if self.options.max_step > 0.0 && self.h_abs > self.options.max_step {
            let factor = self.options.max_step / self.h_abs;
            self.rescale(factor);
            self.lu = None;
        } else if self.options.min_step > 0.0 && self.h_abs < self.options.min_step {
            let factor = self.options.min_step / self.h_abs;
            self.rescale(factor);
            self.lu = None;
        }

        let accepted = self.advance(problem)?;
        let order = self.order;

        self.n_equal_steps += 1;
        self.t_old = self.t;
        self.t = accepted.t_new;
        self.stats.steps += 1;
        if self.t == self.t_old {
            self.stats.zero_length_steps += 1;
            if self.stats.zero_length_steps <= MAX_HNIL_WARNINGS {
                warn!(
                    "t + h = t on the next step (t = {}, h = {:e}); the step has no effect on time",
                    self.t, self.h_abs
                );
            }
        }

        self.d[order + 2] = &accepted.d - &self.d[order + 1];
        self.d[order + 1] = accepted.d;
        for i in (0..=order).rev() {
            let next = self.d[i + 1].clone();
            self.d[i] += next;
        }
        // Corrected value replaces the accumulated prediction
        self.d[0].copy_from(&accepted.y);

        if self.n_equal_steps >= order + 1 {
            let max_order = self.options.max_order;
            let error_m_norm = if order > 1 {
                weighted_rms(&(&self.d[order] * self.error_const[order - 1]), &accepted.scale)
            } else {
                f64::INFINITY
            };
            let error_p_norm = if order < max_order {
                weighted_rms(&(&self.d[order + 2] * self.error_const[order + 1]), &accepted.scale)
            } else {
                f64::INFINITY
            };

            let norms = [error_m_norm, accepted.error_norm, error_p_norm];
            let mut best = 0;
            let mut best_factor = f64::NEG_INFINITY;
            for (k, norm) in norms.iter().enumerate() {
                let factor = norm.powf(-1.0 / (order + k) as f64);
                if factor > best_factor {
                    best = k;
                    best_factor = factor;
                }
            }
            self.order = order + best - 1;
            let factor = MAX_FACTOR.min(accepted.safety * best_factor);
            self.rescale(factor);
            self.lu = None;
        }

        let roots = self.locate_roots(problem)?;
        Ok(StepReport {
            t_previous: self.t_old,
            t: self.t,
            roots,
        })
    }

    fn interpolate(&self, t: f64, out: &mut [f64]) -> Result<()> {
        if !self.initialized {
            return Err(SolverFailureKind::IllegalInput(
                "solver used before initialisation".into(),
            ));
        }
        if out.len() > self.total_len() {
            return Err(SolverFailureKind::IllegalInput(format!(
                "requested {} values, solution has {}",
                out.len(),
                self.total_len()
            )));
        }
        let tol = 100.0 * f64::EPSILON * (self.t.abs() + (self.t - self.t_old).abs());
        if t < self.t_old - tol || t > self.t + tol {
            return Err(SolverFailureKind::IllegalInput(format!(
                "t = {t} is outside the last step [{}, {}]",
                self.t_old, self.t
            )));
        }
        self.interpolate_prefix(t, out);
        Ok(())
    }

    fn time(&self) -> f64 {
        self.t
    }

    fn solution(&self) -> &[f64] {
        self.d.first().map(|y| y.as_slice()).unwrap_or(&[])
    }

    fn stats(&self) -> SolverStats {
        self.stats
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn newton_tolerance(rtol: f64) -> f64 {
    (10.0 * f64::EPSILON / rtol).max(0.03_f64.min(rtol.sqrt()))
}

fn rms(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v * v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

fn weighted_rms(x: &DVector<f64>, scale: &DVector<f64>) -> f64 {
    rms(x.iter().zip(scale.iter()).map(|(v, s)| v / s))
}

/// Matrix that rescales the difference table from step `h` to `factor * h`.
fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(order + 1, order + 1);
    for j in 0..=order {
        m[(0, j)] = 1.0;
    }
    for i in 1..=order {
        for j in 1..=order {
            m[(i, j)] = (i as f64 - 1.0 - factor * j as f64) / i as f64;
        }
    }
    for i in 1..=order {
        for j in 0..=order {
            m[(i, j)] *= m[(i - 1, j)];
        }
    }
    m
}

fn change_differences(d: &mut [DVector<f64>], order: usize, factor: f64) {
    let r = compute_r(order, factor);
    let u = compute_r(order, 1.0);
    let ru = r * u;
    let old: Vec<DVector<f64>> = d[..=order].to_vec();
    for (i, row) in d[..=order].iter_mut().enumerate() {
        row.fill(0.0);
        for (j, previous) in old.iter().enumerate() {
            row.axpy(ru[(j, i)], previous, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    struct Decay {
        k: f64,
        threshold: Option<f64>,
        sensitivities: usize,
    }

    impl OdeProblem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&mut self, _t: f64, y: &[f64], ydot: &mut [f64]) -> std::result::Result<(), RhsError> {
            ydot[0] = -self.k * y[0];
            Ok(())
        }

        fn sensitivity_count(&self) -> usize {
            self.sensitivities
        }

        fn sensitivity_parameter(&self, index: usize) -> Option<f64> {
            (index == 0).then_some(self.k)
        }

        fn set_sensitivity_parameter(&mut self, index: usize, value: f64) {
            if index == 0 {
                self.k = value;
            }
        }

        fn root_count(&self) -> usize {
            usize::from(self.threshold.is_some())
        }

        fn roots(&mut self, _t: f64, y: &[f64], g: &mut [f64]) -> std::result::Result<(), RhsError> {
            if let Some(threshold) = self.threshold {
                g[0] = y[0] - threshold;
            }
            Ok(())
        }
    }

    /// Robertson's chemical kinetics, a classic stiff test problem
    struct Robertson;

    impl OdeProblem for Robertson {
        fn dimension(&self) -> usize {
            3
        }

        fn rhs(&mut self, _t: f64, y: &[f64], ydot: &mut [f64]) -> std::result::Result<(), RhsError> {
            ydot[0] = -0.04 * y[0] + 1e4 * y[1] * y[2];
            ydot[2] = 3e7 * y[1] * y[1];
            ydot[1] = -ydot[0] - ydot[2];
            Ok(())
        }
    }

    fn integrate_to(solver: &mut Bdf, problem: &mut dyn OdeProblem, tend: f64) -> Vec<f64> {
        while solver.time() < tend {
            solver.step(problem, tend).unwrap();
        }
        let mut out = vec![0.0; solver.solution().len()];
        solver.interpolate(tend, &mut out).unwrap();
        out
    }

    fn tight() -> BdfOptions {
        BdfOptions {
            rtol: 1e-6,
            atol: 1e-8,
            ..BdfOptions::default()
        }
    }

    #[test]
    fn test_exponential_decay() {
        let mut problem = Decay { k: 1.0, threshold: None, sensitivities: 0 };
        let mut solver = Bdf::new(tight()).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0]).unwrap();
        let y = integrate_to(&mut solver, &mut problem, 5.0);
        assert_abs_diff_eq!(y[0], (-5.0f64).exp(), epsilon = 1e-5);
        assert!(solver.stats().steps > 10);
    }

    #[test]
    fn test_robertson_stiff() {
        let mut problem = Robertson;
        let options = BdfOptions {
            rtol: 1e-5,
            atol: 1e-9,
            ..BdfOptions::default()
        };
        let mut solver = Bdf::new(options).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0, 0.0, 0.0]).unwrap();
        let y = integrate_to(&mut solver, &mut problem, 40.0);
        assert_abs_diff_eq!(y[0], 0.7158, epsilon = 1e-3);
        assert_abs_diff_eq!(y[2], 0.2842, epsilon = 1e-3);
        assert_abs_diff_eq!(y[0] + y[1] + y[2], 1.0, epsilon = 1e-5);
        // A non-stiff method would need hundreds of thousands of steps
        assert!(solver.stats().steps < 2000);
    }

    #[test]
    fn test_dense_output_inside_last_step() {
        let mut problem = Decay { k: 1.0, threshold: None, sensitivities: 0 };
        let mut solver = Bdf::new(tight()).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0]).unwrap();
        for _ in 0..20 {
            solver.step(&mut problem, 10.0).unwrap();
        }
        let report = solver.step(&mut problem, 10.0).unwrap();
        let mid = 0.5 * (report.t_previous + report.t);
        let mut y = [0.0];
        solver.interpolate(mid, &mut y).unwrap();
        assert_abs_diff_eq!(y[0], (-mid).exp(), epsilon = 1e-5);

        assert!(solver.interpolate(report.t + 1.0, &mut y).is_err());
    }

    #[test]
    fn test_reinitialize_keeps_statistics() {
        let mut problem = Decay { k: 2.0, threshold: None, sensitivities: 0 };
        let mut solver = Bdf::new(BdfOptions::default()).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0]).unwrap();
        solver.step(&mut problem, 1.0).unwrap();
        let steps = solver.stats().steps;
        solver.reinitialize(&mut problem, 0.5, &[3.0]).unwrap();
        assert_eq!(solver.time(), 0.5);
        assert_eq!(solver.solution(), &[3.0]);
        assert_eq!(solver.stats().steps, steps);
    }

    #[test]
    fn test_parameter_sensitivity() {
        let mut problem = Decay { k: 1.0, threshold: None, sensitivities: 1 };
        let mut solver = Bdf::new(tight()).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0, 0.0]).unwrap();
        let y = integrate_to(&mut solver, &mut problem, 2.0);
        assert_abs_diff_eq!(y[0], (-2.0f64).exp(), epsilon = 1e-5);
        // d/dk exp(-k t) = -t exp(-k t)
        assert_abs_diff_eq!(y[1], -2.0 * (-2.0f64).exp(), epsilon = 1e-3);
        // The parameter is restored after every perturbation
        assert_eq!(problem.k, 1.0);
    }

    #[test]
    fn test_root_location() {
        let mut problem = Decay { k: 1.0, threshold: Some(0.5), sensitivities: 0 };
        let mut solver = Bdf::new(tight()).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0]).unwrap();
        let mut found = Vec::new();
        while solver.time() < 2.0 {
            found.extend(solver.step(&mut problem, 2.0).unwrap().roots);
        }
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].direction, -1);
        assert_abs_diff_eq!(found[0].time, 2f64.ln(), epsilon = 1e-4);
    }

    #[test]
    fn test_too_close() {
        let mut problem = Decay { k: 1.0, threshold: None, sensitivities: 0 };
        let mut solver = Bdf::new(BdfOptions::default()).unwrap();
        solver.initialize(&mut problem, 1.0, &[1.0]).unwrap();
        assert_eq!(solver.step(&mut problem, 1.0), Err(SolverFailureKind::TooClose));
    }

    #[test]
    fn test_invalid_options() {
        let options = BdfOptions { rtol: 0.0, ..BdfOptions::default() };
        assert!(matches!(Bdf::new(options), Err(SolverFailureKind::IllegalInput(_))));
        let options = BdfOptions { min_step: 2.0, max_step: 1.0, ..BdfOptions::default() };
        assert!(Bdf::new(options).is_err());
    }

    #[test]
    fn test_max_step_respected() {
        let mut problem = Decay { k: 0.1, threshold: None, sensitivities: 0 };
        let options = BdfOptions { max_step: 0.25, ..BdfOptions::default() };
        let mut solver = Bdf::new(options).unwrap();
        solver.initialize(&mut problem, 0.0, &[1.0]).unwrap();
        for _ in 0..50 {
            let report = solver.step(&mut problem, 100.0).unwrap();
            assert!(report.t - report.t_previous <= 0.25 + 1e-12);
        }
    }

    #[test]
    fn test_unrecoverable_rhs_is_reported() {
        struct Broken;
        impl OdeProblem for Broken {
            fn dimension(&self) -> usize {
                1
            }
            fn rhs(&mut self, _t: f64, _y: &[f64], _ydot: &mut [f64]) -> std::result::Result<(), RhsError> {
                Err(RhsError::Unrecoverable)
            }
        }
        let mut solver = Bdf::new(BdfOptions::default()).unwrap();
        assert_eq!(
            solver.initialize(&mut Broken, 0.0, &[1.0]),
            Err(SolverFailureKind::FirstRhsFailure)
        );
    }
}
