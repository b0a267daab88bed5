//! # ionsim Model
//!
//! The numeric side of a compiled cell model.
//!
//! ## Components
//!
//! - [`CellModel`]: the contract a generated (or hand-written) model fulfils:
//!   a fixed [`Topology`], the right-hand side, and the literal / parameter
//!   derived updates
//! - [`Model`]: the state container for one run. It owns every per-variable
//!   buffer, keeps derived quantities consistent, caches the last right-hand
//!   side evaluation and counts evaluations
//! - Sensitivity evaluation: output sensitivities (dependents x independents)
//!   through the chain rule, using the state sensitivities and directional
//!   differences of the right-hand side
//! - [`RateFunction`]: Hodgkin-Huxley style gating kinetics
//! - [`models`]: built-in reference models

use ionsim_core::{try_zeroed, IonsimError, Result, Time, Voltage};
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// TOPOLOGY
// ============================================================================

/// A state variable and whether its initial value is a plain literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub name: String,
    /// False when the initial value is an expression of other variables
    pub literal_initial: bool,
}

/// A named constant with its default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub name: String,
    pub value: f64,
}

/// External inputs a variable can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    Time,
    /// Pacing level for the protocol registered under this label
    Pace(String),
    Realtime,
    Evaluations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundVariable {
    pub name: String,
    pub binding: Binding,
}

/// Any variable of a model, by category and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    State(usize),
    Derivative(usize),
    Bound(usize),
    Intermediary(usize),
    Literal(usize),
    LiteralDerived(usize),
    Parameter(usize),
    ParameterDerived(usize),
}

/// Loggable variable categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableCategory {
    State,
    Derivative,
    Bound,
    Intermediary,
}

impl Variable {
    /// Category for logging purposes; constants are not loggable.
    pub fn category(&self) -> Option<VariableCategory> {
        match self {
            Self::State(_) => Some(VariableCategory::State),
            Self::Derivative(_) => Some(VariableCategory::Derivative),
            Self::Bound(_) => Some(VariableCategory::Bound),
            Self::Intermediary(_) => Some(VariableCategory::Intermediary),
            _ => None,
        }
    }
}

/// Fixed shape of a model: its variables, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub states: Vec<StateInfo>,
    pub intermediaries: Vec<String>,
    pub literals: Vec<Constant>,
    pub literal_derived: Vec<String>,
    pub parameters: Vec<Constant>,
    pub parameter_derived: Vec<String>,
    pub bound: Vec<BoundVariable>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, name: &str, literal_initial: bool) -> Self {
        self.states.push(StateInfo {
            name: name.to_string(),
            literal_initial,
        });
        self
    }

    pub fn intermediary(mut self, name: &str) -> Self {
        self.intermediaries.push(name.to_string());
        self
    }

    pub fn literal(mut self, name: &str, value: f64) -> Self {
        self.literals.push(Constant {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn literal_derived(mut self, name: &str) -> Self {
        self.literal_derived.push(name.to_string());
        self
    }

    pub fn parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.push(Constant {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn parameter_derived(mut self, name: &str) -> Self {
        self.parameter_derived.push(name.to_string());
        self
    }

    pub fn bind(mut self, name: &str, binding: Binding) -> Self {
        self.bound.push(BoundVariable {
            name: name.to_string(),
            binding,
        });
        self
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// Labels of the pace bindings, in the order of the model's pace vector.
    pub fn pace_labels(&self) -> Vec<&str> {
        self.bound
            .iter()
            .filter_map(|b| match &b.binding {
                Binding::Pace(label) => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Name of the variable bound to time, if any.
    pub fn time_name(&self) -> Option<&str> {
        self.bound
            .iter()
            .find(|b| b.binding == Binding::Time)
            .map(|b| b.name.as_str())
    }

    /// Resolve a fully qualified name. Derivatives are written `dot(name)`.
    pub fn resolve(&self, name: &str) -> Option<Variable> {
        if let Some(inner) = name.strip_prefix("dot(").and_then(|s| s.strip_suffix(')')) {
            return self
                .states
                .iter()
                .position(|s| s.name == inner)
                .map(Variable::Derivative);
        }
        if let Some(i) = position_of(self.states.iter().map(|s| s.name.as_str()), name) {
            return Some(Variable::State(i));
        }
        if let Some(i) = position_of(self.bound.iter().map(|b| b.name.as_str()), name) {
            return Some(Variable::Bound(i));
        }
        if let Some(i) = position_of(self.intermediaries.iter().map(String::as_str), name) {
            return Some(Variable::Intermediary(i));
        }
        if let Some(i) = position_of(self.literals.iter().map(|c| c.name.as_str()), name) {
            return Some(Variable::Literal(i));
        }
        if let Some(i) = position_of(self.literal_derived.iter().map(String::as_str), name) {
            return Some(Variable::LiteralDerived(i));
        }
        if let Some(i) = position_of(self.parameters.iter().map(|c| c.name.as_str()), name) {
            return Some(Variable::Parameter(i));
        }
        position_of(self.parameter_derived.iter().map(String::as_str), name)
            .map(Variable::ParameterDerived)
    }

    /// Fully qualified name of `variable`.
    pub fn name_of(&self, variable: Variable) -> String {
        let name = match variable {
            Variable::State(i) => self.states.get(i).map(|s| s.name.clone()),
            Variable::Derivative(i) => self.states.get(i).map(|s| format!("dot({})", s.name)),
            Variable::Bound(i) => self.bound.get(i).map(|b| b.name.clone()),
            Variable::Intermediary(i) => self.intermediaries.get(i).cloned(),
            Variable::Literal(i) => self.literals.get(i).map(|c| c.name.clone()),
            Variable::LiteralDerived(i) => self.literal_derived.get(i).cloned(),
            Variable::Parameter(i) => self.parameters.get(i).map(|c| c.name.clone()),
            Variable::ParameterDerived(i) => self.parameter_derived.get(i).cloned(),
        };
        name.unwrap_or_default()
    }

    /// All loggable variables of one category, in model order.
    pub fn variables(&self, category: VariableCategory) -> Vec<Variable> {
        match category {
            VariableCategory::State => (0..self.states.len()).map(Variable::State).collect(),
            VariableCategory::Derivative => {
                (0..self.states.len()).map(Variable::Derivative).collect()
            }
            VariableCategory::Bound => (0..self.bound.len()).map(Variable::Bound).collect(),
            VariableCategory::Intermediary => (0..self.intermediaries.len())
                .map(Variable::Intermediary)
                .collect(),
        }
    }

    /// Check that names are unique and at most one variable is bound to
    /// each of time, realtime and evaluations.
    pub fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = Vec::new();
        names.extend(self.states.iter().map(|s| s.name.as_str()));
        names.extend(self.intermediaries.iter().map(String::as_str));
        names.extend(self.literals.iter().map(|c| c.name.as_str()));
        names.extend(self.literal_derived.iter().map(String::as_str));
        names.extend(self.parameters.iter().map(|c| c.name.as_str()));
        names.extend(self.parameter_derived.iter().map(String::as_str));
        names.extend(self.bound.iter().map(|b| b.name.as_str()));
        let mut sorted = names.clone();
        sorted.sort_unstable();
        if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(IonsimError::InvalidInput(format!(
                "Duplicate variable name: {}",
                w[0]
            )));
        }
        for binding in [Binding::Time, Binding::Realtime, Binding::Evaluations] {
            if self.bound.iter().filter(|b| b.binding == binding).count() > 1 {
                return Err(IonsimError::InvalidInput(format!(
                    "More than one variable bound to {binding:?}"
                )));
            }
        }
        let labels = self.pace_labels();
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(IonsimError::InvalidInput(format!(
                    "More than one variable bound to pace label {label}"
                )));
            }
        }
        Ok(())
    }
}

fn position_of<'a>(mut names: impl Iterator<Item = &'a str>, name: &str) -> Option<usize> {
    names.position(|n| n == name)
}

// ============================================================================
// CELL MODEL CONTRACT
// ============================================================================

/// Inputs of one right-hand side evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RhsInput<'a> {
    pub time: Time,
    /// Pacing levels, one per pace binding
    pub pace: &'a [f64],
    pub states: &'a [f64],
    pub literals: &'a [f64],
    pub literal_derived: &'a [f64],
    pub parameters: &'a [f64],
    pub parameter_derived: &'a [f64],
}

/// Outputs of one right-hand side evaluation.
#[derive(Debug)]
pub struct RhsOutput<'a> {
    pub derivatives: &'a mut [f64],
    pub intermediary: &'a mut [f64],
}

/// A compiled cell model.
///
/// Implementations must be pure: the outputs of [`CellModel::rhs`] depend
/// only on its inputs. Parameters may not depend on other variables.
pub trait CellModel: Send + Sync {
    fn name(&self) -> &str;

    fn topology(&self) -> &Topology;

    /// Recompute literal-derived values from the literals.
    fn update_literal_derived(&self, _literals: &[f64], _out: &mut [f64]) {}

    /// Recompute parameter-derived values from the parameters.
    fn update_parameter_derived(&self, _parameters: &[f64], _out: &mut [f64]) {}

    /// Default initial state for the given literals.
    fn initial_state(&self, literals: &[f64], literal_derived: &[f64], out: &mut [f64]);

    /// Evaluate derivatives and intermediary variables.
    fn rhs(&self, input: &RhsInput<'_>, output: &mut RhsOutput<'_>);
}

// ============================================================================
// SENSITIVITY SPECIFICATION
// ============================================================================

/// Names of the quantities to differentiate and what to differentiate against.
///
/// Independents are parameter names or `init(state)` for initial values.
/// Dependents are states, intermediary variables or `dot(state)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivitySpec {
    pub dependents: Vec<String>,
    pub independents: Vec<String>,
}

/// A resolved sensitivity independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Independent {
    Parameter(usize),
    /// Initial value of a state; its value tracks the live state
    InitialState(usize),
}

/// A resolved sensitivity dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependent {
    State(usize),
    Derivative(usize),
    Intermediary(usize),
}

impl SensitivitySpec {
    pub fn new(dependents: Vec<String>, independents: Vec<String>) -> Self {
        Self {
            dependents,
            independents,
        }
    }

    /// Resolve against `topology`, rejecting anything that is not a literal.
    pub fn resolve(&self, topology: &Topology) -> Result<(Vec<Dependent>, Vec<Independent>)> {
        if self.independents.is_empty() || self.dependents.is_empty() {
            return Err(IonsimError::SensitivityConfiguration(
                "At least one dependent and one independent are required".into(),
            ));
        }
        let mut independents = Vec::with_capacity(self.independents.len());
        for name in &self.independents {
            let independent = resolve_independent(topology, name)?;
            if independents.contains(&independent) {
                return Err(IonsimError::SensitivityConfiguration(format!(
                    "Duplicate independent: {name}"
                )));
            }
            independents.push(independent);
        }

        let mut dependents = Vec::with_capacity(self.dependents.len());
        for name in &self.dependents {
            let dependent = match topology.resolve(name) {
                Some(Variable::State(i)) => Dependent::State(i),
                Some(Variable::Derivative(i)) => Dependent::Derivative(i),
                Some(Variable::Intermediary(i)) => Dependent::Intermediary(i),
                Some(_) => {
                    return Err(IonsimError::SensitivityConfiguration(format!(
                        "Dependent {name} must be a state, derivative or intermediary variable"
                    )))
                }
                None => {
                    return Err(IonsimError::SensitivityConfiguration(format!(
                        "Unknown dependent: {name}"
                    )))
                }
            };
            if dependents.contains(&dependent) {
                return Err(IonsimError::SensitivityConfiguration(format!(
                    "Duplicate dependent: {name}"
                )));
            }
            dependents.push(dependent);
        }
        Ok((dependents, independents))
    }
}

fn resolve_independent(topology: &Topology, name: &str) -> Result<Independent> {
    if let Some(state) = name.strip_prefix("init(").and_then(|s| s.strip_suffix(')')) {
        let index = topology
            .states
            .iter()
            .position(|s| s.name == state)
            .ok_or_else(|| {
                IonsimError::SensitivityConfiguration(format!("Unknown state in {name}"))
            })?;
        if !topology.states[index].literal_initial {
            return Err(IonsimError::SensitivityConfiguration(format!(
                "Initial value of {state} is not a literal; it depends on other variables"
            )));
        }
        return Ok(Independent::InitialState(index));
    }
    match topology.resolve(name) {
        Some(Variable::Parameter(i)) => Ok(Independent::Parameter(i)),
        Some(Variable::Literal(_)) => Err(IonsimError::SensitivityConfiguration(format!(
            "{name} is a literal that is not exposed as a parameter"
        ))),
        Some(_) => Err(IonsimError::SensitivityConfiguration(format!(
            "{name} is not a literal constant"
        ))),
        None => Err(IonsimError::SensitivityConfiguration(format!(
            "Unknown independent: {name}"
        ))),
    }
}

struct SensitivityState {
    dependents: Vec<Dependent>,
    independents: Vec<Independent>,
    /// One row per independent, `n_states` values each
    s_states: Vec<Vec<f64>>,
    outputs: Array2<f64>,
}

// ============================================================================
// MODEL STATE CONTAINER
// ============================================================================

/// Live numeric state of one model for one run.
///
/// Every buffer is owned here and only changes through the setters, which
/// compare values and invalidate the cached evaluation when anything moved.
/// Dropping the model releases everything, also when construction failed
/// half-way.
pub struct Model {
    definition: Arc<dyn CellModel>,
    time: Time,
    pace: Vec<f64>,
    realtime: f64,
    evaluations: u64,
    states: Vec<f64>,
    derivatives: Vec<f64>,
    intermediary: Vec<f64>,
    literals: Vec<f64>,
    literal_derived: Vec<f64>,
    parameters: Vec<f64>,
    parameter_derived: Vec<f64>,
    /// Pace vector index for every bound variable bound to a pace label
    pace_slots: Vec<Option<usize>>,
    sensitivity: Option<SensitivityState>,
    use_cache: bool,
    valid_cache: bool,
}

impl Model {
    /// Allocate a model with zero state and default constants.
    pub fn new(definition: Arc<dyn CellModel>) -> Result<Self> {
        let topology = definition.topology();
        topology.validate()?;
        let n = topology.n_states();
        let n_pace = topology.pace_labels().len();

        let mut literals = try_zeroed(topology.literals.len(), "literals")?;
        for (value, constant) in literals.iter_mut().zip(&topology.literals) {
            *value = constant.value;
        }
        let mut parameters = try_zeroed(topology.parameters.len(), "parameters")?;
        for (value, constant) in parameters.iter_mut().zip(&topology.parameters) {
            *value = constant.value;
        }
        let mut literal_derived = try_zeroed(topology.literal_derived.len(), "literal-derived")?;
        definition.update_literal_derived(&literals, &mut literal_derived);
        let mut parameter_derived =
            try_zeroed(topology.parameter_derived.len(), "parameter-derived")?;
        definition.update_parameter_derived(&parameters, &mut parameter_derived);

        let mut next_pace = 0;
        let pace_slots = topology
            .bound
            .iter()
            .map(|b| match b.binding {
                Binding::Pace(_) => {
                    next_pace += 1;
                    Some(next_pace - 1)
                }
                _ => None,
            })
            .collect();

        Ok(Self {
            time: 0.0,
            pace: try_zeroed(n_pace, "pace values")?,
            realtime: 0.0,
            evaluations: 0,
            states: try_zeroed(n, "states")?,
            derivatives: try_zeroed(n, "derivatives")?,
            intermediary: try_zeroed(topology.intermediaries.len(), "intermediary variables")?,
            literals,
            literal_derived,
            parameters,
            parameter_derived,
            pace_slots,
            sensitivity: None,
            use_cache: true,
            valid_cache: false,
            definition,
        })
    }

    /// Allocate a model that also tracks sensitivities.
    pub fn with_sensitivities(definition: Arc<dyn CellModel>, spec: &SensitivitySpec) -> Result<Self> {
        let (dependents, independents) = spec.resolve(definition.topology())?;
        let mut model = Self::new(definition)?;
        let n = model.states.len();
        let mut s_states = Vec::new();
        s_states
            .try_reserve_exact(independents.len())
            .map_err(|e| IonsimError::OutOfMemory(format!("state sensitivities: {e}")))?;
        for _ in 0..independents.len() {
            s_states.push(try_zeroed(n, "state sensitivities")?);
        }
        let outputs = Array2::zeros((dependents.len(), independents.len()));
        debug!(
            "Model {} tracks {} dependents against {} independents",
            model.definition.name(),
            dependents.len(),
            independents.len()
        );
        model.sensitivity = Some(SensitivityState {
            dependents,
            independents,
            s_states,
            outputs,
        });
        Ok(model)
    }

    pub fn definition(&self) -> &Arc<dyn CellModel> {
        &self.definition
    }

    pub fn topology(&self) -> &Topology {
        self.definition.topology()
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// False for models without states, which have no dynamics to integrate.
    pub fn is_ode(&self) -> bool {
        !self.states.is_empty()
    }

    pub fn has_sensitivities(&self) -> bool {
        self.sensitivity.is_some()
    }

    pub fn set_cache(&mut self, enabled: bool) {
        self.use_cache = enabled;
        self.valid_cache = false;
    }

    // ------------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------------

    pub fn set_literals(&mut self, values: &[f64]) -> Result<()> {
        check_len("literals", values.len(), self.literals.len())?;
        if copy_if_changed(&mut self.literals, values) {
            self.definition
                .update_literal_derived(&self.literals, &mut self.literal_derived);
            self.valid_cache = false;
        }
        Ok(())
    }

    pub fn set_parameters(&mut self, values: &[f64]) -> Result<()> {
        check_len("parameters", values.len(), self.parameters.len())?;
        if copy_if_changed(&mut self.parameters, values) {
            self.definition
                .update_parameter_derived(&self.parameters, &mut self.parameter_derived);
            self.valid_cache = false;
        }
        Ok(())
    }

    /// Set a single parameter, recomputing derived values if it changed.
    pub fn set_parameter(&mut self, index: usize, value: f64) -> Result<()> {
        let slot = self.parameters.get_mut(index).ok_or_else(|| {
            IonsimError::InvalidInput(format!("No parameter with index {index}"))
        })?;
        if slot.to_bits() != value.to_bits() {
            *slot = value;
            self.definition
                .update_parameter_derived(&self.parameters, &mut self.parameter_derived);
            self.valid_cache = false;
        }
        Ok(())
    }

    /// Set the parameter-type independents from a full independent vector;
    /// initial-value independents are skipped.
    pub fn set_parameters_from_independents(&mut self, values: &[f64]) -> Result<()> {
        let Some(sens) = self.sensitivity.as_ref() else {
            return Err(IonsimError::SensitivityConfiguration(
                "Model has no sensitivities".into(),
            ));
        };
        check_len("independents", values.len(), sens.independents.len())?;
        let mut changed = false;
        for (independent, &value) in sens.independents.iter().zip(values) {
            if let Independent::Parameter(i) = *independent {
                if self.parameters[i].to_bits() != value.to_bits() {
                    self.parameters[i] = value;
                    changed = true;
                }
            }
        }
        if changed {
            self.definition
                .update_parameter_derived(&self.parameters, &mut self.parameter_derived);
            self.valid_cache = false;
        }
        Ok(())
    }

    /// Update bound inputs. Only time and pace affect the cached evaluation.
    pub fn set_bound_variables(&mut self, time: Time, pace: &[f64], realtime: f64) -> Result<()> {
        check_len("pace values", pace.len(), self.pace.len())?;
        if self.time.to_bits() != time.to_bits() {
            self.time = time;
            self.valid_cache = false;
        }
        if copy_if_changed(&mut self.pace, pace) {
            self.valid_cache = false;
        }
        self.realtime = realtime;
        Ok(())
    }

    pub fn set_states(&mut self, values: &[f64]) -> Result<()> {
        check_len("states", values.len(), self.states.len())?;
        if copy_if_changed(&mut self.states, values) {
            self.valid_cache = false;
        }
        Ok(())
    }

    pub fn set_state_sensitivities(&mut self, independent: usize, values: &[f64]) -> Result<()> {
        let n = self.states.len();
        let sens = self.sensitivity.as_mut().ok_or_else(|| {
            IonsimError::SensitivityConfiguration("Model has no sensitivities".into())
        })?;
        let row = sens.s_states.get_mut(independent).ok_or_else(|| {
            IonsimError::InvalidInput(format!("No independent with index {independent}"))
        })?;
        check_len("state sensitivities", values.len(), n)?;
        row.copy_from_slice(values);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------------

    /// Evaluate derivatives and intermediary variables at the current inputs.
    ///
    /// Every call is counted. A cache hit skips the right-hand side itself but
    /// not the accounting.
    pub fn evaluate_derivatives(&mut self) -> Result<()> {
        self.evaluations += 1;
        if self.use_cache && self.valid_cache {
            return Ok(());
        }
        let input = RhsInput {
            time: self.time,
            pace: &self.pace,
            states: &self.states,
            literals: &self.literals,
            literal_derived: &self.literal_derived,
            parameters: &self.parameters,
            parameter_derived: &self.parameter_derived,
        };
        let mut output = RhsOutput {
            derivatives: &mut self.derivatives,
            intermediary: &mut self.intermediary,
        };
        self.definition.rhs(&input, &mut output);
        self.valid_cache = true;
        Ok(())
    }

    /// Compute the dependents x independents output sensitivity matrix.
    ///
    /// State dependents are read from the state sensitivities. Derivative and
    /// intermediary dependents use a central directional difference of the
    /// right-hand side along `(s_j, e_j)`; each of those calls is counted.
    pub fn evaluate_sensitivity_outputs(&mut self) -> Result<()> {
        self.evaluate_derivatives()?;
        let definition = Arc::clone(&self.definition);
        let Some(sens) = self.sensitivity.as_mut() else {
            return Err(IonsimError::SensitivityConfiguration(
                "Model has no sensitivities".into(),
            ));
        };
        let n = self.states.len();
        let needs_rhs = sens
            .dependents
            .iter()
            .any(|d| !matches!(d, Dependent::State(_)));

        let mut y = self.states.clone();
        let mut p = self.parameters.clone();
        let mut pd = self.parameter_derived.clone();
        let mut d_plus = vec![0.0; n];
        let mut d_minus = vec![0.0; n];
        let mut i_plus = vec![0.0; self.intermediary.len()];
        let mut i_minus = vec![0.0; self.intermediary.len()];
        let step_base = f64::EPSILON.cbrt();

        for (j, independent) in sens.independents.iter().enumerate() {
            let s = &sens.s_states[j];
            for (row, dependent) in sens.dependents.iter().enumerate() {
                if let Dependent::State(k) = dependent {
                    sens.outputs[(row, j)] = s[*k];
                }
            }
            if !needs_rhs {
                continue;
            }

            let parameter = match independent {
                Independent::Parameter(i) => Some(*i),
                Independent::InitialState(_) => None,
            };
            let s_max = s.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
            let direction = if parameter.is_some() { s_max.max(1.0) } else { s_max };
            if direction == 0.0 {
                for (row, dependent) in sens.dependents.iter().enumerate() {
                    if !matches!(dependent, Dependent::State(_)) {
                        sens.outputs[(row, j)] = 0.0;
                    }
                }
                continue;
            }
            let mut scale = self.states.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
            if let Some(i) = parameter {
                scale = scale.max(self.parameters[i].abs());
            }
            let sigma = step_base * scale / direction;

            for (sign, derivatives, intermediary) in [
                (1.0, &mut d_plus, &mut i_plus),
                (-1.0, &mut d_minus, &mut i_minus),
            ] {
                for k in 0..n {
                    y[k] = self.states[k] + sign * sigma * s[k];
                }
                if let Some(i) = parameter {
                    p[i] = self.parameters[i] + sign * sigma;
                    definition.update_parameter_derived(&p, &mut pd);
                }
                let input = RhsInput {
                    time: self.time,
                    pace: &self.pace,
                    states: &y,
                    literals: &self.literals,
                    literal_derived: &self.literal_derived,
                    parameters: &p,
                    parameter_derived: &pd,
                };
                let mut output = RhsOutput {
                    derivatives: derivatives.as_mut_slice(),
                    intermediary: intermediary.as_mut_slice(),
                };
                definition.rhs(&input, &mut output);
                self.evaluations += 1;
            }
            if let Some(i) = parameter {
                p[i] = self.parameters[i];
                pd.copy_from_slice(&self.parameter_derived);
            }

            for (row, dependent) in sens.dependents.iter().enumerate() {
                let value = match dependent {
                    Dependent::State(_) => continue,
                    Dependent::Derivative(k) => (d_plus[*k] - d_minus[*k]) / (2.0 * sigma),
                    Dependent::Intermediary(k) => (i_plus[*k] - i_minus[*k]) / (2.0 * sigma),
                };
                sens.outputs[(row, j)] = value;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn pace(&self) -> &[f64] {
        &self.pace
    }

    pub fn realtime(&self) -> f64 {
        self.realtime
    }

    /// Number of right-hand side evaluations made through this model.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn states(&self) -> &[f64] {
        &self.states
    }

    /// Derivatives from the most recent evaluation.
    pub fn derivatives(&self) -> &[f64] {
        &self.derivatives
    }

    pub fn intermediary(&self) -> &[f64] {
        &self.intermediary
    }

    pub fn literals(&self) -> &[f64] {
        &self.literals
    }

    pub fn literal_derived(&self) -> &[f64] {
        &self.literal_derived
    }

    pub fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    pub fn parameter_derived(&self) -> &[f64] {
        &self.parameter_derived
    }

    /// Default initial state for the current literals.
    pub fn default_state(&self) -> Vec<f64> {
        let mut state = vec![0.0; self.states.len()];
        self.definition
            .initial_state(&self.literals, &self.literal_derived, &mut state);
        state
    }

    pub fn independents(&self) -> &[Independent] {
        self.sensitivity
            .as_ref()
            .map(|s| s.independents.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents(&self) -> &[Dependent] {
        self.sensitivity
            .as_ref()
            .map(|s| s.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Current values of the independents. Initial-value independents read
    /// the live state.
    pub fn independent_values(&self) -> Vec<f64> {
        self.independents()
            .iter()
            .map(|independent| match independent {
                Independent::Parameter(i) => self.parameters[*i],
                Independent::InitialState(i) => self.states[*i],
            })
            .collect()
    }

    pub fn state_sensitivities(&self, independent: usize) -> Option<&[f64]> {
        self.sensitivity
            .as_ref()
            .and_then(|s| s.s_states.get(independent))
            .map(Vec::as_slice)
    }

    /// Output sensitivities from the most recent evaluation.
    pub fn sensitivity_outputs(&self) -> Option<&Array2<f64>> {
        self.sensitivity.as_ref().map(|s| &s.outputs)
    }

    /// Current value of any variable.
    pub fn value(&self, variable: Variable) -> f64 {
        match variable {
            Variable::State(i) => self.states[i],
            Variable::Derivative(i) => self.derivatives[i],
            Variable::Intermediary(i) => self.intermediary[i],
            Variable::Literal(i) => self.literals[i],
            Variable::LiteralDerived(i) => self.literal_derived[i],
            Variable::Parameter(i) => self.parameters[i],
            Variable::ParameterDerived(i) => self.parameter_derived[i],
            Variable::Bound(i) => match self.topology().bound[i].binding {
                Binding::Time => self.time,
                Binding::Pace(_) => self.pace_slots[i].map_or(0.0, |slot| self.pace[slot]),
                Binding::Realtime => self.realtime,
                Binding::Evaluations => self.evaluations as f64,
            },
        }
    }
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(IonsimError::InvalidInput(format!(
            "Expected {expected} {what}, got {got}"
        )));
    }
    Ok(())
}

/// Copy `src` into `dst`, returning true if any value differed.
fn copy_if_changed(dst: &mut [f64], src: &[f64]) -> bool {
    let mut changed = false;
    for (d, s) in dst.iter_mut().zip(src) {
        // Bitwise comparison so NaN inputs are still written
        if d.to_bits() != s.to_bits() {
            *d = *s;
            changed = true;
        }
    }
    changed
}

// ============================================================================
// KINETICS
// ============================================================================

/// Rate function type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// Standard HH form: A*(V+B)/(exp((V+B)/C)-1)
    HodgkinHuxley { a: f64, b: f64, c: f64 },
    /// Exponential: A*exp((V+B)/C)
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: A/(1+exp((V+B)/C))
    Sigmoid { a: f64, b: f64, c: f64 },
    /// Constant
    Constant(f64),
}

impl RateFunction {
    /// Evaluate rate at given voltage
    pub fn eval(&self, v: Voltage) -> f64 {
        match *self {
            Self::HodgkinHuxley { a, b, c } => {
                // Removable singularity at V = -B, replaced by its limit
                if v == -b {
                    a * c
                } else {
                    a * (v + b) / (((v + b) / c).exp() - 1.0)
                }
            }
            Self::Exponential { a, b, c } => a * ((v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + ((v + b) / c).exp()),
            Self::Constant(c) => c,
        }
    }
}

// =============================================================================
// STANDARD MODELS
// =============================================================================

pub mod models {
    use super::*;

    /// Names of the built-in models, for command-line lookup.
    pub const BUILT_IN: [&str; 2] = ["decay", "hh"];

    /// Look up a built-in model by name.
    pub fn by_name(name: &str) -> Option<Arc<dyn CellModel>> {
        match name {
            "decay" => Some(Arc::new(LinearDecay::new())),
            "hh" | "hodgkin-huxley" => Some(Arc::new(HodgkinHuxley::new())),
            _ => None,
        }
    }

    /// Linear decay `dy/dt = -y / tau + gain * pace`, with `tau = 1 / k`.
    pub struct LinearDecay {
        topology: Topology,
    }

    impl LinearDecay {
        pub fn new() -> Self {
            let topology = Topology::new()
                .state("decay.y", true)
                .intermediary("decay.flux")
                .literal("decay.y0", 1.0)
                .literal("decay.gain", 1.0)
                .parameter("decay.k", 1.0)
                .parameter_derived("decay.tau")
                .bind("engine.time", Binding::Time)
                .bind("engine.pace", Binding::Pace("pace".into()))
                .bind("engine.realtime", Binding::Realtime)
                .bind("engine.evaluations", Binding::Evaluations);
            Self { topology }
        }
    }

    impl Default for LinearDecay {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CellModel for LinearDecay {
        fn name(&self) -> &str {
            "decay"
        }

        fn topology(&self) -> &Topology {
            &self.topology
        }

        fn update_parameter_derived(&self, parameters: &[f64], out: &mut [f64]) {
            out[0] = 1.0 / parameters[0];
        }

        fn initial_state(&self, literals: &[f64], _literal_derived: &[f64], out: &mut [f64]) {
            out[0] = literals[0];
        }

        fn rhs(&self, input: &RhsInput<'_>, output: &mut RhsOutput<'_>) {
            let flux = input.states[0] / input.parameter_derived[0];
            output.intermediary[0] = flux;
            output.derivatives[0] = -flux + input.literals[1] * input.pace[0];
        }
    }

    // Gating kinetics of the 1952 squid giant axon model, with voltages
    // measured from a -75 mV reference
    const ALPHA_M: RateFunction = RateFunction::HodgkinHuxley { a: -0.1, b: 50.0, c: -10.0 };
    const BETA_M: RateFunction = RateFunction::Exponential { a: 4.0, b: 75.0, c: -18.0 };
    const ALPHA_H: RateFunction = RateFunction::Exponential { a: 0.07, b: 75.0, c: -20.0 };
    const BETA_H: RateFunction = RateFunction::Sigmoid { a: 1.0, b: 45.0, c: -10.0 };
    const ALPHA_N: RateFunction = RateFunction::HodgkinHuxley { a: -0.01, b: 65.0, c: -10.0 };
    const BETA_N: RateFunction = RateFunction::Exponential { a: 0.125, b: 75.0, c: -80.0 };

    /// Hodgkin-Huxley 1952 squid giant axon.
    ///
    /// The stimulus current is `-pace * membrane.i_amp`. The initial membrane
    /// potential is the resting potential literal, so it is not itself a
    /// literal and cannot be a sensitivity independent.
    pub struct HodgkinHuxley {
        topology: Topology,
    }

    impl HodgkinHuxley {
        pub fn new() -> Self {
            let topology = Topology::new()
                .state("membrane.V", false)
                .state("ina.m", true)
                .state("ina.h", true)
                .state("ik.n", true)
                .intermediary("membrane.i_stim")
                .intermediary("ina.INa")
                .intermediary("ik.IK")
                .intermediary("ileak.IL")
                .intermediary("ina.alpha_m")
                .intermediary("ina.beta_m")
                .intermediary("ina.alpha_h")
                .intermediary("ina.beta_h")
                .intermediary("ik.alpha_n")
                .intermediary("ik.beta_n")
                .literal("membrane.C", 1.0)
                .literal("membrane.E_R", -75.0)
                .literal("membrane.i_amp", 40.0)
                .literal_derived("ina.ENa")
                .literal_derived("ik.EK")
                .literal_derived("ileak.EL")
                .parameter("ina.gNa", 120.0)
                .parameter("ik.gK", 36.0)
                .parameter("ileak.gL", 0.3)
                .bind("engine.time", Binding::Time)
                .bind("engine.pace", Binding::Pace("pace".into()))
                .bind("engine.realtime", Binding::Realtime)
                .bind("engine.evaluations", Binding::Evaluations);
            Self { topology }
        }
    }

    impl Default for HodgkinHuxley {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CellModel for HodgkinHuxley {
        fn name(&self) -> &str {
            "hh"
        }

        fn topology(&self) -> &Topology {
            &self.topology
        }

        fn update_literal_derived(&self, literals: &[f64], out: &mut [f64]) {
            let e_r = literals[1];
            out[0] = e_r + 115.0;
            out[1] = e_r - 12.0;
            out[2] = e_r + 10.613;
        }

        fn initial_state(&self, literals: &[f64], _literal_derived: &[f64], out: &mut [f64]) {
            out[0] = literals[1];
            out[1] = 0.05;
            out[2] = 0.6;
            out[3] = 0.325;
        }

        fn rhs(&self, input: &RhsInput<'_>, output: &mut RhsOutput<'_>) {
            let [v, m, h, n] = [input.states[0], input.states[1], input.states[2], input.states[3]];
            let [c, _, i_amp] = [input.literals[0], input.literals[1], input.literals[2]];
            let [e_na, e_k, e_l] = [
                input.literal_derived[0],
                input.literal_derived[1],
                input.literal_derived[2],
            ];
            let [g_na, g_k, g_l] = [input.parameters[0], input.parameters[1], input.parameters[2]];

            let alpha_m = ALPHA_M.eval(v);
            let beta_m = BETA_M.eval(v);
            let alpha_h = ALPHA_H.eval(v);
            let beta_h = BETA_H.eval(v);
            let alpha_n = ALPHA_N.eval(v);
            let beta_n = BETA_N.eval(v);

            let i_stim = -input.pace[0] * i_amp;
            let i_na = g_na * m.powi(3) * h * (v - e_na);
            let i_k = g_k * n.powi(4) * (v - e_k);
            let i_l = g_l * (v - e_l);

            output.derivatives[0] = -(i_na + i_k + i_l + i_stim) / c;
            output.derivatives[1] = alpha_m * (1.0 - m) - beta_m * m;
            output.derivatives[2] = alpha_h * (1.0 - h) - beta_h * h;
            output.derivatives[3] = alpha_n * (1.0 - n) - beta_n * n;

            output.intermediary.copy_from_slice(&[
                i_stim, i_na, i_k, i_l, alpha_m, beta_m, alpha_h, beta_h, alpha_n, beta_n,
            ]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::models::{HodgkinHuxley, LinearDecay};
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decay model that counts right-hand side and derived-value updates
    struct Counting {
        inner: LinearDecay,
        rhs_calls: AtomicUsize,
        derived_updates: AtomicUsize,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                inner: LinearDecay::new(),
                rhs_calls: AtomicUsize::new(0),
                derived_updates: AtomicUsize::new(0),
            }
        }
    }

    impl CellModel for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn topology(&self) -> &Topology {
            self.inner.topology()
        }
        fn update_parameter_derived(&self, parameters: &[f64], out: &mut [f64]) {
            self.derived_updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update_parameter_derived(parameters, out);
        }
        fn initial_state(&self, literals: &[f64], literal_derived: &[f64], out: &mut [f64]) {
            self.inner.initial_state(literals, literal_derived, out);
        }
        fn rhs(&self, input: &RhsInput<'_>, output: &mut RhsOutput<'_>) {
            self.rhs_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.rhs(input, output);
        }
    }

    #[test]
    fn test_create_defaults() {
        let model = Model::new(Arc::new(HodgkinHuxley::new())).unwrap();
        assert_eq!(model.states(), &[0.0; 4]);
        assert_eq!(model.literals(), &[1.0, -75.0, 40.0]);
        assert_abs_diff_eq!(model.literal_derived()[0], 40.0);
        assert_eq!(model.default_state()[0], -75.0);
        assert!(model.is_ode());
        assert!(!model.has_sensitivities());
        assert_eq!(model.pace().len(), 1);
    }

    #[test]
    fn test_cache_and_evaluation_counter() {
        let definition = Arc::new(Counting::new());
        let mut model = Model::new(definition.clone()).unwrap();
        model.set_states(&[1.0]).unwrap();
        model.evaluate_derivatives().unwrap();
        model.evaluate_derivatives().unwrap();
        model.evaluate_derivatives().unwrap();
        // Cache hits are still counted, but do not reach the right-hand side
        assert_eq!(model.evaluations(), 3);
        assert_eq!(definition.rhs_calls.load(Ordering::SeqCst), 1);
        assert_abs_diff_eq!(model.derivatives()[0], -1.0);

        // Same values: still cached
        model.set_states(&[1.0]).unwrap();
        model.set_bound_variables(0.0, &[0.0], 12.0).unwrap();
        model.evaluate_derivatives().unwrap();
        assert_eq!(model.evaluations(), 4);
        assert_eq!(definition.rhs_calls.load(Ordering::SeqCst), 1);

        model.set_bound_variables(0.5, &[0.0], 12.0).unwrap();
        model.evaluate_derivatives().unwrap();
        assert_eq!(model.evaluations(), 5);
        assert_eq!(definition.rhs_calls.load(Ordering::SeqCst), 2);

        model.set_cache(false);
        model.evaluate_derivatives().unwrap();
        model.evaluate_derivatives().unwrap();
        assert_eq!(model.evaluations(), 7);
        assert_eq!(definition.rhs_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_parameter_derived_only_on_change() {
        let definition = Arc::new(Counting::new());
        let mut model = Model::new(definition.clone()).unwrap();
        let after_create = definition.derived_updates.load(Ordering::SeqCst);
        model.set_parameters(&[1.0]).unwrap();
        assert_eq!(definition.derived_updates.load(Ordering::SeqCst), after_create);
        model.set_parameters(&[2.0]).unwrap();
        assert_eq!(definition.derived_updates.load(Ordering::SeqCst), after_create + 1);
        assert_abs_diff_eq!(model.parameter_derived()[0], 0.5);
    }

    #[test]
    fn test_setters_check_lengths() {
        let mut model = Model::new(Arc::new(LinearDecay::new())).unwrap();
        assert!(matches!(model.set_states(&[1.0, 2.0]), Err(IonsimError::InvalidInput(_))));
        assert!(model.set_literals(&[1.0]).is_err());
        assert!(model.set_bound_variables(0.0, &[], 0.0).is_err());
    }

    #[test]
    fn test_resolve_names() {
        let hh = HodgkinHuxley::new();
        let topology = hh.topology();
        assert_eq!(topology.resolve("membrane.V"), Some(Variable::State(0)));
        assert_eq!(topology.resolve("dot(ik.n)"), Some(Variable::Derivative(3)));
        assert_eq!(topology.resolve("ina.INa"), Some(Variable::Intermediary(1)));
        assert_eq!(topology.resolve("engine.pace"), Some(Variable::Bound(1)));
        assert_eq!(topology.resolve("ik.gK"), Some(Variable::Parameter(1)));
        assert_eq!(topology.resolve("nope"), None);
        assert_eq!(topology.name_of(Variable::Derivative(0)), "dot(membrane.V)");
        assert_eq!(topology.time_name(), Some("engine.time"));
    }

    #[test]
    fn test_sensitivity_rejects_non_literal_initial_value() {
        let spec = SensitivitySpec::new(vec!["membrane.V".into()], vec!["init(membrane.V)".into()]);
        let result = Model::with_sensitivities(Arc::new(HodgkinHuxley::new()), &spec);
        assert!(matches!(result, Err(IonsimError::SensitivityConfiguration(_))));

        let spec = SensitivitySpec::new(vec!["membrane.V".into()], vec!["init(ina.m)".into()]);
        assert!(Model::with_sensitivities(Arc::new(HodgkinHuxley::new()), &spec).is_ok());
    }

    #[test]
    fn test_sensitivity_rejects_bad_targets() {
        let topology = HodgkinHuxley::new().topology().clone();
        let cases = [
            (vec!["membrane.V"], vec!["membrane.C"]),
            (vec!["membrane.V"], vec!["ina.INa"]),
            (vec!["membrane.V"], vec!["unknown"]),
            (vec!["ina.gNa"], vec!["ina.gNa"]),
            (vec!["membrane.V"], vec!["ik.gK", "ik.gK"]),
        ];
        for (deps, indeps) in cases {
            let spec = SensitivitySpec::new(
                deps.into_iter().map(String::from).collect(),
                indeps.into_iter().map(String::from).collect(),
            );
            assert!(matches!(
                spec.resolve(&topology),
                Err(IonsimError::SensitivityConfiguration(_))
            ));
        }
    }

    #[test]
    fn test_parameters_from_independents() {
        let spec = SensitivitySpec::new(
            vec!["ina.INa".into()],
            vec!["init(ina.h)".into(), "ik.gK".into(), "ina.gNa".into()],
        );
        let mut model = Model::with_sensitivities(Arc::new(HodgkinHuxley::new()), &spec).unwrap();
        model.set_states(&[-75.0, 0.05, 0.6, 0.325]).unwrap();
        model
            .set_parameters_from_independents(&[0.9, 30.0, 100.0])
            .unwrap();
        assert_eq!(model.parameters(), &[100.0, 30.0, 0.3]);
        // Initial-value independents track the live state
        assert_eq!(model.states()[2], 0.6);
        assert_eq!(model.independent_values(), vec![0.6, 30.0, 100.0]);
    }

    #[test]
    fn test_independent_parameters_compare_bitwise() {
        let definition = Arc::new(Counting::new());
        let spec = SensitivitySpec::new(vec!["decay.y".into()], vec!["decay.k".into()]);
        let mut model = Model::with_sensitivities(definition.clone(), &spec).unwrap();
        let before = definition.derived_updates.load(Ordering::SeqCst);
        model.set_parameters_from_independents(&[f64::NAN]).unwrap();
        assert_eq!(definition.derived_updates.load(Ordering::SeqCst), before + 1);
        // A repeated NaN is not a change
        model.set_parameters_from_independents(&[f64::NAN]).unwrap();
        assert_eq!(definition.derived_updates.load(Ordering::SeqCst), before + 1);
        assert!(model.parameters()[0].is_nan());

        model.set_states(&[1.0]).unwrap();
        model.set_bound_variables(f64::NAN, &[0.0], 0.0).unwrap();
        model.evaluate_derivatives().unwrap();
        model.set_bound_variables(f64::NAN, &[0.0], 0.0).unwrap();
        model.evaluate_derivatives().unwrap();
        assert_eq!(definition.rhs_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sensitivity_outputs_chain_rule() {
        // flux = k * y, so d(flux)/dk = y + k * dy/dk
        let spec = SensitivitySpec::new(
            vec!["decay.y".into(), "decay.flux".into(), "dot(decay.y)".into()],
            vec!["decay.k".into(), "init(decay.y)".into()],
        );
        let mut model = Model::with_sensitivities(Arc::new(LinearDecay::new()), &spec).unwrap();
        model.set_parameters(&[2.0]).unwrap();
        model.set_states(&[0.5]).unwrap();
        model.set_state_sensitivities(0, &[-0.3]).unwrap();
        model.set_state_sensitivities(1, &[0.25]).unwrap();
        model.evaluate_sensitivity_outputs().unwrap();

        let out = model.sensitivity_outputs().unwrap();
        assert_eq!(out.dim(), (3, 2));
        assert_eq!(out[(0, 0)], -0.3);
        assert_abs_diff_eq!(out[(1, 0)], 0.5 + 2.0 * -0.3, epsilon = 1e-8);
        assert_abs_diff_eq!(out[(2, 0)], -(0.5 + 2.0 * -0.3), epsilon = 1e-8);
        assert_abs_diff_eq!(out[(1, 1)], 2.0 * 0.25, epsilon = 1e-8);
        // Perturbations leave the stored parameters untouched
        assert_eq!(model.parameters(), &[2.0]);
        assert_eq!(model.parameter_derived(), &[0.5]);
        // One evaluation plus two per independent
        assert_eq!(model.evaluations(), 5);
    }

    #[test]
    fn test_rate_function_branch_points() {
        // alpha_m and alpha_n have removable singularities at -50 and -65 mV
        let alpha_m = RateFunction::HodgkinHuxley { a: -0.1, b: 50.0, c: -10.0 };
        assert_eq!(alpha_m.eval(-50.0), 1.0);
        assert_abs_diff_eq!(alpha_m.eval(-50.0 + 1e-9), 1.0, epsilon = 1e-4);
        let alpha_n = RateFunction::HodgkinHuxley { a: -0.01, b: 65.0, c: -10.0 };
        assert_abs_diff_eq!(alpha_n.eval(-65.0), 0.1, epsilon = 1e-15);
        assert!(alpha_n.eval(-65.0).is_finite());

        let sigmoid = RateFunction::Sigmoid { a: 1.0, b: 45.0, c: -10.0 };
        assert_abs_diff_eq!(sigmoid.eval(-45.0), 0.5);
    }

    #[test]
    fn test_hh_rest_is_near_steady_state() {
        let mut model = Model::new(Arc::new(HodgkinHuxley::new())).unwrap();
        let state = model.default_state();
        model.set_states(&state).unwrap();
        model.evaluate_derivatives().unwrap();
        assert!(model.derivatives()[0].abs() < 1.0);
        // Stimulus depolarises
        model.set_bound_variables(0.0, &[1.0], 0.0).unwrap();
        model.evaluate_derivatives().unwrap();
        assert!(model.derivatives()[0] > 30.0);
        assert_eq!(model.value(Variable::Bound(1)), 1.0);
        assert_eq!(model.value(Variable::Bound(3)), 2.0);
    }
}
