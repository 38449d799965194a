//! Properties, specifications and verdict folding
//!
//! A specification is a conjunction of disjoint constraint groups (each
//! group a disjunction of constraints), an optional optimality objective
//! and an optional scheduler-optimality hyperobjective. Constraints come in
//! two kinds: plain threshold properties and hyperproperties comparing the
//! value at one initial state against the value at another.
//!
//! Family-level verdicts use a three-valued feasibility: `Sat` when every
//! scheduler satisfies, `Unsat` when no scheduler does, `Undecided`
//! otherwise.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};
use crate::family::Family;
use crate::model::{Chain, SparseMdp};
use crate::quotient::Quotient;
use crate::verifier::{CheckResult, Direction, Formula, ModelChecker, Objective};

/// Default tolerance for threshold comparisons
pub const DEFAULT_FLOAT_PRECISION: f64 = 1e-10;

/// Default margin a new optimum must beat the current one by
pub const DEFAULT_OPTIMUM_EPSILON: f64 = 1e-6;

/// Three-valued family feasibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Feasibility {
    /// Every scheduler satisfies
    Sat,

    /// No scheduler satisfies
    Unsat,

    /// Neither established
    Undecided,
}

impl Feasibility {
    /// Fold the feasibility of one disjunctive group: any `Sat` member
    /// satisfies the group, all-`Unsat` refutes it.
    pub fn fold_group<I: IntoIterator<Item = Feasibility>>(members: I) -> Feasibility {
        let mut all_unsat = true;
        let mut empty = true;
        for member in members {
            empty = false;
            match member {
                Feasibility::Sat => return Feasibility::Sat,
                Feasibility::Unsat => {}
                Feasibility::Undecided => all_unsat = false,
            }
        }
        if empty || !all_unsat {
            Feasibility::Undecided
        } else {
            Feasibility::Unsat
        }
    }

    /// Fold group verdicts into the family verdict: all `Sat` groups
    /// satisfy the specification, any `Unsat` group refutes it.
    pub fn fold_groups<I: IntoIterator<Item = Feasibility>>(groups: I) -> Feasibility {
        let mut all_sat = true;
        for group in groups {
            match group {
                Feasibility::Sat => {}
                Feasibility::Unsat => return Feasibility::Unsat,
                Feasibility::Undecided => all_sat = false,
            }
        }
        if all_sat { Feasibility::Sat } else { Feasibility::Undecided }
    }
}

/// What kind of threshold a property computes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Fixed threshold declared with the constraint
    Constraint { threshold: f64 },

    /// Improving threshold: the current best optimum
    Optimality { epsilon: f64 },

    /// Threshold taken from the chain value at another initial state.
    /// Both fields index into the model's initial-state list.
    Hyper { state_quant: usize, compare_state: usize },
}

/// A verification property: a pair of direction-flipped formulas plus the
/// rule for computing the threshold the value is compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Formula in the declared optimization sense
    pub formula: Formula,

    /// The same formula in the opposite sense
    pub formula_alt: Formula,

    /// Comparison is `<=` for minimizing properties, `>=` otherwise
    pub minimizing: bool,

    /// Strict comparison excludes values within tolerance of the threshold
    pub strict: bool,

    pub kind: PropertyKind,
}

impl Property {
    /// A plain constraint with a fixed threshold.
    pub fn constraint(objective: Objective, direction: Direction, threshold: f64, strict: bool) -> Self {
        let formula = Formula::new(objective, direction);
        let formula_alt = formula.flipped();
        Self {
            formula,
            formula_alt,
            minimizing: direction == Direction::Minimize,
            strict,
            kind: PropertyKind::Constraint { threshold },
        }
    }

    /// An optimality objective; `epsilon` is the margin a candidate must
    /// improve the incumbent by.
    pub fn optimality(objective: Objective, direction: Direction, epsilon: f64) -> Self {
        let formula = Formula::new(objective, direction);
        let formula_alt = formula.flipped();
        Self {
            formula,
            formula_alt,
            minimizing: direction == Direction::Minimize,
            strict: true,
            kind: PropertyKind::Optimality { epsilon },
        }
    }

    /// A hyperproperty comparing the value at initial state `state_quant`
    /// against the value at initial state `compare_state` of the same model.
    pub fn hyper(objective: Objective, minimizing: bool, state_quant: usize, compare_state: usize) -> Self {
        let direction = if minimizing { Direction::Minimize } else { Direction::Maximize };
        let formula = Formula::new(objective, direction);
        let formula_alt = formula.flipped();
        Self {
            formula,
            formula_alt,
            minimizing,
            strict: false,
            kind: PropertyKind::Hyper { state_quant, compare_state },
        }
    }

    /// The mirrored twin of a hyperproperty: quantified and compared states
    /// swapped, optimization sense flipped. Used to declare symmetric
    /// interchange-style specifications.
    pub fn swapped(&self) -> Self {
        let PropertyKind::Hyper { state_quant, compare_state } = self.kind else {
            panic!("swapping is defined for hyperproperties only");
        };
        Self {
            formula: self.formula_alt.clone(),
            formula_alt: self.formula.clone(),
            minimizing: !self.minimizing,
            strict: self.strict,
            kind: PropertyKind::Hyper {
                state_quant: compare_state,
                compare_state: state_quant,
            },
        }
    }

    /// Whether the underlying objective is a reward objective
    pub fn is_reward(&self) -> bool {
        self.formula.reward_model().is_some()
    }

    pub fn is_hyper(&self) -> bool {
        matches!(self.kind, PropertyKind::Hyper { .. })
    }

    /// Whether `value` meets `threshold` under this property's comparison.
    /// Non-strict comparisons accept values within `precision` of the
    /// threshold; strict comparisons reject them.
    pub fn satisfies(&self, value: f64, threshold: f64, precision: f64) -> bool {
        let within = (value - threshold).abs() <= precision;
        if within {
            return !self.strict;
        }
        if self.minimizing { value < threshold } else { value > threshold }
    }

    /// Whether `value` strictly improves the incumbent optimum.
    pub fn improves_optimum(&self, value: f64, optimum: Option<f64>) -> bool {
        let PropertyKind::Optimality { epsilon } = self.kind else {
            panic!("optimum improvement is defined for optimality properties only");
        };
        match optimum {
            None => true,
            Some(best) => {
                if self.minimizing {
                    value < best - epsilon
                } else {
                    value > best + epsilon
                }
            }
        }
    }

    /// Uniform evaluation over a model-check result pair. `result` carries
    /// the values of `formula`; `result_alt` those of `formula_alt` and is
    /// required for hyperproperties. `optimum` is consulted by optimality
    /// properties only.
    pub fn evaluate(
        &self,
        model: &SparseMdp,
        result: &CheckResult,
        result_alt: Option<&CheckResult>,
        precision: f64,
        optimum: Option<f64>,
    ) -> Result<PropertyResult> {
        let initial = model.initial_states();
        match self.kind {
            PropertyKind::Constraint { threshold } => {
                let value = result.values[initial[0]];
                Ok(PropertyResult {
                    value,
                    threshold: Some(threshold),
                    sat: self.satisfies(value, threshold, precision),
                    improves_optimum: None,
                })
            }
            PropertyKind::Optimality { .. } => {
                let value = result.values[initial[0]];
                let improves = self.improves_optimum(value, optimum);
                Ok(PropertyResult {
                    value,
                    threshold: optimum,
                    sat: improves,
                    improves_optimum: Some(improves),
                })
            }
            PropertyKind::Hyper { state_quant, compare_state } => {
                let alt = result_alt.ok_or_else(|| {
                    SynthesisError::InvalidInput(
                        "hyperproperty evaluation requires the flipped-direction result".into(),
                    )
                })?;
                let &value_state = initial.get(state_quant).ok_or_else(|| {
                    SynthesisError::InvalidInput(format!(
                        "hyperproperty references unknown initial state {state_quant}"
                    ))
                })?;
                let &threshold_state = initial.get(compare_state).ok_or_else(|| {
                    SynthesisError::InvalidInput(format!(
                        "hyperproperty references unknown initial state {compare_state}"
                    ))
                })?;
                let value = result.values[value_state];
                let threshold = alt.values[threshold_state];
                Ok(PropertyResult {
                    value,
                    threshold: Some(threshold),
                    sat: self.satisfies(value, threshold, precision),
                    improves_optimum: None,
                })
            }
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PropertyKind::Constraint { threshold } => {
                let op = match (self.minimizing, self.strict) {
                    (true, false) => "<=",
                    (true, true) => "<",
                    (false, false) => ">=",
                    (false, true) => ">",
                };
                write!(f, "{} {} {}", self.formula, op, threshold)
            }
            PropertyKind::Optimality { .. } => write!(f, "{}", self.formula),
            PropertyKind::Hyper { state_quant, compare_state } => {
                let op = if self.minimizing { "<=" } else { ">=" };
                write!(f, "{} @init[{}] {} @init[{}]", self.formula, state_quant, op, compare_state)
            }
        }
    }
}

/// Value of one property on one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyResult {
    pub value: f64,

    /// The threshold the value was compared against; the incumbent optimum
    /// for optimality properties
    pub threshold: Option<f64>,

    pub sat: bool,

    /// Set for optimality properties only
    pub improves_optimum: Option<bool>,
}

/// A list of constraints with their disjunctive grouping, plus optional
/// optimality and scheduler-optimality objectives.
#[derive(Debug, Clone)]
pub struct Specification {
    pub constraints: Vec<Property>,
    groups: Vec<Vec<usize>>,
    pub optimality: Option<Property>,

    /// Declared extension point; evaluation reports "not implemented"
    pub scheduler_optimality: Option<Property>,

    /// Tolerance for threshold comparisons
    pub float_precision: f64,
}

impl Specification {
    /// A conjunction of constraints, one singleton group per constraint.
    pub fn new(constraints: Vec<Property>) -> Self {
        let groups = (0..constraints.len()).map(|i| vec![i]).collect();
        Self {
            constraints,
            groups,
            optimality: None,
            scheduler_optimality: None,
            float_precision: DEFAULT_FLOAT_PRECISION,
        }
    }

    /// A conjunction of disjunctive groups over the given constraints.
    /// Every constraint index must appear in exactly one group.
    pub fn with_groups(constraints: Vec<Property>, groups: Vec<Vec<usize>>) -> Result<Self> {
        let mut seen = vec![false; constraints.len()];
        for group in &groups {
            for &index in group {
                if index >= constraints.len() {
                    return Err(SynthesisError::InvalidInput(format!(
                        "constraint group references unknown index {index}"
                    )));
                }
                if seen[index] {
                    return Err(SynthesisError::InvalidInput(format!(
                        "constraint index {index} appears in more than one group"
                    )));
                }
                seen[index] = true;
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(SynthesisError::InvalidInput(format!(
                "constraint index {missing} is not covered by any group"
            )));
        }
        Ok(Self {
            constraints,
            groups,
            optimality: None,
            scheduler_optimality: None,
            float_precision: DEFAULT_FLOAT_PRECISION,
        })
    }

    pub fn with_optimality(mut self, optimality: Property) -> Self {
        assert!(
            matches!(optimality.kind, PropertyKind::Optimality { .. }),
            "optimality objective must carry the optimality kind"
        );
        self.optimality = Some(optimality);
        self
    }

    pub fn with_scheduler_optimality(mut self, property: Property) -> Self {
        self.scheduler_optimality = Some(property);
        self
    }

    pub fn with_float_precision(mut self, precision: f64) -> Self {
        self.float_precision = precision;
        self
    }

    pub fn has_optimality(&self) -> bool {
        self.optimality.is_some()
    }

    pub fn all_constraint_indices(&self) -> Vec<usize> {
        (0..self.constraints.len()).collect()
    }

    /// The declared groups, filtered down to the given constraint indices.
    /// Groups with no surviving member come out empty.
    pub fn group_indices(&self, indices: &[usize]) -> Vec<Vec<usize>> {
        self.groups
            .iter()
            .map(|group| group.iter().copied().filter(|i| indices.contains(i)).collect())
            .collect()
    }

    /// Guard for the declared-but-unevaluated extension point.
    fn reject_scheduler_optimality(&self) -> Result<()> {
        if self.scheduler_optimality.is_some() {
            return Err(SynthesisError::NotImplemented(
                "scheduler-optimality hyperproperty evaluation".into(),
            ));
        }
        Ok(())
    }
}

/// Per-constraint results of checking a chain
#[derive(Debug)]
pub struct ConstraintsResult {
    /// One entry per constraint; `None` where evaluation was skipped
    pub results: Vec<Option<PropertyResult>>,

    /// Every group with at least one evaluated member has a satisfied member
    pub all_sat: bool,
}

/// Result of checking a chain against a full specification
#[derive(Debug)]
pub struct ChainSpecificationResult {
    pub constraints_result: ConstraintsResult,
    pub optimality_result: Option<PropertyResult>,
}

impl ChainSpecificationResult {
    /// Whether the chain witnesses the specification: every group holds and,
    /// if an optimality objective is present, the incumbent is improved.
    pub fn accepts(&self) -> bool {
        self.constraints_result.all_sat
            && self
                .optimality_result
                .as_ref()
                .map_or(true, |r| r.improves_optimum == Some(true))
    }
}

/// Per-constraint result of checking an MDP in both directions
#[derive(Debug)]
pub struct MdpPropertyResult {
    pub primary: PropertyResult,
    pub secondary: Option<PropertyResult>,
    pub feasibility: Feasibility,

    /// Options actually used by the primary scheduler, per hole
    pub primary_selection: Vec<Vec<usize>>,

    /// At most one option per hole in the primary selection
    pub primary_consistent: bool,

    /// Primary direction satisfied by a consistent scheduler
    pub primary_feasibility: bool,

    /// Per-hole inconsistency scores driving splitter choice
    pub primary_scores: Option<Vec<Option<f64>>>,

    /// Primary-direction state values, kept for warm-starting children
    pub primary_values: Vec<f64>,

    /// Secondary-direction state values, if that direction was explored
    pub secondary_values: Option<Vec<f64>>,
}

/// Group-folded constraint verdict for an MDP family
#[derive(Debug)]
pub struct MdpConstraintsResult {
    pub results: Vec<Option<MdpPropertyResult>>,

    /// Constraint indices still undecided and not covered by a satisfied
    /// group member
    pub undecided_constraints: Vec<usize>,

    pub feasibility: Feasibility,

    /// A consistent, primary-satisfying scheduler selection exists and is
    /// compatible across all groups
    pub primary_feasibility: bool,

    /// Merged per-hole selections, one candidate per compatible combination
    pub primary_selections: Vec<Vec<Vec<usize>>>,
}

impl MdpConstraintsResult {
    /// Fold per-constraint results over the specification's groups.
    pub fn new(spec: &Specification, results: Vec<Option<MdpPropertyResult>>) -> Self {
        let grouped = spec.group_indices(&spec.all_constraint_indices());

        let mut undecided_constraints = Vec::new();
        let mut group_verdicts = Vec::new();
        let mut primary_feasibility = true;
        let mut primary_selections: Vec<Vec<Vec<usize>>> = Vec::new();

        for group in &grouped {
            let checked: Vec<&MdpPropertyResult> =
                group.iter().filter_map(|&i| results[i].as_ref()).collect();
            if checked.is_empty() {
                continue;
            }

            let verdict = Feasibility::fold_group(checked.iter().map(|r| r.feasibility));
            if verdict != Feasibility::Sat {
                // a satisfied group covers its undecided members
                for &index in group {
                    if let Some(result) = results[index].as_ref() {
                        if result.feasibility == Feasibility::Undecided {
                            undecided_constraints.push(index);
                        }
                    }
                }
            }
            group_verdicts.push(verdict);

            if primary_feasibility {
                let group_selections: Vec<Vec<Vec<usize>>> = checked
                    .iter()
                    .filter(|r| r.primary_feasibility)
                    .map(|r| r.primary_selection.clone())
                    .collect();
                if group_selections.is_empty() {
                    primary_feasibility = false;
                } else if primary_selections.is_empty() {
                    primary_selections = group_selections;
                } else {
                    primary_selections =
                        Self::merge_selections(&primary_selections, &group_selections);
                    primary_feasibility = !primary_selections.is_empty();
                }
            }
        }

        let feasibility = Feasibility::fold_groups(group_verdicts);
        if feasibility == Feasibility::Unsat || primary_selections.is_empty() {
            primary_feasibility = false;
            primary_selections.clear();
        }

        Self {
            results,
            undecided_constraints,
            feasibility,
            primary_feasibility,
            primary_selections,
        }
    }

    /// Two selections are compatible iff their per-hole option sets are
    /// set-equal; merging concatenates positionally and deduplicates.
    fn merge_selections(
        saved: &[Vec<Vec<usize>>],
        found: &[Vec<Vec<usize>>],
    ) -> Vec<Vec<Vec<usize>>> {
        fn same_set(a: &[usize], b: &[usize]) -> bool {
            a.len() == b.len() && a.iter().all(|x| b.contains(x))
        }

        let mut merged = Vec::new();
        for saved_selection in saved {
            for found_selection in found {
                let compatible = saved_selection
                    .iter()
                    .zip(found_selection)
                    .all(|(a, b)| same_set(a, b));
                if !compatible {
                    continue;
                }
                let combined = saved_selection
                    .iter()
                    .zip(found_selection)
                    .map(|(a, b)| {
                        let mut options = a.clone();
                        for &option in b {
                            if !options.contains(&option) {
                                options.push(option);
                            }
                        }
                        options
                    })
                    .collect();
                merged.push(combined);
            }
        }
        merged
    }

    /// The first undecided constraint's result, driving the next split.
    pub fn undecided_result(&self) -> Option<&MdpPropertyResult> {
        self.undecided_constraints
            .first()
            .and_then(|&i| self.results[i].as_ref())
    }
}

/// Optimality verdict for an MDP family
#[derive(Debug)]
pub struct MdpOptimalityResult {
    pub primary: PropertyResult,

    /// Primary value improves the incumbent optimum
    pub improves: bool,

    /// Witness assignment when the optimal scheduler is consistent
    pub improving_assignment: Option<Family>,

    /// Splitting this family can still surface a better optimum
    pub can_improve: bool,

    pub primary_selection: Vec<Vec<usize>>,
    pub primary_scores: Option<Vec<Option<f64>>>,
    pub primary_values: Vec<f64>,
}

/// Verdict of checking an MDP family against a full specification
#[derive(Debug)]
pub struct MdpSpecificationResult {
    pub constraints_result: MdpConstraintsResult,
    pub optimality_result: Option<MdpOptimalityResult>,
}

impl MdpSpecificationResult {
    /// Interpret the verdict: an optional candidate assignment to
    /// double-check, and whether refining the family any further can pay
    /// off.
    pub fn improving(&self, family: &Family) -> (Option<Family>, bool) {
        match self.constraints_result.feasibility {
            Feasibility::Unsat => (None, false),
            Feasibility::Sat => match &self.optimality_result {
                None => (Some(family.pick_any()), false),
                Some(opt) => (opt.improving_assignment.clone(), opt.can_improve),
            },
            Feasibility::Undecided => {
                if let Some(opt) = &self.optimality_result {
                    if !opt.improves {
                        // nothing in this family can beat the incumbent
                        return (None, false);
                    }
                }
                if self.constraints_result.primary_feasibility {
                    let selection = &self.constraints_result.primary_selections[0];
                    let mut options = Vec::with_capacity(family.num_holes());
                    for (hole_index, hole_options) in selection.iter().enumerate() {
                        if hole_options.is_empty() {
                            options.push(vec![family.hole(hole_index).options[0]]);
                        } else {
                            options.push(hole_options.clone());
                        }
                    }
                    let mut assignment = family.clone();
                    assignment.assume_options(options);
                    (Some(assignment), true)
                } else {
                    (None, true)
                }
            }
        }
    }

    /// Selection and scores the splitter choice is based on: the first
    /// undecided constraint if any, the optimality objective otherwise.
    pub fn split_basis(&self) -> (&[Vec<usize>], Option<&[Option<f64>]>) {
        if let Some(result) = self.constraints_result.undecided_result() {
            return (
                &result.primary_selection,
                result.primary_scores.as_deref(),
            );
        }
        if let Some(opt) = &self.optimality_result {
            return (&opt.primary_selection, opt.primary_scores.as_deref());
        }
        (&[], None)
    }
}

/// Model-check one property on a chain; hyperproperties additionally check
/// the flipped formula to obtain their threshold.
fn model_check_chain_property(
    chain: &Chain,
    prop: &Property,
    precision: f64,
    optimum: Option<f64>,
    checker: &dyn ModelChecker,
    family: &Family,
) -> Result<PropertyResult> {
    let result = run_checker(checker, &chain.model, &prop.formula, None, family)?;
    let result_alt = if prop.is_hyper() {
        Some(run_checker(checker, &chain.model, &prop.formula_alt, None, family)?)
    } else {
        None
    };
    prop.evaluate(&chain.model, &result, result_alt.as_ref(), precision, optimum)
}

/// Check a chain against the specification's constraints. Evaluation runs
/// group by group; with `short_evaluation`, a fully refuted group stops the
/// remaining work.
pub fn check_chain_constraints(
    chain: &Chain,
    spec: &Specification,
    property_indices: &[usize],
    short_evaluation: bool,
    checker: &dyn ModelChecker,
    family: &Family,
) -> Result<ConstraintsResult> {
    let mut results: Vec<Option<PropertyResult>> = vec![None; spec.constraints.len()];
    let mut all_sat = true;

    for group in spec.group_indices(property_indices) {
        if group.is_empty() {
            continue;
        }
        let mut group_sat = false;
        for index in group {
            let result = model_check_chain_property(
                chain,
                &spec.constraints[index],
                spec.float_precision,
                None,
                checker,
                family,
            )?;
            group_sat |= result.sat;
            results[index] = Some(result);
        }
        all_sat &= group_sat;
        if short_evaluation && !group_sat {
            return Ok(ConstraintsResult { results, all_sat });
        }
    }
    Ok(ConstraintsResult { results, all_sat })
}

/// Check a chain against the full specification, including the optimality
/// objective.
pub fn check_chain_specification(
    chain: &Chain,
    spec: &Specification,
    optimum: Option<f64>,
    checker: &dyn ModelChecker,
    family: &Family,
) -> Result<ChainSpecificationResult> {
    spec.reject_scheduler_optimality()?;

    let constraints_result = check_chain_constraints(
        chain,
        spec,
        &spec.all_constraint_indices(),
        false,
        checker,
        family,
    )?;

    let optimality_result = match &spec.optimality {
        Some(opt) => Some(model_check_chain_property(
            chain,
            opt,
            spec.float_precision,
            optimum,
            checker,
            family,
        )?),
        None => None,
    };

    Ok(ChainSpecificationResult { constraints_result, optimality_result })
}

fn run_checker(
    checker: &dyn ModelChecker,
    model: &SparseMdp,
    formula: &Formula,
    hint: Option<&[f64]>,
    family: &Family,
) -> Result<CheckResult> {
    let result = checker.check(model, formula, hint).map_err(|source| {
        SynthesisError::Verifier {
            family: family.to_string(),
            property: formula.to_string(),
            source,
        }
    })?;
    if result.values.len() != model.num_states() {
        return Err(SynthesisError::Verifier {
            family: family.to_string(),
            property: formula.to_string(),
            source: anyhow::anyhow!(
                "checker returned {} values for {} states",
                result.values.len(),
                model.num_states()
            ),
        });
    }
    Ok(result)
}

/// Model-check one property on an MDP family in one direction, returning
/// both the interpreted result and the raw check result (for scheduler
/// analysis and hints).
fn model_check_mdp_property(
    family: &Family,
    prop: &Property,
    index: Option<usize>,
    alt: bool,
    precision: f64,
    optimum: Option<f64>,
    checker: &dyn ModelChecker,
) -> Result<(PropertyResult, CheckResult)> {
    let sub = family.mdp.as_ref().expect("family sub-MDP must be built before evaluation");

    let hint = index.and_then(|i| {
        let hints = sub.analysis_hints.as_ref()?;
        let (primary, secondary) = hints.get(&i)?;
        if alt { secondary.as_deref() } else { primary.as_deref() }
    });

    let (formula, formula_alt) = if alt {
        (&prop.formula_alt, &prop.formula)
    } else {
        (&prop.formula, &prop.formula_alt)
    };

    let result = run_checker(checker, &sub.model, formula, hint, family)?;
    let result_alt = if prop.is_hyper() {
        Some(run_checker(checker, &sub.model, formula_alt, hint, family)?)
    } else {
        None
    };
    let evaluated = prop.evaluate(&sub.model, &result, result_alt.as_ref(), precision, optimum)?;
    Ok((evaluated, result))
}

/// Check one constraint on an MDP family: primary direction, scheduler
/// analysis, then the secondary direction to bracket every scheduler.
pub fn check_mdp_property(
    quotient: &Quotient,
    family: &Family,
    spec: &Specification,
    index: usize,
    checker: &dyn ModelChecker,
) -> Result<MdpPropertyResult> {
    let prop = &spec.constraints[index];
    let (primary, primary_raw) = model_check_mdp_property(
        family,
        prop,
        Some(index),
        false,
        spec.float_precision,
        None,
        checker,
    )?;

    if !primary.sat {
        // the best scheduler already fails: no scheduler satisfies
        return Ok(MdpPropertyResult {
            primary,
            secondary: None,
            feasibility: Feasibility::Unsat,
            primary_selection: vec![Vec::new(); family.num_holes()],
            primary_consistent: false,
            primary_feasibility: false,
            primary_scores: None,
            primary_values: primary_raw.values,
            secondary_values: None,
        });
    }

    let analysis = quotient.scheduler_consistent(family, prop, &primary_raw)?;

    let (secondary, secondary_raw) = model_check_mdp_property(
        family,
        prop,
        Some(index),
        true,
        spec.float_precision,
        None,
        checker,
    )?;

    let feasibility = if secondary.sat { Feasibility::Sat } else { Feasibility::Undecided };
    Ok(MdpPropertyResult {
        primary_feasibility: analysis.consistent,
        primary,
        secondary: Some(secondary),
        feasibility,
        primary_selection: analysis.selection,
        primary_consistent: analysis.consistent,
        primary_scores: analysis.scores,
        primary_values: primary_raw.values,
        secondary_values: Some(secondary_raw.values),
    })
}

/// Check the undecided constraints of an MDP family, group by group.
pub fn check_mdp_constraints(
    quotient: &Quotient,
    family: &Family,
    spec: &Specification,
    property_indices: &[usize],
    short_evaluation: bool,
    checker: &dyn ModelChecker,
) -> Result<MdpConstraintsResult> {
    let mut results: Vec<Option<MdpPropertyResult>> = Vec::new();
    results.resize_with(spec.constraints.len(), || None);

    'groups: for group in spec.group_indices(property_indices) {
        if group.is_empty() {
            continue;
        }
        let mut group_feasible = false;
        for index in group {
            let result = check_mdp_property(quotient, family, spec, index, checker)?;
            group_feasible |= result.feasibility != Feasibility::Unsat;
            results[index] = Some(result);
        }
        if short_evaluation && !group_feasible {
            break 'groups;
        }
    }

    Ok(MdpConstraintsResult::new(spec, results))
}

/// Check the optimality objective on an MDP family.
pub fn check_mdp_optimality(
    quotient: &Quotient,
    family: &Family,
    spec: &Specification,
    optimum: Option<f64>,
    checker: &dyn ModelChecker,
) -> Result<MdpOptimalityResult> {
    let opt = spec.optimality.as_ref().expect("optimality objective required");
    // optimality hints are keyed one past the constraint indices
    let (primary, primary_raw) = model_check_mdp_property(
        family,
        opt,
        Some(spec.constraints.len()),
        false,
        spec.float_precision,
        optimum,
        checker,
    )?;

    let improves = primary.improves_optimum == Some(true);
    if !improves {
        return Ok(MdpOptimalityResult {
            primary,
            improves: false,
            improving_assignment: None,
            can_improve: false,
            primary_selection: vec![Vec::new(); family.num_holes()],
            primary_scores: None,
            primary_values: primary_raw.values,
        });
    }

    let analysis = quotient.scheduler_consistent(family, opt, &primary_raw)?;
    let improving_assignment = if analysis.consistent {
        let options = analysis
            .selection
            .iter()
            .enumerate()
            .map(|(hole_index, options)| {
                if options.is_empty() {
                    vec![family.hole(hole_index).options[0]]
                } else {
                    options.clone()
                }
            })
            .collect();
        let mut assignment = family.clone();
        assignment.assume_options(options);
        Some(assignment)
    } else {
        None
    };

    // a consistent optimal scheduler realizes the family optimum: once it
    // is double-checked, nothing better remains inside
    let can_improve = !analysis.consistent;

    Ok(MdpOptimalityResult {
        primary,
        improves: true,
        improving_assignment,
        can_improve,
        primary_selection: analysis.selection,
        primary_scores: analysis.scores,
        primary_values: primary_raw.values,
    })
}

/// Check an MDP family against the full specification.
pub fn check_mdp_specification(
    quotient: &Quotient,
    family: &Family,
    spec: &Specification,
    optimum: Option<f64>,
    checker: &dyn ModelChecker,
) -> Result<MdpSpecificationResult> {
    spec.reject_scheduler_optimality()?;

    let constraints_result = check_mdp_constraints(
        quotient,
        family,
        spec,
        &family.property_indices,
        true,
        checker,
    )?;

    let optimality_result = if spec.has_optimality()
        && constraints_result.feasibility != Feasibility::Unsat
    {
        Some(check_mdp_optimality(quotient, family, spec, optimum, checker)?)
    } else {
        None
    };

    Ok(MdpSpecificationResult { constraints_result, optimality_result })
}
