//! Quotient coordination: action selection, sub-MDP construction,
//! scheduler analysis and family splitting
//!
//! The quotient MDP contains every action any assignment could take; each
//! action carries a (possibly empty) hole-option labeling. A family admits
//! an action iff the action is default (unlabeled) or its labeling is
//! included in the family's current options. Children of a split family
//! reuse the parent's admitted-action list instead of rescanning the whole
//! quotient.

use std::collections::HashMap;

use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthesisError};
use crate::family::{CombinationColoring, Family, Hole, ParentInfo};
use crate::model::{Chain, SparseMdp, SubMdp, SubModel};
use crate::spec::{MdpSpecificationResult, Property, Specification};
use crate::verifier::CheckResult;

/// Hole-option labeling of one action, sorted by hole index
pub type HoleOptions = Vec<(usize, usize)>;

/// How a splitter hole's options are partitioned into children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// One singleton core per used option plus a remainder branch holding
    /// the unused options; the remainder is explored last
    CoreAndRemainder,

    /// One core per used option, unused options distributed round-robin
    /// over the cores
    RoundRobin,
}

/// Actions admitted by a family
#[derive(Debug, Clone)]
pub struct SelectedActions {
    /// For each hole, the admitted actions labeled by it
    pub hole_selected_actions: Vec<Vec<usize>>,

    /// All admitted non-default actions
    pub selected_actions: Vec<usize>,

    /// Admitted actions as a mask over quotient choices, defaults included
    pub mask: FixedBitSet,
}

/// Result of analyzing a verifier scheduler against a family
#[derive(Debug, Clone)]
pub struct SchedulerAnalysis {
    /// Options actually used by the scheduler, per hole; empty per-hole
    /// sets are filled with the family's first option
    pub selection: Vec<Vec<usize>>,

    /// Every hole maps to at most one used option
    pub consistent: bool,

    /// Per-hole inconsistency scores; `None` entries are consistent holes
    pub scores: Option<Vec<Option<f64>>>,
}

/// Volume split off a family, with the incomplete-search savings
#[derive(Debug)]
pub struct SplitOutcome {
    /// Children in push order: remainder branch (if any) first, cores last
    pub subfamilies: Vec<Family>,

    /// Assignments removed by incomplete-search pruning
    pub discarded: u128,
}

/// Process-wide coordinator owning the quotient MDP, its hole-option
/// labelings and the combination coloring.
#[derive(Debug)]
pub struct Quotient {
    model: SparseMdp,

    /// For each quotient choice, its hole-option labeling
    action_to_hole_options: Vec<HoleOptions>,

    /// Choices with an empty labeling
    default_actions: FixedBitSet,

    /// For each state, the holes labeling any of its outgoing actions
    state_to_holes: Vec<Vec<usize>>,

    /// Coloring of the distinct labelings; color 0 is the default
    coloring: CombinationColoring,

    /// Color of each quotient choice
    action_colors: Vec<usize>,

    num_holes: usize,
}

impl Quotient {
    /// Wrap an externally built quotient MDP with its action labelings.
    /// `family` is the root design space the labelings refer to.
    pub fn new(
        model: SparseMdp,
        action_to_hole_options: Vec<HoleOptions>,
        family: &Family,
    ) -> Result<Self> {
        if action_to_hole_options.len() != model.num_choices() {
            return Err(SynthesisError::InvalidInput(format!(
                "expected {} action labelings, got {}",
                model.num_choices(),
                action_to_hole_options.len()
            )));
        }
        for (choice, labeling) in action_to_hole_options.iter().enumerate() {
            for &(hole, option) in labeling {
                if hole >= family.num_holes() {
                    return Err(SynthesisError::InvalidInput(format!(
                        "action {choice} labeled by unknown hole {hole}"
                    )));
                }
                if option >= family.hole(hole).option_labels.len() {
                    return Err(SynthesisError::InvalidInput(format!(
                        "action {choice} labeled by unknown option {option} of hole `{}`",
                        family.hole(hole).name
                    )));
                }
            }
        }

        let num_holes = family.num_holes();
        let mut default_actions = FixedBitSet::with_capacity(model.num_choices());
        let mut coloring = CombinationColoring::new();
        let mut action_colors = Vec::with_capacity(model.num_choices());
        for (choice, labeling) in action_to_hole_options.iter().enumerate() {
            if labeling.is_empty() {
                default_actions.insert(choice);
                action_colors.push(0);
                continue;
            }
            let mut combination = vec![None; num_holes];
            for &(hole, option) in labeling {
                combination[hole] = Some(option);
            }
            action_colors.push(coloring.get_or_make_color(combination));
        }

        let mut state_to_holes = Vec::with_capacity(model.num_states());
        for state in 0..model.num_states() {
            let mut holes: Vec<usize> = Vec::new();
            for choice in model.choices_of(state) {
                for &(hole, _) in &action_to_hole_options[choice] {
                    if !holes.contains(&hole) {
                        holes.push(hole);
                    }
                }
            }
            holes.sort_unstable();
            state_to_holes.push(holes);
        }

        Ok(Self {
            model,
            action_to_hole_options,
            default_actions,
            state_to_holes,
            coloring,
            action_colors,
            num_holes,
        })
    }

    /// Derive a quotient directly from a model's nondeterminism: every
    /// state with more than one action becomes a hole whose options are
    /// the local actions. Returns the coordinator and the root family.
    pub fn from_state_actions(model: SparseMdp) -> Result<(Self, Family)> {
        let mut holes = Vec::new();
        let mut action_to_hole_options: Vec<HoleOptions> = vec![Vec::new(); model.num_choices()];
        for state in 0..model.num_states() {
            let choices = model.choices_of(state);
            if choices.len() == 1 {
                continue;
            }
            let hole_index = holes.len();
            let labels = (0..choices.len()).map(|offset| format!("a{offset}")).collect();
            holes.push(Hole::new(format!("s{state}"), labels));
            for (offset, choice) in choices.enumerate() {
                action_to_hole_options[choice].push((hole_index, offset));
            }
        }
        let family = Family::new(holes);
        let quotient = Self::new(model, action_to_hole_options, &family)?;
        Ok((quotient, family))
    }

    pub fn model(&self) -> &SparseMdp {
        &self.model
    }

    pub fn num_holes(&self) -> usize {
        self.num_holes
    }

    pub fn coloring(&self) -> &CombinationColoring {
        &self.coloring
    }

    /// Labeling of one quotient choice
    pub fn hole_options(&self, choice: usize) -> &HoleOptions {
        &self.action_to_hole_options[choice]
    }

    pub fn is_default(&self, choice: usize) -> bool {
        self.default_actions.contains(choice)
    }

    /// Select the actions admitted by a family.
    ///
    /// For the root family every quotient action is scanned through the
    /// coloring; for a refined family only the parent's admitted actions
    /// are rescanned, and only those mentioning the parent's splitter can
    /// drop out.
    pub fn select_actions(&self, family: &Family) -> SelectedActions {
        let mut selected_actions = Vec::new();
        match &family.parent_info {
            None => {
                let admitted_colors = self.coloring.subcolors(family);
                for choice in 0..self.model.num_choices() {
                    if self.default_actions.contains(choice) {
                        continue;
                    }
                    if admitted_colors.contains(self.action_colors[choice]) {
                        selected_actions.push(choice);
                    }
                }
            }
            Some(parent) => {
                for &choice in &parent.selected_actions {
                    let labeling = &self.action_to_hole_options[choice];
                    let mentions_splitter =
                        labeling.iter().any(|&(hole, _)| hole == parent.splitter);
                    if !mentions_splitter || family.includes(labeling) {
                        selected_actions.push(choice);
                    }
                }
            }
        }

        let mut hole_selected_actions = vec![Vec::new(); self.num_holes];
        for &choice in &selected_actions {
            for &(hole, _) in &self.action_to_hole_options[choice] {
                hole_selected_actions[hole].push(choice);
            }
        }

        let mut mask = self.default_actions.clone();
        for &choice in &selected_actions {
            mask.insert(choice);
        }

        SelectedActions { hole_selected_actions, selected_actions, mask }
    }

    /// Restrict the quotient to an admitted-action mask.
    pub fn restrict(&self, mask: &FixedBitSet) -> SubModel {
        self.model.restrict(mask)
    }

    /// Build the family's sub-MDP, caching the action selection on the
    /// family and translating the parent's analysis hints onto the new
    /// state space.
    pub fn build(&self, family: &mut Family, store_hints: bool) {
        let selected = self.select_actions(family);
        let sub = self.restrict(&selected.mask);

        let hole_simple = self.compute_simple_holes(&sub.state_map);
        let analysis_hints = if store_hints {
            self.translate_analysis_hints(family, &sub.state_map)
        } else {
            None
        };

        family.selected_actions = Some(selected.selected_actions);
        family.hole_selected_actions = Some(selected.hole_selected_actions);
        family.mdp = Some(SubMdp {
            model: sub.model,
            quotient_state_map: sub.state_map,
            quotient_choice_map: sub.choice_map,
            hole_simple,
            analysis_hints,
        });
    }

    /// For each hole, whether its actions occur in exactly one sub-MDP state.
    fn compute_simple_holes(&self, state_map: &[usize]) -> Vec<bool> {
        let mut hole_to_states = vec![0usize; self.num_holes];
        for &quotient_state in state_map {
            for &hole in &self.state_to_holes[quotient_state] {
                hole_to_states[hole] += 1;
            }
        }
        hole_to_states.iter().map(|&count| count == 1).collect()
    }

    /// Reproject the parent's quotient-space hint vectors onto the child's
    /// states. Missing hints degrade to a cold verifier call.
    fn translate_analysis_hints(
        &self,
        family: &Family,
        state_map: &[usize],
    ) -> Option<HashMap<usize, crate::family::HintPair>> {
        let parent = family.parent_info.as_ref()?;
        if parent.analysis_hints.is_empty() {
            return None;
        }
        let translate = |hint: &Option<Vec<f64>>| -> Option<Vec<f64>> {
            let hint = hint.as_ref()?;
            Some(state_map.iter().map(|&q| hint[q]).collect())
        };
        let mut hints = HashMap::new();
        for (&index, (primary, secondary)) in &parent.analysis_hints {
            hints.insert(index, (translate(primary), translate(secondary)));
        }
        Some(hints)
    }

    /// Build the deterministic chain of a fully resolved family; used to
    /// double-check candidate witnesses against the full specification.
    pub fn build_chain(&self, family: &Family) -> Result<Chain> {
        assert!(family.is_singleton(), "chain construction requires a singleton family");

        let selected = self.select_actions(family);
        let sub = self.restrict(&selected.mask);
        let model = sub.model.collapse_to_chain()?;
        Ok(Chain {
            model,
            quotient_state_map: sub.state_map,
            quotient_choice_map: sub.choice_map,
        })
    }

    /// Holes whose options appear on any of the given quotient choices.
    /// Any two assignments agreeing on these holes admit the same choices.
    pub fn relevant_holes(&self, quotient_choices: &[usize]) -> Vec<usize> {
        let mut holes: Vec<usize> = Vec::new();
        for &choice in quotient_choices {
            for &(hole, _) in &self.action_to_hole_options[choice] {
                if !holes.contains(&hole) {
                    holes.push(hole);
                }
            }
        }
        holes.sort_unstable();
        holes
    }

    /// Qualitative scheduler selection: restrict the sub-MDP to the
    /// scheduler's choices, walk the reachable chain and fold each used
    /// action's labeling into per-hole option sets.
    fn scheduler_selection(&self, sub: &SubMdp, scheduler: &[usize]) -> Vec<Vec<usize>> {
        let mut support = FixedBitSet::with_capacity(sub.model.num_choices());
        for &choice in scheduler {
            support.insert(choice);
        }
        let induced = sub.model.restrict(&support);

        let mut selection = vec![Vec::new(); self.num_holes];
        for &sub_choice in &induced.choice_map {
            let quotient_choice = sub.quotient_choice_map[sub_choice];
            for &(hole, option) in &self.action_to_hole_options[quotient_choice] {
                if !selection[hole].contains(&option) {
                    selection[hole].push(option);
                }
            }
        }
        for options in &mut selection {
            options.sort_unstable();
        }
        selection
    }

    /// Replace non-finite entries: minimizing properties substitute the
    /// mean of the finite entries, maximizing ones substitute zero.
    fn make_vector_defined(vector: Vec<f64>, minimizing: bool) -> Vec<f64> {
        if !vector.iter().any(|v| v.is_infinite()) {
            return vector;
        }
        let default_value = if minimizing {
            let finite_sum: f64 = vector.iter().filter(|v| v.is_finite()).sum();
            finite_sum / vector.len() as f64
        } else {
            0.0
        };
        vector
            .into_iter()
            .map(|v| if v.is_infinite() { default_value } else { v })
            .collect()
    }

    /// Choice values: for each sub-MDP choice, the expectation of the state
    /// values over its distribution, plus the state-action reward for
    /// reward properties.
    fn choice_values(&self, sub: &SubMdp, prop: &Property, values: &[f64]) -> Result<Vec<f64>> {
        let mut choice_values = sub.model.multiply_with_values(values);
        choice_values = Self::make_vector_defined(choice_values, prop.minimizing);

        if let Some(reward_model) = prop.formula.reward_model() {
            let rewards = sub.model.reward_model(reward_model).ok_or_else(|| {
                SynthesisError::InvalidInput(format!(
                    "property references unknown reward model `{reward_model}`"
                ))
            })?;
            for (choice, value) in choice_values.iter_mut().enumerate() {
                *value += rewards[choice];
            }
        }
        debug_assert!(choice_values.iter().all(|v| !v.is_nan()));
        Ok(choice_values)
    }

    /// Expected visits of each sub-MDP state in the scheduler-induced
    /// chain; states the scheduler never reaches count zero visits.
    fn scheduler_expected_visits(
        &self,
        sub: &SubMdp,
        prop: &Property,
        scheduler: &[usize],
    ) -> Result<Vec<f64>> {
        let mut support = FixedBitSet::with_capacity(sub.model.num_choices());
        for &choice in scheduler {
            support.insert(choice);
        }
        let induced = sub.model.restrict(&support);
        let chain = induced.model.collapse_to_chain()?;
        let chain_visits = chain.expected_visits();
        let chain_visits = Self::make_vector_defined(chain_visits, prop.minimizing);

        let mut visits = vec![0.0; sub.model.num_states()];
        for (chain_state, &sub_state) in induced.state_map.iter().enumerate() {
            visits[sub_state] = chain_visits[chain_state];
        }
        Ok(visits)
    }

    /// Score each inconsistent hole by the visit-weighted spread of choice
    /// values among its used options, averaged over contributing states.
    fn estimate_scheduler_difference(
        &self,
        sub: &SubMdp,
        inconsistent: &[Option<&Vec<usize>>],
        choice_values: &[f64],
        expected_visits: &[f64],
    ) -> Vec<Option<f64>> {
        let mut difference_sum = vec![0.0; self.num_holes];
        let mut states_affected = vec![0usize; self.num_holes];

        for state in 0..sub.model.num_states() {
            let mut hole_min: Vec<Option<f64>> = vec![None; self.num_holes];
            let mut hole_max: Vec<Option<f64>> = vec![None; self.num_holes];

            for choice in sub.model.choices_of(state) {
                let quotient_choice = sub.quotient_choice_map[choice];
                if self.default_actions.contains(quotient_choice) {
                    continue;
                }
                let value = choice_values[choice];
                for &(hole, option) in &self.action_to_hole_options[quotient_choice] {
                    let Some(used) = inconsistent[hole] else { continue };
                    if !used.contains(&option) {
                        continue;
                    }
                    hole_min[hole] = Some(hole_min[hole].map_or(value, |m: f64| m.min(value)));
                    hole_max[hole] = Some(hole_max[hole].map_or(value, |m: f64| m.max(value)));
                }
            }

            for hole in 0..self.num_holes {
                let (Some(min), Some(max)) = (hole_min[hole], hole_max[hole]) else { continue };
                let difference = (max - min) * expected_visits[state];
                debug_assert!(!difference.is_nan());
                difference_sum[hole] += difference;
                states_affected[hole] += 1;
            }
        }

        (0..self.num_holes)
            .map(|hole| {
                if inconsistent[hole].is_none() {
                    return None;
                }
                let states = states_affected[hole].max(1);
                Some(difference_sum[hole] / states as f64)
            })
            .collect()
    }

    /// Derive the scheduler's per-hole selection, decide consistency and,
    /// for inconsistent schedulers, compute the per-hole scores that drive
    /// splitter choice.
    pub fn scheduler_consistent(
        &self,
        family: &Family,
        prop: &Property,
        result: &CheckResult,
    ) -> Result<SchedulerAnalysis> {
        let sub = family.mdp.as_ref().expect("family sub-MDP must be built before analysis");

        if sub.is_chain() {
            let selection = family.holes().map(|h| vec![h.options[0]]).collect();
            return Ok(SchedulerAnalysis { selection, consistent: true, scores: None });
        }

        let scheduler = result.scheduler.as_deref().ok_or_else(|| {
            SynthesisError::Verifier {
                family: family.to_string(),
                property: prop.to_string(),
                source: anyhow::anyhow!("checker returned no scheduler for a nondeterministic model"),
            }
        })?;
        if scheduler.len() != sub.model.num_states()
            || scheduler
                .iter()
                .enumerate()
                .any(|(state, &choice)| !sub.model.choices_of(state).contains(&choice))
        {
            return Err(SynthesisError::Verifier {
                family: family.to_string(),
                property: prop.to_string(),
                source: anyhow::anyhow!("checker scheduler is not a valid memoryless selection"),
            });
        }

        let mut selection = self.scheduler_selection(sub, scheduler);

        let inconsistent: Vec<Option<&Vec<usize>>> = selection
            .iter()
            .map(|options| if options.len() > 1 { Some(options) } else { None })
            .collect();
        let consistent = inconsistent.iter().all(|entry| entry.is_none());

        let scores = if consistent {
            None
        } else {
            let choice_values = self.choice_values(sub, prop, &result.values)?;
            let expected_visits = self.scheduler_expected_visits(sub, prop, scheduler)?;
            Some(self.estimate_scheduler_difference(
                sub,
                &inconsistent,
                &choice_values,
                &expected_visits,
            ))
        };

        for (hole_index, options) in selection.iter_mut().enumerate() {
            if options.is_empty() {
                options.push(family.hole(hole_index).options[0]);
            }
        }

        Ok(SchedulerAnalysis { selection, consistent, scores })
    }

    /// Split a splitter's options into two halves.
    pub fn suboptions_half(family: &Family, splitter: usize) -> Vec<Vec<usize>> {
        let options = &family.hole(splitter).options;
        let half = options.len() / 2;
        vec![options[..half].to_vec(), options[half..].to_vec()]
    }

    /// One singleton core per used option, unused options distributed
    /// round-robin over the cores.
    pub fn suboptions_unique(
        family: &Family,
        splitter: usize,
        used_options: &[usize],
    ) -> Vec<Vec<usize>> {
        assert!(used_options.len() > 1);
        let mut suboptions: Vec<Vec<usize>> = used_options.iter().map(|&o| vec![o]).collect();
        let mut index = 0;
        for &option in &family.hole(splitter).options {
            if used_options.contains(&option) {
                continue;
            }
            suboptions[index].push(option);
            index = (index + 1) % suboptions.len();
        }
        suboptions
    }

    /// One singleton core per used option plus the list of unused options.
    pub fn suboptions_enumerate(
        family: &Family,
        splitter: usize,
        used_options: &[usize],
    ) -> (Vec<Vec<usize>>, Vec<usize>) {
        assert!(used_options.len() > 1);
        let core_suboptions = used_options.iter().map(|&o| vec![o]).collect();
        let other_suboptions = family
            .hole(splitter)
            .options
            .iter()
            .copied()
            .filter(|o| !used_options.contains(o))
            .collect();
        (core_suboptions, other_suboptions)
    }

    /// The maximal-score hole, ties broken by the lowest index.
    fn splitter_with_max_score(scores: &[Option<f64>]) -> usize {
        let mut best: Option<(usize, f64)> = None;
        for (hole, score) in scores.iter().enumerate() {
            let Some(score) = score else { continue };
            if best.map_or(true, |(_, best_score)| *score > best_score) {
                best = Some((hole, *score));
            }
        }
        best.expect("splitter choice requires at least one scored hole").0
    }

    /// Snapshot the family for its children.
    fn collect_parent_info(
        &self,
        family: &Family,
        result: &MdpSpecificationResult,
        splitter: usize,
        store_hints: bool,
        num_constraints: usize,
    ) -> ParentInfo {
        let mut analysis_hints = HashMap::new();
        if store_hints {
            let sub = family.mdp.as_ref().expect("family sub-MDP must be built before splitting");
            let generalize = |values: &[f64]| -> Vec<f64> {
                let mut global = vec![0.0; self.model.num_states()];
                for (state, &quotient_state) in sub.quotient_state_map.iter().enumerate() {
                    global[quotient_state] = values[state];
                }
                global
            };
            for &index in &result.constraints_result.undecided_constraints {
                let Some(res) = result.constraints_result.results[index].as_ref() else { continue };
                analysis_hints.insert(
                    index,
                    (
                        Some(generalize(&res.primary_values)),
                        res.secondary_values.as_deref().map(|values| generalize(values)),
                    ),
                );
            }
            if let Some(opt) = &result.optimality_result {
                analysis_hints
                    .insert(num_constraints, (Some(generalize(&opt.primary_values)), None));
            }
        }

        ParentInfo {
            selected_actions: family.selected_actions.clone().unwrap_or_default(),
            hole_selected_actions: family.hole_selected_actions.clone().unwrap_or_default(),
            refinement_depth: family.refinement_depth,
            property_indices: family.property_indices.clone(),
            analysis_hints,
            splitter,
        }
    }

    /// Split an undecided family along its highest-scored inconsistent
    /// hole. With incomplete search enabled, simple holes collapse to their
    /// scheduler-chosen option in every child and the remainder branch is
    /// dropped; the removed volume is reported back for accounting.
    pub fn split(
        &self,
        family: &mut Family,
        result: &MdpSpecificationResult,
        spec: &Specification,
        strategy: SplitStrategy,
        incomplete_search: bool,
        store_hints: bool,
    ) -> SplitOutcome {
        let (selection, scores) = result.split_basis();

        // fall back to uniform scores over the non-trivial holes
        let fallback;
        let scores: &[Option<f64>] = match scores {
            Some(scores) => scores,
            None => {
                fallback = family
                    .holes()
                    .map(|h| if h.is_trivial() { None } else { Some(0.0) })
                    .collect::<Vec<_>>();
                fallback.as_slice()
            }
        };

        let splitter = Self::splitter_with_max_score(scores);
        let used_options: Vec<usize> =
            selection.get(splitter).cloned().unwrap_or_default();

        let (core_suboptions, other_suboptions) = if used_options.len() > 1 {
            match strategy {
                SplitStrategy::CoreAndRemainder => {
                    Self::suboptions_enumerate(family, splitter, &used_options)
                }
                SplitStrategy::RoundRobin => {
                    (Self::suboptions_unique(family, splitter, &used_options), Vec::new())
                }
            }
        } else {
            assert!(family.hole(splitter).size() > 1, "splitter must have at least two options");
            (Self::suboptions_half(family, splitter), Vec::new())
        };

        // incomplete search: pin simple holes to their scheduler-chosen
        // option; sound for this sub-MDP only, so the savings count as
        // discarded rather than explored
        let mut reduced = family.clone();
        let mut discarded: u128 = 0;
        if incomplete_search {
            let sub = family.mdp.as_ref().expect("family sub-MDP must be built before splitting");
            let size_before = reduced.size();
            for hole_index in family.hole_indices() {
                if hole_index == splitter || !sub.hole_simple[hole_index] {
                    continue;
                }
                if let Some(options) = selection.get(hole_index) {
                    if options.len() == 1 {
                        reduced.assume_hole_options(hole_index, options.clone());
                    }
                }
            }
            discarded += size_before - reduced.size();
        }

        let mut suboptions: Vec<Vec<usize>> = Vec::new();
        if !other_suboptions.is_empty() {
            if incomplete_search {
                let remainder_volume: u128 = family
                    .hole_indices()
                    .map(|h| {
                        if h == splitter {
                            other_suboptions.len() as u128
                        } else {
                            reduced.hole(h).size() as u128
                        }
                    })
                    .product();
                discarded += remainder_volume;
            } else {
                // the remainder goes first so DFS resolves the cores before it
                suboptions.push(other_suboptions);
            }
        }
        suboptions.extend(core_suboptions);

        family.splitter = Some(splitter);
        let parent_info = std::sync::Arc::new(self.collect_parent_info(
            family,
            result,
            splitter,
            store_hints,
            spec.constraints.len(),
        ));

        let subfamilies = suboptions
            .into_iter()
            .map(|options| {
                let holes = reduced.subholes(splitter, options);
                Family::with_parent(holes, parent_info.clone())
            })
            .collect();

        SplitOutcome { subfamilies, discarded }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::{Direction, Objective};

    /// A quotient with two holes controlling successive states:
    /// state 0 branches by hole 0 (2 options), state 1 by hole 1 (2
    /// options), states 2 and 3 are sinks.
    fn two_hole_quotient() -> (Quotient, Family) {
        let mut model = SparseMdp::new(
            vec![0, 2, 4, 5, 6],
            vec![
                vec![(1, 1.0)], // s0, hole0=0
                vec![(3, 1.0)], // s0, hole0=1
                vec![(2, 1.0)], // s1, hole1=0
                vec![(3, 1.0)], // s1, hole1=1
                vec![(2, 1.0)], // s2 sink
                vec![(3, 1.0)], // s3 sink
            ],
            vec![0],
        )
        .unwrap();
        model.add_label("goal", &[2]).unwrap();

        let family = Family::new(vec![
            Hole::new("x", vec!["a".into(), "b".into()]),
            Hole::new("y", vec!["c".into(), "d".into()]),
        ]);
        let labelings = vec![
            vec![(0, 0)],
            vec![(0, 1)],
            vec![(1, 0)],
            vec![(1, 1)],
            vec![],
            vec![],
        ];
        let quotient = Quotient::new(model, labelings, &family).unwrap();
        (quotient, family)
    }

    fn reach_goal() -> Property {
        Property::constraint(
            Objective::Probability { target_label: "goal".into() },
            Direction::Maximize,
            0.5,
            false,
        )
    }

    #[test]
    fn test_new_rejects_bad_labelings() {
        let (quotient, family) = two_hole_quotient();
        let model = quotient.model().clone();
        assert!(Quotient::new(model.clone(), vec![vec![(7, 0)]; 6], &family).is_err());
        assert!(Quotient::new(model, vec![vec![(0, 9)]; 6], &family).is_err());
    }

    #[test]
    fn test_labeling_surface() {
        let (quotient, _family) = two_hole_quotient();
        assert_eq!(quotient.num_holes(), 2);
        assert!(quotient.is_default(4) && quotient.is_default(5));
        assert!(!quotient.is_default(0));
        assert_eq!(quotient.hole_options(1), &vec![(0, 1)]);
        // one color per distinct labeling
        assert_eq!(quotient.coloring().num_colors(), 4);
    }

    #[test]
    fn test_select_actions_root() {
        let (quotient, mut family) = two_hole_quotient();
        let selected = quotient.select_actions(&family);
        assert_eq!(selected.selected_actions, vec![0, 1, 2, 3]);
        assert!(selected.mask.contains(4) && selected.mask.contains(5));
        assert_eq!(selected.hole_selected_actions[0], vec![0, 1]);
        assert_eq!(selected.hole_selected_actions[1], vec![2, 3]);

        family.assume_hole_options(0, vec![1]);
        let selected = quotient.select_actions(&family);
        assert_eq!(selected.selected_actions, vec![1, 2, 3]);
    }

    #[test]
    fn test_select_actions_incremental_matches_root() {
        let (quotient, family) = two_hole_quotient();
        let root_selected = quotient.select_actions(&family);

        let parent_info = std::sync::Arc::new(ParentInfo {
            selected_actions: root_selected.selected_actions,
            hole_selected_actions: root_selected.hole_selected_actions,
            refinement_depth: 0,
            property_indices: vec![],
            analysis_hints: HashMap::new(),
            splitter: 0,
        });
        let child = Family::with_parent(family.subholes(0, vec![0]), parent_info);
        let incremental = quotient.select_actions(&child);

        // rescanning from scratch must agree with the incremental path
        let mut scratch = family.clone();
        scratch.assume_hole_options(0, vec![0]);
        let from_scratch = quotient.select_actions(&scratch);
        assert_eq!(incremental.selected_actions, from_scratch.selected_actions);
    }

    #[test]
    fn test_build_chain_for_singleton() {
        let (quotient, family) = two_hole_quotient();
        let assignment = family.construct_assignment(&[0, 0]);
        let chain = quotient.build_chain(&assignment).unwrap();

        assert!(chain.model.is_chain());
        // s0 -> s1 -> s2(goal), plus the goal sink
        assert_eq!(chain.quotient_state_map, vec![0, 1, 2]);
        assert_eq!(quotient.relevant_holes(&chain.quotient_choice_map), vec![0, 1]);
    }

    #[test]
    fn test_scheduler_selection_and_consistency() {
        let (quotient, mut family) = two_hole_quotient();
        quotient.build(&mut family, false);

        // scheduler picks hole0=0 in s0 and hole1=1 in s1: consistent
        let result = CheckResult {
            values: vec![0.0, 0.0, 0.0, 0.0],
            scheduler: Some(vec![0, 3, 4, 5]),
        };
        let analysis = quotient.scheduler_consistent(&family, &reach_goal(), &result).unwrap();
        assert!(analysis.consistent);
        assert_eq!(analysis.selection, vec![vec![0], vec![1]]);
        assert!(analysis.scores.is_none());
    }

    #[test]
    fn test_unreachable_choices_do_not_pollute_selection() {
        let (quotient, mut family) = two_hole_quotient();
        quotient.build(&mut family, false);

        // hole0=1 routes straight to the sink, so the choice of hole1 in
        // the unreachable state 1 must not show up in the selection
        let result = CheckResult {
            values: vec![0.0, 0.0, 0.0, 0.0],
            scheduler: Some(vec![1, 2, 4, 5]),
        };
        let analysis = quotient.scheduler_consistent(&family, &reach_goal(), &result).unwrap();
        assert!(analysis.consistent);
        assert_eq!(analysis.selection[0], vec![1]);
        // filled with the family's first option
        assert_eq!(analysis.selection[1], vec![0]);
    }

    #[test]
    fn test_make_vector_defined() {
        let sanitized =
            Quotient::make_vector_defined(vec![1.0, f64::INFINITY, 3.0], true);
        assert_eq!(sanitized, vec![1.0, 4.0 / 3.0, 3.0]);

        let sanitized =
            Quotient::make_vector_defined(vec![1.0, f64::INFINITY, 3.0], false);
        assert_eq!(sanitized, vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn test_suboptions_partitioners() {
        let family = Family::new(vec![Hole::new(
            "x",
            vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
        )]);

        assert_eq!(
            Quotient::suboptions_half(&family, 0),
            vec![vec![0, 1], vec![2, 3, 4]]
        );

        let (cores, other) = Quotient::suboptions_enumerate(&family, 0, &[1, 3]);
        assert_eq!(cores, vec![vec![1], vec![3]]);
        assert_eq!(other, vec![0, 2, 4]);

        let unique = Quotient::suboptions_unique(&family, 0, &[1, 3]);
        assert_eq!(unique, vec![vec![1, 0, 4], vec![3, 2]]);
    }

    #[test]
    fn test_splitter_with_max_score_prefers_lowest_index() {
        let scores = vec![Some(1.0), Some(3.0), None, Some(3.0)];
        assert_eq!(Quotient::splitter_with_max_score(&scores), 1);
    }
}
