//! Sparse transition systems and sub-model construction
//!
//! The quotient MDP and every restricted sub-model share one sparse
//! representation: choices are grouped by state, each choice carries its
//! probability distribution, and labels, rewards and initial states ride
//! along. Restriction by an action mask preserves sub-to-super state and
//! choice maps so analysis results can be projected back.

use std::collections::HashMap;

use fixedbitset::FixedBitSet;

use crate::error::{Result, SynthesisError};
use crate::family::HintPair;

/// Iteration cap for the expected-visits fixpoint; states still growing
/// after this many rounds are treated as visited infinitely often.
const VISITS_MAX_ITERATIONS: usize = 10_000;
const VISITS_TOLERANCE: f64 = 1e-12;

/// A sparse Markov decision process. A chain is the special case with a
/// trivial row grouping (exactly one choice per state).
#[derive(Debug, Clone)]
pub struct SparseMdp {
    /// First choice of each state; one sentinel entry past the end
    row_groups: Vec<usize>,

    /// Probability distribution of each choice
    transitions: Vec<Vec<(usize, f64)>>,

    /// Initial states
    initial_states: Vec<usize>,

    /// State labelings, by label name
    labels: HashMap<String, FixedBitSet>,

    /// State-action reward vectors, by reward model name
    reward_models: HashMap<String, Vec<f64>>,
}

impl SparseMdp {
    /// Assemble a model from explicit row groups and distributions.
    pub fn new(
        row_groups: Vec<usize>,
        transitions: Vec<Vec<(usize, f64)>>,
        initial_states: Vec<usize>,
    ) -> Result<Self> {
        if row_groups.len() < 2 {
            return Err(SynthesisError::InvalidInput("model must have at least one state".into()));
        }
        let num_states = row_groups.len() - 1;
        let num_choices = *row_groups.last().unwrap();
        if row_groups[0] != 0 || row_groups.windows(2).any(|w| w[0] >= w[1]) {
            return Err(SynthesisError::InvalidInput(
                "row groups must start at 0 and grow strictly".into(),
            ));
        }
        if transitions.len() != num_choices {
            return Err(SynthesisError::InvalidInput(format!(
                "expected {} choice distributions, got {}",
                num_choices,
                transitions.len()
            )));
        }
        for (choice, distribution) in transitions.iter().enumerate() {
            if distribution.is_empty() {
                return Err(SynthesisError::InvalidInput(format!(
                    "choice {choice} has an empty distribution"
                )));
            }
            for &(target, probability) in distribution {
                if target >= num_states {
                    return Err(SynthesisError::InvalidInput(format!(
                        "choice {choice} targets unknown state {target}"
                    )));
                }
                if !(probability > 0.0 && probability.is_finite()) {
                    return Err(SynthesisError::InvalidInput(format!(
                        "choice {choice} carries a non-positive probability"
                    )));
                }
            }
        }
        if initial_states.is_empty() {
            return Err(SynthesisError::InvalidInput("model declares no initial state".into()));
        }
        for &state in &initial_states {
            if state >= num_states {
                return Err(SynthesisError::InvalidInput(format!(
                    "initial state {state} out of range"
                )));
            }
        }
        Ok(Self {
            row_groups,
            transitions,
            initial_states,
            labels: HashMap::new(),
            reward_models: HashMap::new(),
        })
    }

    /// Attach a state labeling.
    pub fn add_label(&mut self, name: impl Into<String>, states: &[usize]) -> Result<()> {
        let mut set = FixedBitSet::with_capacity(self.num_states());
        for &state in states {
            if state >= self.num_states() {
                return Err(SynthesisError::InvalidInput(format!(
                    "label references unknown state {state}"
                )));
            }
            set.insert(state);
        }
        self.labels.insert(name.into(), set);
        Ok(())
    }

    /// Attach a state-action reward vector, one entry per choice.
    pub fn add_reward_model(&mut self, name: impl Into<String>, rewards: Vec<f64>) -> Result<()> {
        if rewards.len() != self.num_choices() {
            return Err(SynthesisError::InvalidInput(format!(
                "reward model needs {} entries, got {}",
                self.num_choices(),
                rewards.len()
            )));
        }
        self.reward_models.insert(name.into(), rewards);
        Ok(())
    }

    pub fn num_states(&self) -> usize {
        self.row_groups.len() - 1
    }

    pub fn num_choices(&self) -> usize {
        self.transitions.len()
    }

    /// One choice per state
    pub fn is_chain(&self) -> bool {
        self.num_choices() == self.num_states()
    }

    pub fn initial_states(&self) -> &[usize] {
        &self.initial_states
    }

    /// Choices available in a state
    pub fn choices_of(&self, state: usize) -> std::ops::Range<usize> {
        self.row_groups[state]..self.row_groups[state + 1]
    }

    /// Probability distribution of a choice
    pub fn distribution(&self, choice: usize) -> &[(usize, f64)] {
        &self.transitions[choice]
    }

    /// States carrying a label
    pub fn label_states(&self, name: &str) -> Option<&FixedBitSet> {
        self.labels.get(name)
    }

    /// A state-action reward vector
    pub fn reward_model(&self, name: &str) -> Option<&[f64]> {
        self.reward_models.get(name).map(|r| r.as_slice())
    }

    /// Restrict the model to the choices set in `action_mask`, dropping
    /// states unreachable from the initial states.
    ///
    /// Returns the restricted model together with sub-to-super state and
    /// choice maps.
    pub fn restrict(&self, action_mask: &FixedBitSet) -> SubModel {
        // forward reachability over kept choices
        let mut reachable = FixedBitSet::with_capacity(self.num_states());
        let mut queue: Vec<usize> = Vec::new();
        for &state in &self.initial_states {
            if !reachable.contains(state) {
                reachable.insert(state);
                queue.push(state);
            }
        }
        while let Some(state) = queue.pop() {
            for choice in self.choices_of(state) {
                if !action_mask.contains(choice) {
                    continue;
                }
                for &(target, _) in &self.transitions[choice] {
                    if !reachable.contains(target) {
                        reachable.insert(target);
                        queue.push(target);
                    }
                }
            }
        }

        let state_map: Vec<usize> = reachable.ones().collect();
        let mut old_to_new = vec![usize::MAX; self.num_states()];
        for (new, &old) in state_map.iter().enumerate() {
            old_to_new[old] = new;
        }

        let mut row_groups = Vec::with_capacity(state_map.len() + 1);
        let mut transitions = Vec::new();
        let mut choice_map = Vec::new();
        row_groups.push(0);
        for &old_state in &state_map {
            for choice in self.choices_of(old_state) {
                if !action_mask.contains(choice) {
                    continue;
                }
                let distribution = self.transitions[choice]
                    .iter()
                    .map(|&(target, probability)| (old_to_new[target], probability))
                    .collect();
                transitions.push(distribution);
                choice_map.push(choice);
            }
            row_groups.push(transitions.len());
        }

        let initial_states = self
            .initial_states
            .iter()
            .filter(|&&s| reachable.contains(s))
            .map(|&s| old_to_new[s])
            .collect();

        let labels = self
            .labels
            .iter()
            .map(|(name, states)| {
                let mut projected = FixedBitSet::with_capacity(state_map.len());
                for (new, &old) in state_map.iter().enumerate() {
                    if states.contains(old) {
                        projected.insert(new);
                    }
                }
                (name.clone(), projected)
            })
            .collect();

        let reward_models = self
            .reward_models
            .iter()
            .map(|(name, rewards)| {
                let projected = choice_map.iter().map(|&c| rewards[c]).collect();
                (name.clone(), projected)
            })
            .collect();

        let model = Self {
            row_groups,
            transitions,
            initial_states,
            labels,
            reward_models,
        };
        SubModel { model, state_map, choice_map }
    }

    /// Collapse a model whose nondeterminism is fully resolved into a chain
    /// with a trivial row grouping.
    pub fn collapse_to_chain(&self) -> Result<SparseMdp> {
        for state in 0..self.num_states() {
            let choices = self.choices_of(state).len();
            if choices != 1 {
                return Err(SynthesisError::InvalidInput(format!(
                    "state {state} retains {choices} actions under a full assignment"
                )));
            }
        }
        let mut chain = self.clone();
        chain.row_groups = (0..=self.num_states()).collect();
        Ok(chain)
    }

    /// Per-choice expectation of a state value vector:
    /// `out[c] = sum over (t, p) of p * values[t]`.
    pub fn multiply_with_values(&self, values: &[f64]) -> Vec<f64> {
        self.transitions
            .iter()
            .map(|distribution| {
                distribution
                    .iter()
                    .map(|&(target, probability)| probability * values[target])
                    .sum()
            })
            .collect()
    }

    /// Expected number of visits of every state of a chain, starting from
    /// the initial states. Absorbing and recurrent states come out as
    /// `f64::INFINITY`.
    pub fn expected_visits(&self) -> Vec<f64> {
        assert!(self.is_chain(), "expected visits are defined on chains");
        let n = self.num_states();

        // a state that only loops back to itself is visited forever
        let absorbing: Vec<bool> = (0..n)
            .map(|state| self.transitions[state].iter().all(|&(target, _)| target == state))
            .collect();

        let mut init = vec![0.0; n];
        for &state in &self.initial_states {
            init[state] = 1.0;
        }

        let mut visits = init.clone();
        let mut converged = vec![false; n];
        for _ in 0..VISITS_MAX_ITERATIONS {
            let mut next = init.clone();
            for state in 0..n {
                if absorbing[state] {
                    continue;
                }
                let inflow = visits[state];
                if inflow == 0.0 {
                    continue;
                }
                for &(target, probability) in &self.transitions[state] {
                    next[target] += probability * inflow;
                }
            }
            let mut all_converged = true;
            for state in 0..n {
                converged[state] = (next[state] - visits[state]).abs() <= VISITS_TOLERANCE;
                all_converged &= converged[state];
            }
            visits = next;
            if all_converged {
                break;
            }
        }
        for state in 0..n {
            if absorbing[state] || !converged[state] {
                visits[state] = f64::INFINITY;
            }
        }
        visits
    }
}

/// A restricted model with maps back to the model it was cut from.
#[derive(Debug, Clone)]
pub struct SubModel {
    pub model: SparseMdp,

    /// For each sub-model state, the originating state
    pub state_map: Vec<usize>,

    /// For each sub-model choice, the originating choice
    pub choice_map: Vec<usize>,
}

/// The sub-MDP realized for one family, carrying quotient maps, per-hole
/// simplicity flags and optional warm-start hints.
#[derive(Debug)]
pub struct SubMdp {
    pub model: SparseMdp,

    /// Sub-state to quotient-state map
    pub quotient_state_map: Vec<usize>,

    /// Sub-choice to quotient-choice map
    pub quotient_choice_map: Vec<usize>,

    /// For each hole, whether its actions occur in exactly one state of
    /// this sub-MDP
    pub hole_simple: Vec<bool>,

    /// Per-constraint value vectors inherited from the parent family,
    /// indexed by this sub-MDP's states
    pub analysis_hints: Option<HashMap<usize, HintPair>>,
}

impl SubMdp {
    pub fn is_chain(&self) -> bool {
        self.model.is_chain()
    }
}

/// A deterministic chain built from a fully resolved family.
#[derive(Debug)]
pub struct Chain {
    pub model: SparseMdp,

    /// Chain-state to quotient-state map
    pub quotient_state_map: Vec<usize>,

    /// Chain-state to quotient-choice map (one choice per state)
    pub quotient_choice_map: Vec<usize>,
}
