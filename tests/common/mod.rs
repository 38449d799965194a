//! Test support: a reference value-iteration model checker
//!
//! Good enough for the small models the integration scenarios build:
//! reachability probabilities and expected total rewards via value
//! iteration, with deterministic first-best scheduler extraction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use skein::verifier::{CheckResult, Formula, ModelChecker};
use skein::{Direction, Objective, SparseMdp};

/// Tolerance when matching a choice value against the state optimum
const SCHEDULER_TOLERANCE: f64 = 1e-9;

pub struct ValueIteration {
    pub precision: f64,
    pub max_iterations: usize,
}

impl Default for ValueIteration {
    fn default() -> Self {
        Self { precision: 1e-12, max_iterations: 100_000 }
    }
}

impl ValueIteration {
    fn iterate(
        &self,
        model: &SparseMdp,
        maximize: bool,
        terminal: &fixedbitset::FixedBitSet,
        terminal_value: f64,
        choice_reward: impl Fn(usize) -> f64,
    ) -> Vec<f64> {
        let n = model.num_states();
        let mut values = vec![0.0; n];
        for state in terminal.ones() {
            values[state] = terminal_value;
        }

        for _ in 0..self.max_iterations {
            let mut next = values.clone();
            let mut delta: f64 = 0.0;
            for state in 0..n {
                if terminal.contains(state) {
                    continue;
                }
                let mut best: Option<f64> = None;
                for choice in model.choices_of(state) {
                    let mut value = choice_reward(choice);
                    for &(target, probability) in model.distribution(choice) {
                        value += probability * values[target];
                    }
                    best = Some(match best {
                        None => value,
                        Some(b) if maximize => b.max(value),
                        Some(b) => b.min(value),
                    });
                }
                let value = best.expect("every state has a choice");
                delta = delta.max((value - values[state]).abs());
                next[state] = value;
            }
            values = next;
            if delta <= self.precision {
                break;
            }
        }
        values
    }

    /// First choice realizing the state optimum.
    fn extract_scheduler(
        &self,
        model: &SparseMdp,
        values: &[f64],
        maximize: bool,
        terminal: &fixedbitset::FixedBitSet,
        choice_reward: impl Fn(usize) -> f64,
    ) -> Vec<usize> {
        (0..model.num_states())
            .map(|state| {
                let choices = model.choices_of(state);
                if terminal.contains(state) {
                    return choices.start;
                }
                let mut best_choice = choices.start;
                let mut best: Option<f64> = None;
                for choice in choices {
                    let mut value = choice_reward(choice);
                    for &(target, probability) in model.distribution(choice) {
                        value += probability * values[target];
                    }
                    let better = match best {
                        None => true,
                        Some(b) if maximize => value > b + SCHEDULER_TOLERANCE,
                        Some(b) => value < b - SCHEDULER_TOLERANCE,
                    };
                    if better {
                        best = Some(value);
                        best_choice = choice;
                    }
                }
                best_choice
            })
            .collect()
    }
}

impl ModelChecker for ValueIteration {
    fn check(
        &self,
        model: &SparseMdp,
        formula: &Formula,
        _hint: Option<&[f64]>,
    ) -> anyhow::Result<CheckResult> {
        let maximize = formula.direction == Direction::Maximize;
        let (values, scheduler) = match &formula.objective {
            Objective::Probability { target_label } => {
                let targets = model
                    .label_states(target_label)
                    .ok_or_else(|| anyhow!("unknown label `{target_label}`"))?;
                let values = self.iterate(model, maximize, targets, 1.0, |_| 0.0);
                let scheduler = self.extract_scheduler(model, &values, maximize, targets, |_| 0.0);
                (values, scheduler)
            }
            Objective::Reward { reward_model, target_label } => {
                let targets = model
                    .label_states(target_label)
                    .ok_or_else(|| anyhow!("unknown label `{target_label}`"))?;
                let rewards = model
                    .reward_model(reward_model)
                    .with_context(|| format!("unknown reward model `{reward_model}`"))?;
                let values = self.iterate(model, maximize, targets, 0.0, |c| rewards[c]);
                let scheduler =
                    self.extract_scheduler(model, &values, maximize, targets, |c| rewards[c]);
                (values, scheduler)
            }
        };

        let scheduler = if model.is_chain() { None } else { Some(scheduler) };
        Ok(CheckResult { values, scheduler })
    }
}

/// Wrapper counting how many queries arrived with a warm-start hint.
/// The counter is shared so tests keep a handle after the probe moves
/// into the synthesizer.
pub struct HintProbe {
    inner: ValueIteration,
    hinted: Arc<AtomicUsize>,
}

impl HintProbe {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let hinted = Arc::new(AtomicUsize::new(0));
        let probe = Self { inner: ValueIteration::default(), hinted: hinted.clone() };
        (probe, hinted)
    }
}

impl ModelChecker for HintProbe {
    fn check(
        &self,
        model: &SparseMdp,
        formula: &Formula,
        hint: Option<&[f64]>,
    ) -> anyhow::Result<CheckResult> {
        if hint.is_some() {
            self.hinted.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.check(model, formula, hint)
    }
}
