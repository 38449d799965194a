//! External model-checker interface
//!
//! The core never computes probabilities or expected rewards itself; it
//! hands a model and a formula to a [`ModelChecker`] and interprets the
//! returned value vector and scheduler. Checker precision is configured
//! once at startup by the embedding application.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::SparseMdp;

/// Optimization direction of a formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Self::Minimize => Self::Maximize,
            Self::Maximize => Self::Minimize,
        }
    }
}

/// What a formula measures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Objective {
    /// Probability of eventually reaching the labeled states
    Probability {
        target_label: String,
    },

    /// Expected accumulated reward until reaching the labeled states
    Reward {
        reward_model: String,
        target_label: String,
    },
}

/// A formula as handed to the model checker: an objective plus the
/// direction in which to optimize it over schedulers. On chains the
/// direction is irrelevant and checkers may ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub objective: Objective,
    pub direction: Direction,
}

impl Formula {
    pub fn new(objective: Objective, direction: Direction) -> Self {
        Self { objective, direction }
    }

    /// The same objective, optimized in the opposite direction.
    pub fn flipped(&self) -> Self {
        Self {
            objective: self.objective.clone(),
            direction: self.direction.flipped(),
        }
    }

    /// Name of the reward model, for reward objectives.
    pub fn reward_model(&self) -> Option<&str> {
        match &self.objective {
            Objective::Reward { reward_model, .. } => Some(reward_model),
            Objective::Probability { .. } => None,
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Minimize => "min",
            Direction::Maximize => "max",
        };
        match &self.objective {
            Objective::Probability { target_label } => {
                write!(f, "P{dir}=? [F \"{target_label}\"]")
            }
            Objective::Reward { reward_model, target_label } => {
                write!(f, "R{{\"{reward_model}\"}}{dir}=? [F \"{target_label}\"]")
            }
        }
    }
}

/// Result of one model-checking query
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Value of the formula in every state of the checked model
    pub values: Vec<f64>,

    /// Optimizing memoryless deterministic scheduler: for each state, the
    /// chosen choice index of the checked model. Present for
    /// nondeterministic models, absent for chains.
    pub scheduler: Option<Vec<usize>>,
}

/// A model checker consumed by the synthesis core.
///
/// The optional hint is a prior value vector for the checked model's states
/// that iterative solvers may use to warm-start; implementations are free
/// to ignore it. Hints are best effort and may be stale.
pub trait ModelChecker {
    fn check(
        &self,
        model: &SparseMdp,
        formula: &Formula,
        hint: Option<&[f64]>,
    ) -> anyhow::Result<CheckResult>;
}
