//! Skein: family search engine for probabilistic program synthesis
//!
//! Skein searches a structured space of candidate programs ("holes" with
//! finite option catalogs) for an instantiation satisfying a conjunction of
//! verification constraints, or proves that none exists. The search runs
//! abstraction refinement over a quotient MDP: each family of candidates is
//! projected onto a sub-MDP, an external model checker brackets every
//! scheduler between a primary and a secondary direction, and undecided
//! families are split along the hole their optimal scheduler is most
//! inconsistent about. Refuted assignments accumulate in a SAT-backed
//! conflict cache that prunes the remaining space.
//!
//! # Architecture
//!
//! ```text
//! Sketch frontend  →  Quotient MDP + labelings  →  Skein  →  Model checker
//!                                                    ↓
//!                               feasible assignment / infeasibility proof
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use skein::verifier::{CheckResult, Formula, ModelChecker};
//! use skein::{
//!     Direction, Objective, Property, Quotient, SparseMdp, Specification, SynthesisConfig,
//!     Synthesizer,
//! };
//!
//! struct MyChecker;
//!
//! impl ModelChecker for MyChecker {
//!     fn check(
//!         &self,
//!         _model: &SparseMdp,
//!         _formula: &Formula,
//!         _hint: Option<&[f64]>,
//!     ) -> anyhow::Result<CheckResult> {
//!         unimplemented!("bridge to your model checker")
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let model = SparseMdp::new(
//!         vec![0, 2, 3, 4],
//!         vec![vec![(1, 1.0)], vec![(2, 1.0)], vec![(1, 1.0)], vec![(2, 1.0)]],
//!         vec![0],
//!     )?;
//!     let (quotient, family) = Quotient::from_state_actions(model)?;
//!
//!     let spec = Specification::new(vec![Property::constraint(
//!         Objective::Probability { target_label: "goal".into() },
//!         Direction::Maximize,
//!         0.5,
//!         false,
//!     )]);
//!
//!     let mut synthesizer =
//!         Synthesizer::new(quotient, spec, Box::new(MyChecker), SynthesisConfig::default())?;
//!     let outcome = synthesizer.synthesize(family)?;
//!     println!("status: {:?}, assignment: {:?}", outcome.status, outcome.assignment);
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod family;
pub mod model;
pub mod quotient;
pub mod smt;
pub mod spec;
pub mod statistics;
pub mod verifier;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use error::SynthesisError;
pub use family::{CombinationColoring, Family, Hole, ParentInfo};
pub use model::{Chain, SparseMdp, SubMdp};
pub use quotient::{Quotient, SplitStrategy};
pub use smt::{BackendKind, ConflictCache};
pub use spec::{Feasibility, Property, PropertyKind, Specification};
pub use statistics::{Statistics, StatisticsSummary};
pub use verifier::{CheckResult, Direction, ModelChecker, Objective};

use error::Result;
use spec::MdpSpecificationResult;

/// Synthesis loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Collapse simple holes to their scheduler-chosen option and drop the
    /// remainder branch when splitting; the savings count as discarded
    pub incomplete_search: bool,

    /// How a splitter's options are partitioned into children
    pub split_strategy: SplitStrategy,

    /// Keep value vectors across refinement to warm-start the checker
    pub store_hints: bool,

    /// Deadline for the whole run, observed between refinement steps
    pub timeout: Option<Duration>,

    /// How often the progress line is emitted
    pub status_period_secs: u64,

    /// Conflict-cache solver backend
    pub conflict_backend: BackendKind,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            incomplete_search: false,
            split_strategy: SplitStrategy::CoreAndRemainder,
            store_hints: true,
            timeout: None,
            status_period_secs: 3,
            conflict_backend: BackendKind::default(),
        }
    }
}

/// How a synthesis run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynthesisStatus {
    /// A double-checked feasible assignment was found
    Feasible,

    /// Every assignment of the root family violates the specification
    Infeasible,

    /// The deadline fired with families still unexplored
    Cancelled,
}

/// Result of one synthesis run
#[derive(Debug)]
pub struct SynthesisOutcome {
    pub status: SynthesisStatus,

    /// The feasible (or best, under optimality) assignment found
    pub assignment: Option<Family>,

    /// Value of the optimality objective at `assignment`
    pub optimum: Option<f64>,

    pub stats: StatisticsSummary,
}

impl SynthesisOutcome {
    /// Feasibility as a tri-state: `None` when the run was cancelled.
    pub fn feasible(&self) -> Option<bool> {
        match self.status {
            SynthesisStatus::Feasible => Some(true),
            SynthesisStatus::Infeasible => Some(false),
            SynthesisStatus::Cancelled => None,
        }
    }
}

/// The abstraction-refinement synthesizer.
///
/// Owns the quotient coordinator, the specification and the model checker;
/// one instance runs one design space at a time and accumulates the
/// explored/discarded accounting for it.
pub struct Synthesizer {
    quotient: Quotient,
    specification: Specification,
    checker: Box<dyn ModelChecker>,
    config: SynthesisConfig,

    /// Assignments classified by verification
    explored: u128,

    /// Assignments pruned without their own verification call
    discarded: u128,

    /// Incumbent optimality value
    optimum: Option<f64>,

    /// Incumbent assignment
    best_assignment: Option<Family>,

    /// Conflict cache of the last (or in-flight) run
    cache: Option<ConflictCache>,

    stats: Statistics,
}

impl Synthesizer {
    /// Create a synthesizer for one quotient and specification.
    pub fn new(
        quotient: Quotient,
        specification: Specification,
        checker: Box<dyn ModelChecker>,
        config: SynthesisConfig,
    ) -> Result<Self> {
        if specification.constraints.is_empty() && !specification.has_optimality() {
            return Err(SynthesisError::InvalidInput(
                "specification declares no constraints and no optimality objective".into(),
            ));
        }
        let stats = Statistics::new(Duration::from_secs(config.status_period_secs));
        Ok(Self {
            quotient,
            specification,
            checker,
            config,
            explored: 0,
            discarded: 0,
            optimum: None,
            best_assignment: None,
            cache: None,
            stats,
        })
    }

    pub fn specification(&self) -> &Specification {
        &self.specification
    }

    pub fn quotient(&self) -> &Quotient {
        &self.quotient
    }

    /// Search the family for a feasible assignment, or the optimal one if
    /// an optimality objective is declared.
    pub fn synthesize(&mut self, mut family: Family) -> Result<SynthesisOutcome> {
        assert_eq!(family.refinement_depth, 0, "synthesis starts from a root family");

        family.property_indices = self.specification.all_constraint_indices();
        let root_size = family.size();

        self.explored = 0;
        self.discarded = 0;
        self.optimum = None;
        self.best_assignment = None;
        self.stats = Statistics::new(Duration::from_secs(self.config.status_period_secs));
        self.stats.start();

        tracing::info!(
            holes = family.num_holes(),
            size = %root_size,
            quotient_states = self.quotient.model().num_states(),
            quotient_actions = self.quotient.model().num_choices(),
            "synthesis started"
        );

        let mut cache = ConflictCache::with_backend(&family, self.config.conflict_backend);
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let mut frontier: Vec<Family> = vec![family];
        let mut cancelled = false;

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::warn!(frontier = frontier.len(), "deadline reached, cancelling");
                    cancelled = true;
                    break;
                }
            }
            let Some(mut family) = frontier.pop() else { break };

            // the cache scope mirrors the refinement depth of this family
            cache.set_scope_depth(family.refinement_depth);
            if !cache.is_satisfiable(&family) {
                tracing::debug!(family = %family, "family exhausted by conflicts");
                self.discarded += family.size();
                continue;
            }

            self.quotient.build(&mut family, self.config.store_hints);
            let sub_states = family
                .mdp
                .as_ref()
                .expect("sub-MDP present after build")
                .model
                .num_states();
            self.stats.iteration_mdp(sub_states);

            let result = spec::check_mdp_specification(
                &self.quotient,
                &family,
                &self.specification,
                self.optimum,
                self.checker.as_ref(),
            )?;
            family.property_indices = result.constraints_result.undecided_constraints.clone();

            let (candidate, can_improve) = result.improving(&family);
            tracing::debug!(
                family = %family,
                feasibility = ?result.constraints_result.feasibility,
                candidate = candidate.is_some(),
                can_improve,
                "family evaluated"
            );

            let mut accepted = false;
            if let Some(candidate) = candidate {
                accepted = self.double_check(&mut cache, &family, candidate)?;
            }

            if result.constraints_result.feasibility == Feasibility::Unsat {
                self.learn_infeasible(&mut cache, &family);
            }

            if !can_improve {
                self.explored += family.size();
            }

            if accepted && !self.specification.has_optimality() {
                if can_improve {
                    // only the double-checked singleton counts as explored
                    self.explored += 1;
                }
                break;
            }

            if can_improve {
                let split = self.split(&mut family, &result);
                self.discarded += split.discarded;
                frontier.extend(split.subfamilies);
            }

            self.stats.report_progress(self.explored, self.discarded, root_size);
        }

        let frontier_remaining = frontier.len();
        self.cache = Some(cache);
        if !cancelled {
            // whatever was left behind by an early feasible exit is pruned,
            // not explored
            self.discarded += root_size.saturating_sub(self.explored + self.discarded);
        }

        let status = if cancelled {
            SynthesisStatus::Cancelled
        } else if self.best_assignment.is_some() {
            SynthesisStatus::Feasible
        } else {
            SynthesisStatus::Infeasible
        };
        let stats = self.stats.finish(self.explored, self.discarded, root_size, frontier_remaining);
        let outcome = SynthesisOutcome {
            status,
            assignment: self.best_assignment.clone(),
            optimum: self.optimum,
            stats,
        };

        tracing::info!(
            status = ?outcome.status,
            assignment = ?outcome.assignment.as_ref().map(|a| a.to_string()),
            optimum = outcome.optimum,
            explored_fraction = outcome.stats.explored_fraction,
            synthesis_time_secs = outcome.stats.synthesis_time_secs,
            "synthesis finished"
        );
        Ok(outcome)
    }

    /// Verify a candidate singleton against the full specification on its
    /// chain. Acceptance updates the incumbent; refutation learns a
    /// conflict.
    fn double_check(
        &mut self,
        cache: &mut ConflictCache,
        family: &Family,
        candidate: Family,
    ) -> Result<bool> {
        assert!(candidate.is_singleton(), "double-checking requires a singleton");

        let chain = self.quotient.build_chain(&candidate)?;
        self.stats.iteration_dtmc(chain.model.num_states());

        let result = spec::check_chain_specification(
            &chain,
            &self.specification,
            self.optimum,
            self.checker.as_ref(),
            &candidate,
        )?;

        if result.accepts() {
            if let Some(opt) = &result.optimality_result {
                tracing::info!(value = opt.value, assignment = %candidate, "optimum improved");
                self.optimum = Some(opt.value);
            } else {
                tracing::info!(assignment = %candidate, "feasible assignment found");
            }
            self.best_assignment = Some(candidate);
            return Ok(true);
        }

        // the chain depends only on the holes labeling its choices; any
        // assignment agreeing there is refuted as well
        let mut conflict = self.quotient.relevant_holes(&chain.quotient_choice_map);
        if conflict.is_empty() {
            conflict = family.hole_indices().collect();
        }
        let pruned = cache.exclude_assignment(family, &candidate, &conflict);
        cache.exclude_family(&candidate);
        tracing::debug!(assignment = %candidate, pruned_estimate = %pruned, "candidate refuted");
        Ok(false)
    }

    /// Record a verified whole-family refutation in the cache; singletons
    /// additionally learn a generalized conflict over their relevant holes.
    fn learn_infeasible(&mut self, cache: &mut ConflictCache, family: &Family) {
        cache.exclude_family(family);
        if !family.is_singleton() {
            return;
        }
        let sub = family.mdp.as_ref().expect("sub-MDP present after build");
        let mut conflict = self.quotient.relevant_holes(&sub.quotient_choice_map);
        if conflict.is_empty() {
            conflict = family.hole_indices().collect();
        }
        if conflict.len() < family.num_holes() {
            let pruned = cache.exclude_assignment(family, family, &conflict);
            tracing::debug!(family = %family, pruned_estimate = %pruned, "conflict learned");
        }
    }

    fn split(
        &mut self,
        family: &mut Family,
        result: &MdpSpecificationResult,
    ) -> quotient::SplitOutcome {
        self.quotient.split(
            family,
            result,
            &self.specification,
            self.config.split_strategy,
            self.config.incomplete_search,
            self.config.store_hints,
        )
    }

    /// Run statistics of the last (or in-flight) run.
    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Conflict cache of the last run, if one completed.
    pub fn conflict_cache(&mut self) -> Option<&mut ConflictCache> {
        self.cache.as_mut()
    }
}
