//! Conflict cache over integer hole variables
//!
//! One solver context tracks the whole search: per hole an integer
//! variable with a precomputed list of equality literals, a scope stack
//! whose depth mirrors the refinement depth of the family being processed,
//! and accumulated conflict clauses generalizing refuted assignments.
//!
//! Two backends sit behind one interface built from the logical operations
//! (equality literal, conjunction, disjunction, negation, assert, push,
//! pop, check-sat under assumptions, model value): a SAT solver over a
//! one-hot domain encoding, and a plain backtracking enumerator useful for
//! small spaces and for cross-checking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use varisat::{ExtendFormula, Lit, Solver};

use crate::family::Family;

/// Handle into the term arena
pub type TermId = usize;

/// Propositional terms over hole-option equalities
#[derive(Debug, Clone)]
enum Term {
    /// `hole == option`
    Eq { hole: usize, option: usize },
    And(Vec<TermId>),
    Or(Vec<TermId>),
    Not(TermId),
}

/// Append-only arena of terms shared by all backends
#[derive(Debug, Default)]
pub struct TermArena {
    terms: Vec<Term>,
}

impl TermArena {
    fn push(&mut self, term: Term) -> TermId {
        self.terms.push(term);
        self.terms.len() - 1
    }

    pub fn eq(&mut self, hole: usize, option: usize) -> TermId {
        self.push(Term::Eq { hole, option })
    }

    pub fn and(&mut self, operands: Vec<TermId>) -> TermId {
        self.push(Term::And(operands))
    }

    pub fn or(&mut self, operands: Vec<TermId>) -> TermId {
        self.push(Term::Or(operands))
    }

    pub fn not(&mut self, operand: TermId) -> TermId {
        self.push(Term::Not(operand))
    }
}

/// The logical operations a conflict-cache backend must support
pub trait SolverBackend {
    /// Introduce the integer variable of the next hole, ranging over
    /// `0..cardinality`.
    fn declare_hole(&mut self, cardinality: usize);

    /// Assert a term at the current scope depth.
    fn assert_term(&mut self, arena: &TermArena, term: TermId);

    /// Assert a term at the root scope, surviving every pop.
    fn assert_root(&mut self, arena: &TermArena, term: TermId);

    fn push(&mut self);

    fn pop(&mut self);

    /// Check satisfiability of the asserted terms under the given
    /// assumptions; on success a model is retained for [`Self::value`].
    fn check(&mut self, arena: &TermArena, assumptions: &[TermId]) -> bool;

    /// Model value of a hole variable after a successful check.
    fn value(&self, hole: usize) -> usize;
}

/// Which backend the conflict cache runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// One-hot SAT encoding with activation-literal scopes
    #[default]
    Sat,

    /// Chronological backtracking over the hole domains
    Enumeration,
}

/// SAT backend: every hole option becomes a boolean with an exactly-one
/// constraint; terms are Tseitin-compiled once; scopes are activation
/// literals assumed while the scope is open and permanently disabled on
/// pop.
struct SatBackend {
    solver: Solver<'static>,

    /// One positive literal per hole option
    hole_lits: Vec<Vec<Lit>>,

    /// Tseitin definitions already emitted
    compiled: HashMap<TermId, Lit>,

    /// Activation literal of each open scope
    scope_lits: Vec<Lit>,

    /// Model extracted by the last successful check
    model: Vec<usize>,
}

impl SatBackend {
    fn new() -> Self {
        Self {
            solver: Solver::new(),
            hole_lits: Vec::new(),
            compiled: HashMap::new(),
            scope_lits: Vec::new(),
            model: Vec::new(),
        }
    }

    /// Compile a term to its defining literal. Definitional clauses are
    /// equivalences, so they are asserted globally and survive pops.
    fn compile(&mut self, arena: &TermArena, term: TermId) -> Lit {
        if let Some(&lit) = self.compiled.get(&term) {
            return lit;
        }
        let lit = match arena.terms[term].clone() {
            Term::Eq { hole, option } => self.hole_lits[hole][option],
            Term::Not(operand) => !self.compile(arena, operand),
            Term::And(operands) => {
                let lits: Vec<Lit> = operands.iter().map(|&o| self.compile(arena, o)).collect();
                let def = self.solver.new_lit();
                let mut long_clause = vec![def];
                for &lit in &lits {
                    self.solver.add_clause(&[!def, lit]);
                    long_clause.push(!lit);
                }
                self.solver.add_clause(&long_clause);
                def
            }
            Term::Or(operands) => {
                let lits: Vec<Lit> = operands.iter().map(|&o| self.compile(arena, o)).collect();
                let def = self.solver.new_lit();
                let mut long_clause = vec![!def];
                for &lit in &lits {
                    self.solver.add_clause(&[def, !lit]);
                    long_clause.push(lit);
                }
                self.solver.add_clause(&long_clause);
                def
            }
        };
        self.compiled.insert(term, lit);
        lit
    }
}

impl SolverBackend for SatBackend {
    fn declare_hole(&mut self, cardinality: usize) {
        let lits: Vec<Lit> = (0..cardinality).map(|_| self.solver.new_lit()).collect();
        self.solver.add_clause(&lits);
        for i in 0..lits.len() {
            for j in i + 1..lits.len() {
                self.solver.add_clause(&[!lits[i], !lits[j]]);
            }
        }
        self.hole_lits.push(lits);
        self.model.push(0);
    }

    fn assert_term(&mut self, arena: &TermArena, term: TermId) {
        let lit = self.compile(arena, term);
        match self.scope_lits.last() {
            Some(&activation) => self.solver.add_clause(&[!activation, lit]),
            None => self.solver.add_clause(&[lit]),
        }
    }

    fn assert_root(&mut self, arena: &TermArena, term: TermId) {
        let lit = self.compile(arena, term);
        self.solver.add_clause(&[lit]);
    }

    fn push(&mut self) {
        let activation = self.solver.new_lit();
        self.scope_lits.push(activation);
    }

    fn pop(&mut self) {
        let activation = self.scope_lits.pop().expect("scope stack underflow");
        // clauses guarded by this scope become vacuous for good
        self.solver.add_clause(&[!activation]);
    }

    fn check(&mut self, arena: &TermArena, assumptions: &[TermId]) -> bool {
        let mut assumed: Vec<Lit> = self.scope_lits.clone();
        for &term in assumptions {
            let lit = self.compile(arena, term);
            assumed.push(lit);
        }
        self.solver.assume(&assumed);
        let sat = self.solver.solve().expect("SAT solver failed");
        if !sat {
            return false;
        }

        let model = self.solver.model().expect("satisfiable check must produce a model");
        let mut positive = Vec::new();
        for lit in &model {
            let index = lit.var().index();
            if index >= positive.len() {
                positive.resize(index + 1, false);
            }
            positive[index] = lit.is_positive();
        }
        for (hole, lits) in self.hole_lits.iter().enumerate() {
            for (option, lit) in lits.iter().enumerate() {
                if positive.get(lit.var().index()).copied().unwrap_or(false) {
                    self.model[hole] = option;
                    break;
                }
            }
        }
        true
    }

    fn value(&self, hole: usize) -> usize {
        self.model[hole]
    }
}

/// Backtracking backend: depth-first search over the hole domains with
/// three-valued early evaluation of the asserted terms.
struct EnumerationBackend {
    cardinalities: Vec<usize>,

    /// Asserted terms per scope frame; frame 0 is the root scope
    frames: Vec<Vec<TermId>>,

    model: Vec<usize>,
}

impl EnumerationBackend {
    fn new() -> Self {
        Self {
            cardinalities: Vec::new(),
            frames: vec![Vec::new()],
            model: Vec::new(),
        }
    }

    /// Evaluate under a partial assignment; `None` means undetermined.
    fn eval(arena: &TermArena, term: TermId, assignment: &[Option<usize>]) -> Option<bool> {
        match &arena.terms[term] {
            Term::Eq { hole, option } => assignment[*hole].map(|v| v == *option),
            Term::Not(operand) => Self::eval(arena, *operand, assignment).map(|b| !b),
            Term::And(operands) => {
                let mut all_true = true;
                for &operand in operands {
                    match Self::eval(arena, operand, assignment) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => all_true = false,
                    }
                }
                if all_true { Some(true) } else { None }
            }
            Term::Or(operands) => {
                let mut all_false = true;
                for &operand in operands {
                    match Self::eval(arena, operand, assignment) {
                        Some(true) => return Some(true),
                        Some(false) => {}
                        None => all_false = false,
                    }
                }
                if all_false { Some(false) } else { None }
            }
        }
    }

    fn search(
        &mut self,
        arena: &TermArena,
        terms: &[TermId],
        assignment: &mut Vec<Option<usize>>,
        hole: usize,
    ) -> bool {
        if terms
            .iter()
            .any(|&t| Self::eval(arena, t, assignment) == Some(false))
        {
            return false;
        }
        if hole == self.cardinalities.len() {
            self.model = assignment.iter().map(|v| v.unwrap()).collect();
            return true;
        }
        for option in 0..self.cardinalities[hole] {
            assignment[hole] = Some(option);
            if self.search(arena, terms, assignment, hole + 1) {
                return true;
            }
        }
        assignment[hole] = None;
        false
    }
}

impl SolverBackend for EnumerationBackend {
    fn declare_hole(&mut self, cardinality: usize) {
        self.cardinalities.push(cardinality);
        self.model.push(0);
    }

    fn assert_term(&mut self, _arena: &TermArena, term: TermId) {
        self.frames.last_mut().expect("root frame always present").push(term);
    }

    fn assert_root(&mut self, _arena: &TermArena, term: TermId) {
        self.frames[0].push(term);
    }

    fn push(&mut self) {
        self.frames.push(Vec::new());
    }

    fn pop(&mut self) {
        assert!(self.frames.len() > 1, "scope stack underflow");
        self.frames.pop();
    }

    fn check(&mut self, arena: &TermArena, assumptions: &[TermId]) -> bool {
        let mut terms: Vec<TermId> = self.frames.iter().flatten().copied().collect();
        terms.extend_from_slice(assumptions);
        let mut assignment = vec![None; self.cardinalities.len()];
        self.search(arena, &terms, &mut assignment, 0)
    }

    fn value(&self, hole: usize) -> usize {
        self.model[hole]
    }
}

/// The conflict cache owned by the refinement loop.
pub struct ConflictCache {
    arena: TermArena,
    backend: Box<dyn SolverBackend>,

    /// Precomputed equality literals, per hole and option
    hole_eq_terms: Vec<Vec<TermId>>,

    /// Current scope depth; mirrors the refinement depth of the family
    /// being processed
    depth: usize,
}

impl ConflictCache {
    /// Set up the cache for the root family on the default backend.
    pub fn new(family: &Family) -> Self {
        Self::with_backend(family, BackendKind::default())
    }

    pub fn with_backend(family: &Family, kind: BackendKind) -> Self {
        let mut backend: Box<dyn SolverBackend> = match kind {
            BackendKind::Sat => Box::new(SatBackend::new()),
            BackendKind::Enumeration => Box::new(EnumerationBackend::new()),
        };
        let mut arena = TermArena::default();
        let mut hole_eq_terms = Vec::with_capacity(family.num_holes());
        for hole in family.holes() {
            let cardinality = hole.option_labels.len();
            backend.declare_hole(cardinality);
            let eq_terms = (0..cardinality)
                .map(|option| arena.eq(hole_eq_terms.len(), option))
                .collect();
            hole_eq_terms.push(eq_terms);
        }
        tracing::debug!(backend = ?kind, holes = family.num_holes(), "conflict cache initialized");
        Self { arena, backend, hole_eq_terms, depth: 0 }
    }

    pub fn scope_depth(&self) -> usize {
        self.depth
    }

    /// Disjunction of the equality literals at a hole's current options.
    fn hole_clause(&mut self, family: &Family, hole_index: usize) -> TermId {
        let clauses: Vec<TermId> = family
            .hole(hole_index)
            .options
            .iter()
            .map(|&option| self.hole_eq_terms[hole_index][option])
            .collect();
        if clauses.len() == 1 {
            clauses[0]
        } else {
            self.arena.or(clauses)
        }
    }

    /// Conjunction of the per-hole clauses: the family's encoding.
    pub fn encode_family(&mut self, family: &Family) -> TermId {
        let clauses: Vec<TermId> = family
            .hole_indices()
            .map(|hole_index| self.hole_clause(family, hole_index))
            .collect();
        if clauses.len() == 1 {
            clauses[0]
        } else {
            self.arena.and(clauses)
        }
    }

    /// Align the scope stack with a family's refinement depth: pop back to
    /// the parent's scope, then open one fresh scope. A root family leaves
    /// the stack untouched.
    pub fn set_scope_depth(&mut self, refinement_depth: usize) {
        if refinement_depth == 0 {
            return;
        }
        while self.depth >= refinement_depth {
            self.backend.pop();
            self.depth -= 1;
        }
        self.backend.push();
        self.depth += 1;
    }

    /// Whether any assignment of the family survives the learned conflicts.
    pub fn is_satisfiable(&mut self, family: &Family) -> bool {
        let encoding = self.encode_family(family);
        self.backend.check(&self.arena, &[encoding])
    }

    /// Pick a surviving assignment of the family, or `None` if the family
    /// is exhausted by prior conflicts.
    pub fn pick_assignment(&mut self, family: &Family) -> Option<Family> {
        let encoding = self.encode_family(family);
        if !self.backend.check(&self.arena, &[encoding]) {
            return None;
        }
        let combination: Vec<usize> = family
            .hole_indices()
            .map(|hole| self.backend.value(hole))
            .collect();
        Some(family.construct_assignment(&combination))
    }

    /// Learn a conflict: exclude every assignment that agrees with the
    /// refuted singleton on the conflict holes and lies within `family` on
    /// the refined non-conflict holes. Returns the estimated number of
    /// assignments pruned.
    pub fn exclude_assignment(
        &mut self,
        family: &Family,
        assignment: &Family,
        conflict: &[usize],
    ) -> u128 {
        let mut pruning_estimate: u128 = 1;
        let mut clauses: Vec<TermId> = Vec::new();
        for hole_index in family.hole_indices() {
            if conflict.contains(&hole_index) {
                let option = assignment.hole(hole_index).options[0];
                clauses.push(self.hole_eq_terms[hole_index][option]);
            } else {
                if !family.hole(hole_index).is_unrefined() {
                    let clause = self.hole_clause(family, hole_index);
                    clauses.push(clause);
                }
                pruning_estimate *= family.hole(hole_index).size() as u128;
            }
        }
        assert!(!clauses.is_empty(), "conflict must constrain at least one hole");

        let conjunction = if clauses.len() == 1 { clauses[0] } else { self.arena.and(clauses) };
        let exclusion = self.arena.not(conjunction);
        self.backend.assert_term(&self.arena, exclusion);
        pruning_estimate
    }

    /// Exclude a family whose infeasibility has been verified outright.
    /// The refutation does not depend on the search position, so the
    /// clause is asserted at the root scope and survives backtracking.
    pub fn exclude_family(&mut self, family: &Family) {
        let encoding = self.encode_family(family);
        let exclusion = self.arena.not(encoding);
        self.backend.assert_root(&self.arena, exclusion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Hole;

    fn family_3x2() -> Family {
        Family::new(vec![
            Hole::new("x", vec!["a".into(), "b".into(), "c".into()]),
            Hole::new("y", vec!["0".into(), "1".into()]),
        ])
    }

    fn both_backends(family: &Family) -> Vec<ConflictCache> {
        vec![
            ConflictCache::with_backend(family, BackendKind::Sat),
            ConflictCache::with_backend(family, BackendKind::Enumeration),
        ]
    }

    #[test]
    fn test_pick_assignment_within_family() {
        let mut family = family_3x2();
        family.assume_hole_options(0, vec![2]);
        for mut cache in both_backends(&family) {
            let assignment = cache.pick_assignment(&family).unwrap();
            assert!(assignment.is_singleton());
            assert_eq!(assignment.singleton_options()[0], 2);
        }
    }

    #[test]
    fn test_exclusion_exhausts_family() {
        let family = family_3x2();
        for mut cache in both_backends(&family) {
            let mut seen = Vec::new();
            loop {
                let Some(assignment) = cache.pick_assignment(&family) else { break };
                let options = assignment.singleton_options();
                assert!(!seen.contains(&options), "assignment picked twice: {options:?}");
                seen.push(options.clone());
                let all_holes: Vec<usize> = family.hole_indices().collect();
                let pruned = cache.exclude_assignment(&family, &assignment, &all_holes);
                assert_eq!(pruned, 1);
            }
            assert_eq!(seen.len(), 6);
            assert!(!cache.is_satisfiable(&family));
        }
    }

    #[test]
    fn test_generalized_conflict_prunes_agreeing_assignments() {
        let family = family_3x2();
        for mut cache in both_backends(&family) {
            let assignment = family.construct_assignment(&[1, 0]);
            // hole 1 does not matter: everything with x=b is refuted
            let pruned = cache.exclude_assignment(&family, &assignment, &[0]);
            assert_eq!(pruned, 2);

            let mut refuted = family.clone();
            refuted.assume_hole_options(0, vec![1]);
            assert!(!cache.is_satisfiable(&refuted));

            let mut surviving = family.clone();
            surviving.assume_hole_options(0, vec![0, 2]);
            assert!(cache.is_satisfiable(&surviving));
        }
    }

    #[test]
    fn test_scope_discipline() {
        let family = family_3x2();
        for mut cache in both_backends(&family) {
            // root family: no push
            cache.set_scope_depth(0);
            assert_eq!(cache.scope_depth(), 0);

            // descend two levels, learn a conflict at depth 2
            cache.set_scope_depth(1);
            cache.set_scope_depth(2);
            assert_eq!(cache.scope_depth(), 2);
            let assignment = family.construct_assignment(&[0, 0]);
            let all_holes: Vec<usize> = family.hole_indices().collect();
            cache.exclude_assignment(&family, &assignment, &all_holes);
            assert!(!cache.is_satisfiable(&assignment));

            // a sibling at depth 2 rewinds the scope; the conflict is gone
            cache.set_scope_depth(2);
            assert_eq!(cache.scope_depth(), 2);
            assert!(cache.is_satisfiable(&assignment));
        }
    }

    #[test]
    fn test_conflicts_survive_to_descendants() {
        let family = family_3x2();
        for mut cache in both_backends(&family) {
            cache.set_scope_depth(1);
            let assignment = family.construct_assignment(&[0, 1]);
            let all_holes: Vec<usize> = family.hole_indices().collect();
            cache.exclude_assignment(&family, &assignment, &all_holes);

            // deeper scopes still see the clause learned at depth 1
            cache.set_scope_depth(2);
            assert!(!cache.is_satisfiable(&assignment));
        }
    }

    #[test]
    fn test_family_exclusion_survives_backtracking() {
        let family = family_3x2();
        for mut cache in both_backends(&family) {
            cache.set_scope_depth(1);
            cache.set_scope_depth(2);

            let mut refuted = family.clone();
            refuted.assume_hole_options(0, vec![0, 1]);
            cache.exclude_family(&refuted);
            assert!(!cache.is_satisfiable(&refuted));

            // rewinding the scope does not resurrect a verified refutation
            cache.set_scope_depth(1);
            assert!(!cache.is_satisfiable(&refuted));
            assert!(cache.is_satisfiable(&family));

            let surviving = cache.pick_assignment(&family).unwrap();
            assert_eq!(surviving.singleton_options()[0], 2);
        }
    }

    #[test]
    fn test_backends_agree_on_random_workload() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(7);

        let family = Family::new(vec![
            Hole::new("x", vec!["0".into(), "1".into(), "2".into(), "3".into()]),
            Hole::new("y", vec!["0".into(), "1".into(), "2".into()]),
            Hole::new("z", vec!["0".into(), "1".into()]),
        ]);
        let mut sat = ConflictCache::with_backend(&family, BackendKind::Sat);
        let mut enumeration = ConflictCache::with_backend(&family, BackendKind::Enumeration);

        for _ in 0..40 {
            let combination: Vec<usize> = family
                .holes()
                .map(|h| *h.options.choose(&mut rng).unwrap())
                .collect();
            let assignment = family.construct_assignment(&combination);
            let conflict: Vec<usize> = family
                .hole_indices()
                .filter(|_| rng.gen_bool(0.7))
                .collect();
            if conflict.is_empty() {
                continue;
            }
            let pruned_sat = sat.exclude_assignment(&family, &assignment, &conflict);
            let pruned_enum = enumeration.exclude_assignment(&family, &assignment, &conflict);
            assert_eq!(pruned_sat, pruned_enum);

            assert_eq!(sat.is_satisfiable(&family), enumeration.is_satisfiable(&family));
            match (sat.pick_assignment(&family), enumeration.pick_assignment(&family)) {
                (Some(_), Some(_)) | (None, None) => {}
                other => panic!("backends disagree: {other:?}"),
            }
        }
    }
}
