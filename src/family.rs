//! Holes, design spaces and refinement bookkeeping
//!
//! A hole is a named parameter with a finite catalog of option labels; a
//! family (design space) is an ordered list of holes, each restricted to a
//! subset of its catalog. Families are split along one hole at a time during
//! refinement; children share unmodified holes with their parent.

use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use itertools::Itertools;
use xxhash_rust::xxh3::Xxh3;

use crate::model::SubMdp;

/// A partial hole-option combination: `None` stands for "any option".
pub type Combination = Vec<Option<usize>>;

/// Per-property analysis hints: primary and secondary value vectors indexed
/// by quotient state.
pub type HintPair = (Option<Vec<f64>>, Option<Vec<f64>>);

/// A named program parameter with a finite catalog of option labels.
///
/// Options are indices into the catalog, so their order inside the current
/// option set does not affect semantics; it is still kept stable for
/// reproducible splits. The catalog itself is immutable and shared between
/// copies of the hole, so that a label can always be recovered from an
/// option index after refinement.
#[derive(Debug, Clone)]
pub struct Hole {
    /// Hole name, as declared in the sketch
    pub name: String,

    /// Currently admitted options (catalog indices)
    pub options: Vec<usize>,

    /// Immutable catalog of option labels, shared across copies
    pub option_labels: Arc<Vec<String>>,
}

impl Hole {
    /// Create a hole admitting its full catalog.
    ///
    /// Panics if the catalog is empty; a hole with no options denotes an
    /// empty design space and is rejected up front.
    pub fn new(name: impl Into<String>, option_labels: Vec<String>) -> Self {
        assert!(!option_labels.is_empty(), "hole catalog must not be empty");
        let options = (0..option_labels.len()).collect();
        Self {
            name: name.into(),
            options,
            option_labels: Arc::new(option_labels),
        }
    }

    /// Number of currently admitted options
    pub fn size(&self) -> usize {
        self.options.len()
    }

    /// A hole with exactly one admitted option
    pub fn is_trivial(&self) -> bool {
        self.size() == 1
    }

    /// A hole still admitting its full catalog
    pub fn is_unrefined(&self) -> bool {
        self.size() == self.option_labels.len()
    }

    /// Restrict this hole to the given options.
    ///
    /// Panics if the new option set is empty or mentions an option outside
    /// the catalog; both are programming errors in the caller.
    pub fn assume_options(&mut self, options: Vec<usize>) {
        assert!(!options.is_empty(), "hole `{}`: assumed option set is empty", self.name);
        for &option in &options {
            assert!(
                option < self.option_labels.len(),
                "hole `{}`: option {} outside catalog of size {}",
                self.name,
                option,
                self.option_labels.len()
            );
        }
        self.options = options;
    }
}

impl fmt::Display for Hole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_trivial() {
            write!(f, "{}={}", self.name, self.option_labels[self.options[0]])
        } else {
            let labels = self.options.iter().map(|&o| self.option_labels[o].as_str());
            write!(f, "{}: {{{}}}", self.name, labels.format(","))
        }
    }
}

/// Snapshot of a family taken at the moment it is split, attached to each
/// child. Children use it to incrementalize action selection and to warm up
/// verification, without keeping the parent family itself alive.
#[derive(Debug)]
pub struct ParentInfo {
    /// Non-default quotient actions admitted by the parent
    pub selected_actions: Vec<usize>,

    /// For each hole, the parent's admitted actions labeled by that hole
    pub hole_selected_actions: Vec<Vec<usize>>,

    /// Parent refinement depth
    pub refinement_depth: usize,

    /// Constraint indices still undecided in the parent
    pub property_indices: Vec<usize>,

    /// Per-constraint value vectors in quotient state space, used to
    /// warm-start the children's verifier calls
    pub analysis_hints: HashMap<usize, HintPair>,

    /// Index of the hole along which the parent was split
    pub splitter: usize,
}

/// An ordered list of holes, each restricted to a subset of its catalog.
///
/// Hole positions identify holes for the lifetime of the search and are
/// never reordered. The family represents the set of concrete assignments
/// given by the Cartesian product of the per-hole option sets.
///
/// Holes are stored behind `Arc` so that splitting a family along one hole
/// shares every other hole with the parent; restriction copies on write.
#[derive(Debug)]
pub struct Family {
    holes: Vec<Arc<Hole>>,

    /// Distance from the root family in the refinement tree
    pub refinement_depth: usize,

    /// Constraint indices still undecided for this family
    pub property_indices: Vec<usize>,

    /// Snapshot of the parent at split time; `None` for the root
    pub parent_info: Option<Arc<ParentInfo>>,

    /// Hole chosen when this family itself was split
    pub splitter: Option<usize>,

    /// Non-default quotient actions admitted by this family, cached after
    /// the sub-MDP has been built
    pub selected_actions: Option<Vec<usize>>,

    /// Per-hole admitted actions, cached alongside `selected_actions`
    pub hole_selected_actions: Option<Vec<Vec<usize>>>,

    /// Realized sub-MDP, present only once built
    pub mdp: Option<SubMdp>,
}

impl Clone for Family {
    /// Clone the restriction data only. The parent snapshot, the realized
    /// sub-MDP and the cached action selection do not carry over: a copy
    /// may be restricted at any hole, so its actions must be reselected
    /// from scratch rather than through the parent's splitter-only filter.
    fn clone(&self) -> Self {
        Self {
            holes: self.holes.clone(),
            refinement_depth: self.refinement_depth,
            property_indices: self.property_indices.clone(),
            parent_info: None,
            splitter: None,
            selected_actions: None,
            hole_selected_actions: None,
            mdp: None,
        }
    }
}

impl Family {
    /// Create a root family from a list of holes.
    pub fn new(holes: Vec<Hole>) -> Self {
        Self {
            holes: holes.into_iter().map(Arc::new).collect(),
            refinement_depth: 0,
            property_indices: Vec::new(),
            parent_info: None,
            splitter: None,
            selected_actions: None,
            hole_selected_actions: None,
            mdp: None,
        }
    }

    /// Create a child family from shared holes and a parent snapshot.
    pub fn with_parent(holes: Vec<Arc<Hole>>, parent_info: Arc<ParentInfo>) -> Self {
        let refinement_depth = parent_info.refinement_depth + 1;
        let property_indices = parent_info.property_indices.clone();
        Self {
            holes,
            refinement_depth,
            property_indices,
            parent_info: Some(parent_info),
            splitter: None,
            selected_actions: None,
            hole_selected_actions: None,
            mdp: None,
        }
    }

    /// Number of holes
    pub fn num_holes(&self) -> usize {
        self.holes.len()
    }

    /// Iterator over hole positions
    pub fn hole_indices(&self) -> std::ops::Range<usize> {
        0..self.holes.len()
    }

    /// Access a hole by position
    pub fn hole(&self, index: usize) -> &Hole {
        &self.holes[index]
    }

    /// Iterate over the holes in position order
    pub fn holes(&self) -> impl Iterator<Item = &Hole> {
        self.holes.iter().map(|h| h.as_ref())
    }

    /// Family size: the number of concrete assignments it represents
    pub fn size(&self) -> u128 {
        self.holes.iter().map(|h| h.size() as u128).product()
    }

    /// A family of size one
    pub fn is_singleton(&self) -> bool {
        self.holes.iter().all(|h| h.is_trivial())
    }

    /// Restrict one hole to the given options, copying it on write if it is
    /// shared with another family.
    pub fn assume_hole_options(&mut self, hole_index: usize, options: Vec<usize>) {
        Arc::make_mut(&mut self.holes[hole_index]).assume_options(options);
    }

    /// Restrict every hole at once.
    pub fn assume_options(&mut self, options: Vec<Vec<usize>>) {
        assert_eq!(options.len(), self.holes.len(), "one option set per hole required");
        for (hole_index, hole_options) in options.into_iter().enumerate() {
            self.assume_hole_options(hole_index, hole_options);
        }
    }

    /// True iff every (hole, option) pair of the partial assignment is
    /// currently admitted.
    pub fn includes(&self, assignment: &[(usize, usize)]) -> bool {
        assignment
            .iter()
            .all(|&(hole, option)| self.holes[hole].options.contains(&option))
    }

    /// Produce the singleton family picking the first admitted option of
    /// every hole.
    pub fn pick_any(&self) -> Family {
        let suboptions = self.holes.iter().map(|h| vec![h.options[0]]).collect();
        let mut assignment = self.clone();
        assignment.assume_options(suboptions);
        assignment
    }

    /// Cartesian enumeration of all admitted option combinations.
    pub fn all_combinations(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        self.holes
            .iter()
            .map(|h| h.options.iter().copied())
            .multi_cartesian_product()
    }

    /// Turn one option combination into a singleton family.
    pub fn construct_assignment(&self, combination: &[usize]) -> Family {
        assert_eq!(combination.len(), self.holes.len(), "one option per hole required");
        let suboptions = combination.iter().map(|&o| vec![o]).collect();
        let mut assignment = self.clone();
        assignment.assume_options(suboptions);
        assignment
    }

    /// Semi-shallow copy: shares every hole except `hole_index`, which is
    /// replaced by a copy restricted to `options`.
    pub fn subholes(&self, hole_index: usize, options: Vec<usize>) -> Vec<Arc<Hole>> {
        let mut holes = self.holes.clone();
        let mut subhole = (*holes[hole_index]).clone();
        subhole.assume_options(options);
        holes[hole_index] = Arc::new(subhole);
        holes
    }

    /// Extract the concrete assignment of a singleton family as one option
    /// per hole.
    pub fn singleton_options(&self) -> Vec<usize> {
        assert!(self.is_singleton(), "assignment extraction requires a singleton family");
        self.holes.iter().map(|h| h.options[0]).collect()
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.holes.iter().map(|h| h.to_string()).format(", "))
    }
}

/// Bijection between (possibly partial) hole-option combinations and small
/// positive integers. Color 0 is reserved for hole-independent objects.
#[derive(Debug, Default)]
pub struct CombinationColoring {
    coloring: HashMap<Combination, usize, BuildHasherDefault<Xxh3>>,

    /// Combination of color `c` at index `c - 1`
    reverse_coloring: Vec<Combination>,
}

impl CombinationColoring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of colors issued so far (color 0 not counted)
    pub fn num_colors(&self) -> usize {
        self.reverse_coloring.len()
    }

    /// Look up the color of a combination, issuing a fresh one on first use.
    pub fn get_or_make_color(&mut self, combination: Combination) -> usize {
        if let Some(&color) = self.coloring.get(&combination) {
            return color;
        }
        let color = self.num_colors() + 1;
        self.coloring.insert(combination.clone(), color);
        self.reverse_coloring.push(combination);
        color
    }

    /// The combination associated with a nonzero color.
    pub fn combination(&self, color: usize) -> Option<&Combination> {
        if color == 0 {
            return None;
        }
        self.reverse_coloring.get(color - 1)
    }

    /// Collect the colors whose combinations are valid within the family.
    /// Color 0 is always included.
    pub fn subcolors(&self, family: &Family) -> FixedBitSet {
        let mut colors = FixedBitSet::with_capacity(self.num_colors() + 1);
        colors.insert(0);
        for (combination, &color) in &self.coloring {
            let contained = combination.iter().enumerate().all(|(hole_index, assignment)| {
                match assignment {
                    None => true,
                    Some(option) => family.hole(hole_index).options.contains(option),
                }
            });
            if contained {
                colors.insert(color);
            }
        }
        colors
    }

    /// Collect the colors whose combinations pin `hole_index` to one of the
    /// given options.
    pub fn subcolors_proper(&self, hole_index: usize, options: &[usize]) -> FixedBitSet {
        let mut colors = FixedBitSet::with_capacity(self.num_colors() + 1);
        for (combination, &color) in &self.coloring {
            if let Some(option) = combination[hole_index] {
                if options.contains(&option) {
                    colors.insert(color);
                }
            }
        }
        colors
    }

    /// Reconstruct per-hole option sets from a set of colors.
    pub fn hole_assignments(&self, num_holes: usize, colors: &FixedBitSet) -> Vec<Vec<usize>> {
        let mut assignments = vec![Vec::new(); num_holes];
        for color in colors.ones() {
            let Some(combination) = self.combination(color) else { continue };
            for (hole_index, assignment) in combination.iter().enumerate() {
                if let Some(option) = assignment {
                    if !assignments[hole_index].contains(option) {
                        assignments[hole_index].push(*option);
                    }
                }
            }
        }
        for options in &mut assignments {
            options.sort_unstable();
        }
        assignments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_hole_family() -> Family {
        Family::new(vec![
            Hole::new("x", vec!["a".into(), "b".into(), "c".into()]),
            Hole::new("y", vec!["0".into(), "1".into()]),
        ])
    }

    #[test]
    fn test_hole_triviality() {
        let mut hole = Hole::new("x", vec!["a".into(), "b".into()]);
        assert!(!hole.is_trivial());
        assert!(hole.is_unrefined());

        hole.assume_options(vec![1]);
        assert!(hole.is_trivial());
        assert!(!hole.is_unrefined());
        assert_eq!(hole.to_string(), "x=b");
    }

    #[test]
    #[should_panic(expected = "outside catalog")]
    fn test_assume_rejects_unknown_option() {
        let mut hole = Hole::new("x", vec!["a".into(), "b".into()]);
        hole.assume_options(vec![2]);
    }

    #[test]
    fn test_family_size_and_singleton() {
        let family = two_hole_family();
        assert_eq!(family.size(), 6);
        assert!(!family.is_singleton());

        let any = family.pick_any();
        assert_eq!(any.size(), 1);
        assert!(any.is_singleton());
        assert_eq!(any.singleton_options(), vec![0, 0]);
    }

    #[test]
    fn test_includes_partial_assignment() {
        let mut family = two_hole_family();
        assert!(family.includes(&[(0, 2), (1, 1)]));

        family.assume_hole_options(0, vec![0, 1]);
        assert!(!family.includes(&[(0, 2)]));
        assert!(family.includes(&[(1, 0)]));
    }

    #[test]
    fn test_subholes_share_unmodified_holes() {
        let family = two_hole_family();
        let holes = family.subholes(0, vec![1]);

        assert_eq!(holes[0].options, vec![1]);
        // catalog is shared even by the restricted copy
        assert!(Arc::ptr_eq(&holes[0].option_labels, &family.hole(0).option_labels));
        // the untouched hole is shared outright
        assert!(Arc::ptr_eq(&holes[1], &family.holes[1]));
    }

    #[test]
    fn test_subholes_full_options_is_identity() {
        let family = two_hole_family();
        let holes = family.subholes(0, family.hole(0).options.clone());
        for (ours, theirs) in family.holes.iter().zip(&holes) {
            assert_eq!(ours.options, theirs.options);
        }
    }

    #[test]
    fn test_copy_then_assume_own_options_is_noop() {
        let family = two_hole_family();
        let mut copy = family.clone();
        let options = family.holes().map(|h| h.options.clone()).collect();
        copy.assume_options(options);
        for index in family.hole_indices() {
            assert_eq!(copy.hole(index).options, family.hole(index).options);
        }
        assert_eq!(copy.size(), family.size());
    }

    #[test]
    fn test_all_combinations() {
        let mut family = two_hole_family();
        family.assume_hole_options(0, vec![0, 2]);
        let combinations: Vec<_> = family.all_combinations().collect();
        assert_eq!(combinations, vec![vec![0, 0], vec![0, 1], vec![2, 0], vec![2, 1]]);
    }

    #[test]
    fn test_coloring_round_trip() {
        let mut coloring = CombinationColoring::new();
        let combinations: Vec<Combination> = vec![
            vec![Some(0), None],
            vec![Some(1), Some(0)],
            vec![None, Some(1)],
        ];

        let colors: Vec<_> = combinations
            .iter()
            .map(|c| coloring.get_or_make_color(c.clone()))
            .collect();
        assert_eq!(colors, vec![1, 2, 3]);

        // repeated lookups return the same color
        assert_eq!(coloring.get_or_make_color(vec![Some(1), Some(0)]), 2);

        for (combination, color) in combinations.iter().zip(&colors) {
            assert_eq!(coloring.combination(*color), Some(combination));
        }
        assert!(coloring.combination(0).is_none());
    }

    #[test]
    fn test_subcolors_respect_restriction() {
        let mut coloring = CombinationColoring::new();
        let c_a = coloring.get_or_make_color(vec![Some(0), None]);
        let c_b = coloring.get_or_make_color(vec![Some(2), None]);
        let c_any = coloring.get_or_make_color(vec![None, Some(1)]);

        let mut family = two_hole_family();
        family.assume_hole_options(0, vec![0, 1]);

        let colors = coloring.subcolors(&family);
        assert!(colors.contains(0));
        assert!(colors.contains(c_a));
        assert!(!colors.contains(c_b));
        assert!(colors.contains(c_any));

        let proper = coloring.subcolors_proper(0, &[2]);
        assert!(proper.contains(c_b));
        assert!(!proper.contains(c_a));

        let assignments = coloring.hole_assignments(2, &colors);
        assert_eq!(assignments[0], vec![0]);
        assert_eq!(assignments[1], vec![1]);
    }
}
