//! Stratification
//!
//! Computes the evaluation order for a program with (stratified) negation.
//! Strata are the strongly connected components of the precedence graph,
//! ordered by a topological sort of the condensation. Consecutive strata
//! with no edges between them are merged into one pseudo-stratum and can be
//! evaluated in parallel.
//!
//! A negative edge inside a component means the program is not stratifiable
//! and is reported as an error. A cycle in the condensation itself cannot
//! happen on a well-formed graph and aborts.

use crate::precedence::{EdgeKind, PrecedenceGraph};
use datalog_ast::{Constraint, PredSym};
use std::collections::{HashMap, HashSet};

/// Result of stratification.
#[derive(Debug, Clone, Default)]
pub struct Stratification {
    /// Pseudo-strata in evaluation order. Each pseudo-stratum is a list of
    /// mutually independent strata; each stratum lists its predicates.
    pub pseudo_strata: Vec<Vec<Vec<PredSym>>>,
    /// Predicate to `(pseudo-stratum index, stratum index within it)`.
    pub placement: HashMap<PredSym, (usize, usize)>,
}

impl Stratification {
    /// Placement of a predicate; facts-only predicates have none and are
    /// seeded before the first stratum runs.
    pub fn placement_of(&self, pred: &PredSym) -> Option<(usize, usize)> {
        self.placement.get(pred).copied()
    }

    /// Total number of strata across all pseudo-strata.
    pub fn stratum_count(&self) -> usize {
        self.pseudo_strata.iter().map(|p| p.len()).sum()
    }
}

/// Error during stratification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratificationError {
    /// The program has a cycle through negation.
    NegativeCycle(Vec<PredSym>),
}

impl std::fmt::Display for StratificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StratificationError::NegativeCycle(preds) => {
                let names: Vec<String> = preds.iter().map(|p| p.name.to_string()).collect();
                write!(
                    f,
                    "Cycle through negation detected among: {}",
                    names.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for StratificationError {}

/// Stratify the rules of a program.
pub fn stratify(rules: &[Constraint]) -> Result<Stratification, StratificationError> {
    if rules.is_empty() {
        return Ok(Stratification::default());
    }

    let graph = PrecedenceGraph::from_rules(rules);
    let n = graph.vertex_count();
    let comp = graph.tarjan_sccs();
    let comp_count = comp.iter().copied().max().map_or(0, |c| c + 1);

    // A negative edge staying inside one component is a negative cycle.
    for v in 0..n {
        for &(w, kind) in graph.successors(v) {
            if kind == EdgeKind::Negative && comp[v] == comp[w] {
                let members: Vec<PredSym> = (0..n)
                    .filter(|&u| comp[u] == comp[v])
                    .map(|u| graph.pred_of(u))
                    .collect();
                return Err(StratificationError::NegativeCycle(members));
            }
        }
    }

    // Condensation edges between distinct components.
    let mut cond_edges: HashSet<(usize, usize)> = HashSet::new();
    for v in 0..n {
        for &(w, _) in graph.successors(v) {
            if comp[v] != comp[w] {
                cond_edges.insert((comp[v], comp[w]));
            }
        }
    }

    // Kahn topological sort of the condensation. The queue is first-in
    // first-out, so mutually independent components stay adjacent in the
    // order and the pseudo-stratum merge below can group them.
    let mut indegree = vec![0usize; comp_count];
    for &(_, dst) in &cond_edges {
        indegree[dst] += 1;
    }
    let mut ready: std::collections::VecDeque<usize> =
        (0..comp_count).filter(|&c| indegree[c] == 0).collect();
    let mut order: Vec<usize> = Vec::with_capacity(comp_count);
    while let Some(c) = ready.pop_front() {
        order.push(c);
        for &(src, dst) in &cond_edges {
            if src == c {
                indegree[dst] -= 1;
                if indegree[dst] == 0 {
                    ready.push_back(dst);
                }
            }
        }
    }
    assert_eq!(
        order.len(),
        comp_count,
        "bug: cycle in the condensation of the precedence graph"
    );

    // Greedily merge consecutive independent strata into pseudo-strata.
    let mut pseudo_strata: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    for &c in &order {
        let depends_on_current = current
            .iter()
            .any(|&g| cond_edges.contains(&(g, c)) || cond_edges.contains(&(c, g)));
        if depends_on_current && !current.is_empty() {
            pseudo_strata.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        pseudo_strata.push(current);
    }

    // Materialize predicate lists and placements.
    let mut members: Vec<Vec<PredSym>> = vec![Vec::new(); comp_count];
    for v in 0..n {
        members[comp[v]].push(graph.pred_of(v));
    }
    let mut placement = HashMap::new();
    let mut out = Vec::with_capacity(pseudo_strata.len());
    for (pi, comps) in pseudo_strata.iter().enumerate() {
        let mut strata = Vec::with_capacity(comps.len());
        for (si, &c) in comps.iter().enumerate() {
            for pred in &members[c] {
                placement.insert(*pred, (pi, si));
            }
            strata.push(members[c].clone());
        }
        out.push(strata);
    }

    Ok(Stratification {
        pseudo_strata: out,
        placement,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{
        BodyPredicate, BodyTerm, Denotation, HeadAtom, HeadTerm, RelSym,
    };

    fn rel(name: &str, id: u64) -> RelSym {
        RelSym::new(PredSym::new(name, id), 1, Denotation::Relational)
    }

    fn rule(head: &RelSym, body: Vec<BodyPredicate>) -> Constraint {
        Constraint::rule(HeadAtom::new(head.clone(), vec![HeadTerm::var("x")]), body)
    }

    fn pos(r: &RelSym) -> BodyPredicate {
        BodyPredicate::atom(r.clone(), vec![BodyTerm::var("x")])
    }

    fn neg(r: &RelSym) -> BodyPredicate {
        BodyPredicate::not_atom(r.clone(), vec![BodyTerm::var("x")])
    }

    #[test]
    fn test_positive_recursion_is_one_stratum() {
        let p = rel("P", 0);
        let q = rel("Q", 1);
        let rules = vec![rule(&p, vec![pos(&q)]), rule(&q, vec![pos(&p)])];
        let s = stratify(&rules).unwrap();
        assert_eq!(s.stratum_count(), 1);
        assert_eq!(s.placement_of(&p.pred), s.placement_of(&q.pred));
    }

    #[test]
    fn test_negation_orders_strata() {
        let person = rel("Person", 0);
        let has_parent = rel("HasParent", 1);
        let orphan = rel("Orphan", 2);
        let rules = vec![
            rule(&has_parent, vec![pos(&person)]),
            rule(&orphan, vec![pos(&person), neg(&has_parent)]),
        ];
        let s = stratify(&rules).unwrap();
        let hp = s.placement_of(&has_parent.pred).unwrap();
        let or = s.placement_of(&orphan.pred).unwrap();
        assert!(hp < or, "negated predicate must be fully evaluated first");
    }

    #[test]
    fn test_negative_cycle_is_an_error() {
        let p = rel("P", 0);
        let q = rel("Q", 1);
        let rules = vec![rule(&p, vec![neg(&q)]), rule(&q, vec![neg(&p)])];
        match stratify(&rules) {
            Err(StratificationError::NegativeCycle(members)) => {
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected a negative cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_negation_is_an_error() {
        let p = rel("P", 0);
        let rules = vec![rule(&p, vec![neg(&p)])];
        assert!(stratify(&rules).is_err());
    }

    #[test]
    fn test_independent_components_share_a_pseudo_stratum() {
        let a = rel("A", 0);
        let b = rel("B", 1);
        let src1 = rel("Src1", 2);
        let src2 = rel("Src2", 3);
        let rules = vec![rule(&a, vec![pos(&src1)]), rule(&b, vec![pos(&src2)])];
        let s = stratify(&rules).unwrap();
        let (pa, _) = s.placement_of(&a.pred).unwrap();
        let (pb, _) = s.placement_of(&b.pred).unwrap();
        assert_eq!(pa, pb, "independent derivations run in one pseudo-stratum");
    }

    #[test]
    fn test_dependent_strata_are_not_merged() {
        let base = rel("Base", 0);
        let mid = rel("Mid", 1);
        let top = rel("Top", 2);
        let rules = vec![
            rule(&mid, vec![pos(&base), neg(&top)]),
        ];
        // top is negated but never derived; mid depends on it.
        let s = stratify(&rules).unwrap();
        let t = s.placement_of(&top.pred).unwrap();
        let m = s.placement_of(&mid.pred).unwrap();
        assert!(t < m);
    }
}
