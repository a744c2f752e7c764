//! Predicate precedence graph
//!
//! The graph has one vertex per predicate and an edge `src -> dst` for every
//! rule `dst(..) :- .. src(..) ..`. Edges through negated atoms are marked
//! negative. Vertices are dense integer ids with adjacency lists, so cyclic
//! dependencies never produce pointer cycles.

use datalog_ast::{BodyPredicate, Constraint, Polarity, PredSym};
use std::collections::HashMap;

/// Polarity of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Positive,
    Negative,
}

/// Dependency graph over predicates, keyed on dense vertex ids.
#[derive(Debug, Clone, Default)]
pub struct PrecedenceGraph {
    preds: Vec<PredSym>,
    ids: HashMap<PredSym, usize>,
    /// Outgoing adjacency: `edges[src]` lists `(dst, kind)`.
    edges: Vec<Vec<(usize, EdgeKind)>>,
}

impl PrecedenceGraph {
    pub fn new() -> Self {
        PrecedenceGraph::default()
    }

    /// Build the graph from the rules of a program.
    pub fn from_rules(rules: &[Constraint]) -> Self {
        let mut graph = PrecedenceGraph::new();
        for rule in rules {
            let dst = graph.vertex(rule.head.rel.pred);
            for pred in &rule.body {
                if let BodyPredicate::Atom { rel, polarity, .. } = pred {
                    let src = graph.vertex(rel.pred);
                    let kind = match polarity {
                        Polarity::Positive => EdgeKind::Positive,
                        Polarity::Negative => EdgeKind::Negative,
                    };
                    graph.add_edge(src, dst, kind);
                }
            }
        }
        graph
    }

    /// Id of a predicate, allocating a vertex on first sight.
    pub fn vertex(&mut self, pred: PredSym) -> usize {
        if let Some(&id) = self.ids.get(&pred) {
            return id;
        }
        let id = self.preds.len();
        self.preds.push(pred);
        self.ids.insert(pred, id);
        self.edges.push(Vec::new());
        id
    }

    pub fn add_edge(&mut self, src: usize, dst: usize, kind: EdgeKind) {
        if !self.edges[src].contains(&(dst, kind)) {
            self.edges[src].push((dst, kind));
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.preds.len()
    }

    pub fn pred_of(&self, v: usize) -> PredSym {
        self.preds[v]
    }

    pub fn successors(&self, v: usize) -> &[(usize, EdgeKind)] {
        &self.edges[v]
    }

    /// Strongly connected components via Tarjan's algorithm, iterative so
    /// deep rule chains cannot overflow the call stack.
    ///
    /// Returns `comp[v]` for every vertex; component ids are assigned in
    /// reverse topological order of the condensation.
    pub fn tarjan_sccs(&self) -> Vec<usize> {
        const UNVISITED: usize = usize::MAX;

        let n = self.vertex_count();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut comp = vec![UNVISITED; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0usize;
        let mut comp_count = 0usize;

        // Work frames: (vertex, next successor position).
        let mut work: Vec<(usize, usize)> = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            work.push((root, 0));
            while let Some(&(v, succ_pos)) = work.last() {
                if succ_pos == 0 {
                    index[v] = next_index;
                    lowlink[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                let mut recurse = None;
                let mut pos = succ_pos;
                while pos < self.edges[v].len() {
                    let (w, _) = self.edges[v][pos];
                    pos += 1;
                    if index[w] == UNVISITED {
                        recurse = Some(w);
                        break;
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                }
                work.last_mut()
                    .expect("bug: empty Tarjan stack while advancing a frame")
                    .1 = pos;
                if let Some(w) = recurse {
                    work.push((w, 0));
                    continue;
                }
                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    loop {
                        let w = stack
                            .pop()
                            .expect("bug: empty Tarjan stack while closing a component");
                        on_stack[w] = false;
                        comp[w] = comp_count;
                        if w == v {
                            break;
                        }
                    }
                    comp_count += 1;
                }
            }
        }
        comp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{BodyTerm, Denotation, HeadAtom, HeadTerm, RelSym};

    fn rel(name: &str, id: u64) -> RelSym {
        RelSym::new(PredSym::new(name, id), 1, Denotation::Relational)
    }

    fn rule(head: &RelSym, body: Vec<BodyPredicate>) -> Constraint {
        Constraint::rule(HeadAtom::new(head.clone(), vec![HeadTerm::var("x")]), body)
    }

    #[test]
    fn test_edges_point_from_body_to_head() {
        let p = rel("P", 0);
        let q = rel("Q", 1);
        let rules = vec![rule(
            &p,
            vec![BodyPredicate::atom(q.clone(), vec![BodyTerm::var("x")])],
        )];
        let mut g = PrecedenceGraph::from_rules(&rules);
        let qv = g.vertex(q.pred);
        let pv = g.vertex(p.pred);
        assert_eq!(g.successors(qv), &[(pv, EdgeKind::Positive)]);
    }

    #[test]
    fn test_mutual_recursion_is_one_component() {
        let p = rel("P", 0);
        let q = rel("Q", 1);
        let rules = vec![
            rule(&p, vec![BodyPredicate::atom(q.clone(), vec![BodyTerm::var("x")])]),
            rule(&q, vec![BodyPredicate::atom(p.clone(), vec![BodyTerm::var("x")])]),
        ];
        let g = PrecedenceGraph::from_rules(&rules);
        let comp = g.tarjan_sccs();
        assert_eq!(comp[0], comp[1]);
    }

    #[test]
    fn test_chain_is_separate_components() {
        let p = rel("P", 0);
        let q = rel("Q", 1);
        let r = rel("R", 2);
        let rules = vec![
            rule(&q, vec![BodyPredicate::atom(p.clone(), vec![BodyTerm::var("x")])]),
            rule(&r, vec![BodyPredicate::atom(q.clone(), vec![BodyTerm::var("x")])]),
        ];
        let g = PrecedenceGraph::from_rules(&rules);
        let comp = g.tarjan_sccs();
        let distinct: std::collections::HashSet<_> = comp.iter().collect();
        assert_eq!(distinct.len(), 3);
    }
}
