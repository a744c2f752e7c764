//! Hoisting and query folding
//!
//! The code generator leaves every constraint in one innermost `If`. This
//! phase computes the equality closure over `(row var, column)` sites and
//! the literal constants tied to them, then
//!
//! - turns equality bindings that are ground before a scan starts into a
//!   `Query` prefix, so the scan becomes an index range lookup,
//! - attaches every remaining guard at the earliest scan where its
//!   variables are ground,
//! - lifts guards with no free row variable to a top-level `If` that also
//!   asserts non-emptiness of every scanned relation, short-circuiting the
//!   whole insert when any input is empty,
//! - prunes rules in which two different literals are forced equal.

use ram_ir::{BoolExp, RamStmt, RamTerm, RelOp};
use datalog_ast::{Boxed, NamedGen, RamSym, RowVar};
use std::collections::HashMap;

use crate::simplify::simplify_guards;

/// One scan of a flattened rule body.
pub(crate) enum ScanNode {
    Atom {
        rv: RowVar,
        rel: RamSym,
    },
    Func {
        rv: RowVar,
        gen: NamedGen,
        args: Vec<RamTerm>,
        out_arity: usize,
    },
}

impl ScanNode {
    pub(crate) fn rv(&self) -> RowVar {
        match self {
            ScanNode::Atom { rv, .. } | ScanNode::Func { rv, .. } => *rv,
        }
    }
}

/// A rule body flattened back into scans, guards and the projection.
pub(crate) struct StackForm {
    pub scans: Vec<ScanNode>,
    pub guards: Vec<BoolExp>,
    pub project: RelOp,
}

/// Flatten an op stack; `Query` prefixes revert to equality guards and
/// generated emptiness guards are dropped (they are re-derived on rebuild).
pub(crate) fn unhoist(op: RelOp) -> StackForm {
    let mut scans = Vec::new();
    let mut guards = Vec::new();
    let mut cur = op;
    loop {
        cur = match cur {
            RelOp::Search { rv, rel, body } => {
                scans.push(ScanNode::Atom { rv, rel });
                *body
            }
            RelOp::Query {
                rv,
                rel,
                prefix,
                body,
            } => {
                for (col, term) in prefix {
                    guards.push(BoolExp::Eq(RamTerm::RowLoad(rv, col), term));
                }
                scans.push(ScanNode::Atom { rv, rel });
                *body
            }
            RelOp::Functional {
                rv,
                gen,
                args,
                out_arity,
                body,
            } => {
                scans.push(ScanNode::Func {
                    rv,
                    gen,
                    args,
                    out_arity,
                });
                *body
            }
            RelOp::If { conds, body } => {
                guards.extend(
                    conds
                        .into_iter()
                        .filter(|c| !matches!(c, BoolExp::Not(inner) if matches!(**inner, BoolExp::IsEmpty(_)))),
                );
                *body
            }
            project @ RelOp::Project { .. } => {
                return StackForm {
                    scans,
                    guards,
                    project,
                }
            }
        }
    }
}

/// Row variables a term depends on.
pub(crate) fn term_rvs(term: &RamTerm, out: &mut Vec<RowVar>) {
    match term {
        RamTerm::Lit(_) => {}
        RamTerm::RowLoad(rv, _) => out.push(*rv),
        RamTerm::Meet(rvs) | RamTerm::ProvMax(rvs) => out.extend(rvs.iter().copied()),
        RamTerm::App(_, args) => {
            for a in args {
                term_rvs(a, out);
            }
        }
    }
}

/// Row variables a guard depends on.
pub(crate) fn guard_rvs(cond: &BoolExp, out: &mut Vec<RowVar>) {
    match cond {
        BoolExp::Not(inner) => guard_rvs(inner, out),
        BoolExp::IsEmpty(_) => {}
        BoolExp::NotMemberOf(terms, _) => {
            for t in terms {
                term_rvs(t, out);
            }
        }
        BoolExp::Eq(a, b) => {
            term_rvs(a, out);
            term_rvs(b, out);
        }
        BoolExp::Leq { lower, value, .. } => {
            term_rvs(lower, out);
            term_rvs(value, out);
        }
        BoolExp::NotBot { value, .. } => term_rvs(value, out),
        BoolExp::Guard(_, args) => {
            for a in args {
                term_rvs(a, out);
            }
        }
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Hoist one flattened rule. Returns `None` when the rule cannot fire.
pub(crate) fn rebuild(stack: StackForm) -> Option<RelOp> {
    let StackForm {
        scans,
        guards,
        project,
    } = stack;

    let scan_of: HashMap<RowVar, usize> = scans
        .iter()
        .enumerate()
        .map(|(i, s)| (s.rv(), i))
        .collect();

    // --- Equality closure over (rv, col) sites. ---
    let mut site_ids: HashMap<(RowVar, usize), usize> = HashMap::new();
    let mut uf = UnionFind { parent: Vec::new() };
    let mut residual: Vec<BoolExp> = Vec::new();
    let mut eq_pairs: Vec<(usize, usize)> = Vec::new();
    let mut lit_of_site: Vec<(usize, Boxed)> = Vec::new();

    let mut site = |site_ids: &mut HashMap<(RowVar, usize), usize>,
                    uf: &mut UnionFind,
                    key: (RowVar, usize)|
     -> usize {
        *site_ids.entry(key).or_insert_with(|| {
            let id = uf.parent.len();
            uf.parent.push(id);
            id
        })
    };

    for guard in guards {
        match guard {
            BoolExp::Eq(RamTerm::RowLoad(rv1, c1), RamTerm::RowLoad(rv2, c2)) => {
                let a = site(&mut site_ids, &mut uf, (rv1, c1));
                let b = site(&mut site_ids, &mut uf, (rv2, c2));
                eq_pairs.push((a, b));
            }
            BoolExp::Eq(RamTerm::RowLoad(rv, c), RamTerm::Lit(v))
            | BoolExp::Eq(RamTerm::Lit(v), RamTerm::RowLoad(rv, c)) => {
                let a = site(&mut site_ids, &mut uf, (rv, c));
                lit_of_site.push((a, v));
            }
            BoolExp::Eq(RamTerm::Lit(a), RamTerm::Lit(b)) => {
                if a != b {
                    // Two different literals can never be equal.
                    return None;
                }
            }
            other => residual.push(other),
        }
    }
    for (a, b) in eq_pairs {
        uf.union(a, b);
    }

    // Literal constant per class; two distinct constants prune the rule.
    let mut class_lit: HashMap<usize, Boxed> = HashMap::new();
    for (s, v) in lit_of_site {
        let root = uf.find(s);
        match class_lit.get(&root) {
            None => {
                class_lit.insert(root, v);
            }
            Some(existing) if *existing == v => {}
            Some(_) => return None,
        }
    }

    // Earliest member of each class in binding order.
    let mut class_anchor: HashMap<usize, (RowVar, usize)> = HashMap::new();
    let mut ordered_sites: Vec<((RowVar, usize), usize)> =
        site_ids.iter().map(|(&k, &v)| (k, v)).collect();
    ordered_sites.sort_by_key(|((rv, col), _)| (scan_of[rv], *col));
    for ((rv, col), id) in &ordered_sites {
        let root = uf.find(*id);
        class_anchor.entry(root).or_insert((*rv, *col));
    }

    // --- Prefixes and regenerated equality guards. ---
    let mut prefixes: Vec<Vec<(usize, RamTerm)>> = scans.iter().map(|_| Vec::new()).collect();
    let mut guards_at: Vec<Vec<BoolExp>> = scans.iter().map(|_| Vec::new()).collect();

    for ((rv, col), id) in &ordered_sites {
        let root = uf.find(*id);
        let here = scan_of[rv];
        let queryable = matches!(scans[here], ScanNode::Atom { .. });
        if let Some(v) = class_lit.get(&root) {
            if queryable {
                prefixes[here].push((*col, RamTerm::Lit(v.clone())));
            } else {
                guards_at[here].push(BoolExp::Eq(
                    RamTerm::RowLoad(*rv, *col),
                    RamTerm::Lit(v.clone()),
                ));
            }
            continue;
        }
        let (arv, acol) = class_anchor[&root];
        if (arv, acol) == (*rv, *col) {
            continue;
        }
        if arv == *rv {
            guards_at[here].push(BoolExp::Eq(
                RamTerm::RowLoad(*rv, *col),
                RamTerm::RowLoad(arv, acol),
            ));
        } else if queryable {
            prefixes[here].push((*col, RamTerm::RowLoad(arv, acol)));
        } else {
            guards_at[here].push(BoolExp::Eq(
                RamTerm::RowLoad(*rv, *col),
                RamTerm::RowLoad(arv, acol),
            ));
        }
    }
    for prefix in &mut prefixes {
        prefix.sort_by_key(|(col, _)| *col);
    }

    // --- Remaining guards attach where they become ground. ---
    let mut top_guards: Vec<BoolExp> = Vec::new();
    for guard in residual {
        let mut rvs = Vec::new();
        guard_rvs(&guard, &mut rvs);
        match rvs.iter().map(|rv| scan_of[rv]).max() {
            None => top_guards.push(guard),
            Some(at) => guards_at[at].push(guard),
        }
    }

    // Short-circuit the whole insert when any scanned relation is empty.
    let mut seen_rels: Vec<RamSym> = Vec::new();
    for scan in &scans {
        if let ScanNode::Atom { rel, .. } = scan {
            if !seen_rels.contains(rel) {
                seen_rels.push(rel.clone());
                top_guards.push(BoolExp::IsEmpty(rel.clone()).not());
            }
        }
    }

    // --- Rebuild the stack. ---
    let mut op = project;
    for (i, scan) in scans.into_iter().enumerate().rev() {
        op = RelOp::guarded(simplify_guards(std::mem::take(&mut guards_at[i])), op);
        op = match scan {
            ScanNode::Atom { rv, rel } => {
                let prefix = std::mem::take(&mut prefixes[i]);
                if prefix.is_empty() {
                    RelOp::Search {
                        rv,
                        rel,
                        body: Box::new(op),
                    }
                } else {
                    RelOp::Query {
                        rv,
                        rel,
                        prefix,
                        body: Box::new(op),
                    }
                }
            }
            ScanNode::Func {
                rv,
                gen,
                args,
                out_arity,
            } => RelOp::Functional {
                rv,
                gen,
                args,
                out_arity,
                body: Box::new(op),
            },
        };
    }
    Some(RelOp::guarded(top_guards, op))
}

/// Hoist every insert of a statement tree.
pub fn hoist(stmt: RamStmt) -> RamStmt {
    match stmt {
        RamStmt::Insert(op) => match rebuild(unhoist(op)) {
            Some(op) => RamStmt::Insert(op),
            // The rule can never fire; nothing remains of it.
            None => RamStmt::Seq(vec![]),
        },
        RamStmt::Seq(stmts) => RamStmt::seq(stmts.into_iter().map(hoist).collect()),
        RamStmt::Par(stmts) => RamStmt::Par(stmts.into_iter().map(hoist).collect()),
        RamStmt::Until { conds, body } => RamStmt::Until {
            conds,
            body: Box::new(hoist(*body)),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{Denotation, PredSym, RelSym};

    fn sym(name: &str, id: u64, arity: usize) -> RamSym {
        RamSym::full(RelSym::new(
            PredSym::new(name, id),
            arity,
            Denotation::Relational,
        ))
    }

    fn project(rel: RamSym) -> RelOp {
        RelOp::Project {
            terms: vec![RamTerm::RowLoad(RowVar(0), 0)],
            rel,
            rule: 0,
        }
    }

    /// search a ∈ Edge, search b ∈ Edge, if (b[0] == a[1]) project.
    fn join_op() -> RelOp {
        RelOp::Search {
            rv: RowVar(0),
            rel: sym("Edge", 0, 2),
            body: Box::new(RelOp::Search {
                rv: RowVar(1),
                rel: sym("Edge", 0, 2),
                body: Box::new(RelOp::If {
                    conds: vec![BoolExp::Eq(
                        RamTerm::RowLoad(RowVar(1), 0),
                        RamTerm::RowLoad(RowVar(0), 1),
                    )],
                    body: Box::new(project(sym("Path", 1, 2))),
                }),
            }),
        }
    }

    #[test]
    fn test_join_guard_becomes_query_prefix() {
        let op = rebuild(unhoist(join_op())).unwrap();
        let text = format!("{}", op);
        assert!(
            text.contains("query {row1 ∈ Edge%0/2 | [0] = row0[1]}"),
            "expected a folded query, got:\n{}",
            text
        );
        // The emptiness short-circuit sits at the top.
        assert!(text.starts_with("if (not (isEmpty(Edge%0/2)))"));
    }

    #[test]
    fn test_literal_binding_becomes_query_prefix() {
        let op = RelOp::Search {
            rv: RowVar(0),
            rel: sym("Edge", 0, 2),
            body: Box::new(RelOp::If {
                conds: vec![BoolExp::Eq(
                    RamTerm::RowLoad(RowVar(0), 0),
                    RamTerm::Lit(Boxed::Int64(7)),
                )],
                body: Box::new(project(sym("Path", 1, 2))),
            }),
        };
        let out = rebuild(unhoist(op)).unwrap();
        let text = format!("{}", out);
        assert!(text.contains("query {row0 ∈ Edge%0/2 | [0] = 7}"), "{}", text);
    }

    #[test]
    fn test_impossible_equality_prunes_rule() {
        // x pinned to both 1 and 2 through a shared class.
        let op = RelOp::Search {
            rv: RowVar(0),
            rel: sym("A", 0, 1),
            body: Box::new(RelOp::Search {
                rv: RowVar(1),
                rel: sym("B", 1, 1),
                body: Box::new(RelOp::If {
                    conds: vec![
                        BoolExp::Eq(RamTerm::RowLoad(RowVar(0), 0), RamTerm::Lit(Boxed::Int64(1))),
                        BoolExp::Eq(
                            RamTerm::RowLoad(RowVar(1), 0),
                            RamTerm::RowLoad(RowVar(0), 0),
                        ),
                        BoolExp::Eq(RamTerm::RowLoad(RowVar(1), 0), RamTerm::Lit(Boxed::Int64(2))),
                    ],
                    body: Box::new(project(sym("C", 2, 1))),
                }),
            }),
        };
        assert!(rebuild(unhoist(op)).is_none());
    }

    #[test]
    fn test_rule_level_guard_lifts_to_top() {
        let always = datalog_ast::NamedPred::new(
            "always",
            std::sync::Arc::new(|_: &[Boxed]| true),
        );
        let op = RelOp::Search {
            rv: RowVar(0),
            rel: sym("A", 0, 1),
            body: Box::new(RelOp::If {
                conds: vec![BoolExp::Guard(
                    always,
                    vec![RamTerm::Lit(Boxed::Int64(1))],
                )],
                body: Box::new(project(sym("B", 1, 1))),
            }),
        };
        let out = rebuild(unhoist(op)).unwrap();
        match out {
            RelOp::If { ref conds, .. } => assert_eq!(conds.len(), 2),
            ref other => panic!("expected a top-level if, got {}", other),
        }
    }

    #[test]
    fn test_roundtrip_is_stable() {
        let once = rebuild(unhoist(join_op())).unwrap();
        let twice = rebuild(unhoist(once.clone())).unwrap();
        assert_eq!(format!("{}", once), format!("{}", twice));
    }
}
