//! RAM simplifier
//!
//! Cheap cleanups between code generation and hoisting: tautological
//! equality tests are dropped, membership tests sink to the end of their
//! guard list (they are the most expensive guards), empty `If`s collapse
//! into their body, fixpoint loops whose body only shuffles relations are
//! removed (they would spin without progress), and empty sequences vanish.
//!
//! TODO: a copy-loop of the form `search x ∈ A; project x into B` could
//! collapse into `MergeInto(A, B)`, but the rewrite is unsound for lattice
//! merges (upstream issue #4719) and is not performed.

use ram_ir::{BoolExp, RamStmt, RamTerm, RelOp};

/// Simplify a statement tree. Returns `None` when the whole statement is a
/// no-op.
fn simplify_stmt(stmt: RamStmt) -> Option<RamStmt> {
    match stmt {
        RamStmt::Insert(op) => Some(RamStmt::Insert(simplify_op(op))),
        RamStmt::Seq(stmts) => {
            let out: Vec<RamStmt> = stmts.into_iter().filter_map(simplify_stmt).collect();
            match out.len() {
                0 => None,
                1 => out.into_iter().next(),
                _ => Some(RamStmt::Seq(out)),
            }
        }
        RamStmt::Par(stmts) => {
            let out: Vec<RamStmt> = stmts.into_iter().filter_map(simplify_stmt).collect();
            match out.len() {
                0 => None,
                1 => out.into_iter().next(),
                _ => Some(RamStmt::Par(out)),
            }
        }
        RamStmt::Until { conds, body } => {
            let body = simplify_stmt(*body)?;
            // A loop that only merges, swaps and purges derives nothing new;
            // it would iterate forever.
            if is_progress_free(&body) {
                return None;
            }
            Some(RamStmt::Until {
                conds,
                body: Box::new(body),
            })
        }
        other => Some(other),
    }
}

/// Whether a statement can never derive a new tuple.
fn is_progress_free(stmt: &RamStmt) -> bool {
    match stmt {
        RamStmt::MergeInto { .. }
        | RamStmt::Swap { .. }
        | RamStmt::Purge(_)
        | RamStmt::Comment(_)
        | RamStmt::EstimateJoinSize { .. } => true,
        RamStmt::Seq(stmts) | RamStmt::Par(stmts) => stmts.iter().all(is_progress_free),
        RamStmt::Insert(_) | RamStmt::Until { .. } => false,
    }
}

fn simplify_op(op: RelOp) -> RelOp {
    match op {
        RelOp::Search { rv, rel, body } => RelOp::Search {
            rv,
            rel,
            body: Box::new(simplify_op(*body)),
        },
        RelOp::Query {
            rv,
            rel,
            prefix,
            body,
        } => RelOp::Query {
            rv,
            rel,
            prefix,
            body: Box::new(simplify_op(*body)),
        },
        RelOp::Functional {
            rv,
            gen,
            args,
            out_arity,
            body,
        } => RelOp::Functional {
            rv,
            gen,
            args,
            out_arity,
            body: Box::new(simplify_op(*body)),
        },
        RelOp::Project { .. } => op,
        RelOp::If { conds, body } => {
            let body = simplify_op(*body);
            let conds = simplify_guards(conds);
            RelOp::guarded(conds, body)
        }
    }
}

/// Drop tautologies and move membership tests last.
pub(crate) fn simplify_guards(conds: Vec<BoolExp>) -> Vec<BoolExp> {
    let mut cheap = Vec::new();
    let mut memberships = Vec::new();
    for cond in conds {
        if let BoolExp::Eq(a, b) = &cond {
            if term_eq(a, b) {
                continue;
            }
        }
        if matches!(cond, BoolExp::NotMemberOf(..)) {
            memberships.push(cond);
        } else {
            cheap.push(cond);
        }
    }
    cheap.extend(memberships);
    cheap
}

/// Syntactic term equality; host-function applications never compare equal.
fn term_eq(a: &RamTerm, b: &RamTerm) -> bool {
    match (a, b) {
        (RamTerm::Lit(x), RamTerm::Lit(y)) => x == y,
        (RamTerm::RowLoad(rv1, c1), RamTerm::RowLoad(rv2, c2)) => rv1 == rv2 && c1 == c2,
        (RamTerm::Meet(x), RamTerm::Meet(y)) => x == y,
        _ => false,
    }
}

/// Entry point: simplify until nothing changes structurally. One bottom-up
/// pass is already a fixpoint for these rewrites.
pub fn simplify(stmt: RamStmt) -> RamStmt {
    simplify_stmt(stmt).unwrap_or(RamStmt::Seq(vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{Denotation, PredSym, RamSym, RelSym, RowVar};

    fn sym(name: &str, id: u64) -> RamSym {
        RamSym::full(RelSym::new(PredSym::new(name, id), 2, Denotation::Relational))
    }

    fn project(rel: RamSym) -> RelOp {
        RelOp::Project {
            terms: vec![RamTerm::RowLoad(RowVar(0), 0), RamTerm::RowLoad(RowVar(0), 1)],
            rel,
            rule: 0,
        }
    }

    #[test]
    fn test_tautology_is_dropped_and_if_collapses() {
        let op = RelOp::If {
            conds: vec![BoolExp::Eq(
                RamTerm::RowLoad(RowVar(0), 1),
                RamTerm::RowLoad(RowVar(0), 1),
            )],
            body: Box::new(project(sym("A", 0))),
        };
        let out = simplify(RamStmt::Insert(op));
        match out {
            RamStmt::Insert(RelOp::Project { .. }) => {}
            other => panic!("expected a bare projection, got {}", other),
        }
    }

    #[test]
    fn test_membership_tests_sink_to_the_end() {
        let guards = vec![
            BoolExp::NotMemberOf(vec![RamTerm::RowLoad(RowVar(0), 0)], sym("A", 0)),
            BoolExp::Eq(RamTerm::RowLoad(RowVar(0), 0), RamTerm::RowLoad(RowVar(1), 0)),
        ];
        let out = simplify_guards(guards);
        assert!(matches!(out[0], BoolExp::Eq(..)));
        assert!(matches!(out[1], BoolExp::NotMemberOf(..)));
    }

    #[test]
    fn test_progress_free_until_is_dropped() {
        let stmt = RamStmt::Until {
            conds: vec![BoolExp::IsEmpty(sym("A", 0))],
            body: Box::new(RamStmt::Seq(vec![
                RamStmt::Comment("no rules here".into()),
                RamStmt::MergeInto {
                    src: sym("A", 0),
                    dst: sym("B", 1),
                },
                RamStmt::Purge(sym("A", 0)),
            ])),
        };
        let out = simplify(RamStmt::Seq(vec![stmt]));
        assert!(matches!(out, RamStmt::Seq(ref s) if s.is_empty()));
    }

    #[test]
    fn test_empty_seq_and_par_flatten() {
        let stmt = RamStmt::Seq(vec![
            RamStmt::Par(vec![]),
            RamStmt::Seq(vec![RamStmt::Purge(sym("A", 0))]),
        ]);
        let out = simplify(stmt);
        assert!(matches!(out, RamStmt::Purge(_)));
    }
}
