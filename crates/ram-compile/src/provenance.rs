//! Provenance augmentation
//!
//! When proof reconstruction is requested, every projected tuple carries two
//! trailing columns: the proof depth (one more than the maximum depth among
//! the scanned body tuples) and the number of the firing rule. Seed facts
//! receive depth 0 and rule −1 when they are injected; negative witnesses
//! are marked −2 during reconstruction and never stored.
//!
//! Functional atoms are incompatible with provenance and are rejected here.

use datalog_ast::{Boxed, RowVar};
use ram_ir::{RamStmt, RamTerm, RelOp};

/// Error raised while augmenting a program with provenance columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceError {
    /// The program uses a functional atom; proofs cannot witness host
    /// generators.
    FunctionalUnsupported { rule: usize },
}

impl std::fmt::Display for ProvenanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvenanceError::FunctionalUnsupported { rule } => {
                write!(
                    f,
                    "rule #{} uses a functional atom, which provenance does not support",
                    rule
                )
            }
        }
    }
}

impl std::error::Error for ProvenanceError {}

/// Append depth and rule-number terms to every projection.
pub fn augment(stmt: RamStmt) -> Result<RamStmt, ProvenanceError> {
    match stmt {
        RamStmt::Insert(op) => {
            let op = augment_op(op, &mut Vec::new())?;
            Ok(RamStmt::Insert(op))
        }
        RamStmt::Seq(stmts) => Ok(RamStmt::Seq(
            stmts.into_iter().map(augment).collect::<Result<_, _>>()?,
        )),
        RamStmt::Par(stmts) => Ok(RamStmt::Par(
            stmts.into_iter().map(augment).collect::<Result<_, _>>()?,
        )),
        RamStmt::Until { conds, body } => Ok(RamStmt::Until {
            conds,
            body: Box::new(augment(*body)?),
        }),
        other => Ok(other),
    }
}

fn augment_op(op: RelOp, bound: &mut Vec<RowVar>) -> Result<RelOp, ProvenanceError> {
    match op {
        RelOp::Search { rv, rel, body } => {
            bound.push(rv);
            Ok(RelOp::Search {
                rv,
                rel,
                body: Box::new(augment_op(*body, bound)?),
            })
        }
        RelOp::Query {
            rv,
            rel,
            prefix,
            body,
        } => {
            bound.push(rv);
            Ok(RelOp::Query {
                rv,
                rel,
                prefix,
                body: Box::new(augment_op(*body, bound)?),
            })
        }
        RelOp::Functional { body, .. } => {
            // Find the rule number for the report.
            let rule = find_rule(&body);
            Err(ProvenanceError::FunctionalUnsupported { rule })
        }
        RelOp::If { conds, body } => Ok(RelOp::If {
            conds,
            body: Box::new(augment_op(*body, bound)?),
        }),
        RelOp::Project { mut terms, rel, rule } => {
            terms.push(RamTerm::ProvMax(bound.clone()));
            terms.push(RamTerm::Lit(Boxed::Int64(rule as i64)));
            Ok(RelOp::Project { terms, rel, rule })
        }
    }
}

fn find_rule(op: &RelOp) -> usize {
    match op {
        RelOp::Search { body, .. }
        | RelOp::Query { body, .. }
        | RelOp::Functional { body, .. }
        | RelOp::If { body, .. } => find_rule(body),
        RelOp::Project { rule, .. } => *rule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{Denotation, PredSym, RamSym, RelSym};

    fn sym(name: &str, id: u64, arity: usize) -> RamSym {
        RamSym::full(RelSym::new(
            PredSym::new(name, id),
            arity,
            Denotation::Relational,
        ))
    }

    #[test]
    fn test_projection_gains_depth_and_rule_terms() {
        let op = RelOp::Search {
            rv: RowVar(0),
            rel: sym("Edge", 0, 2),
            body: Box::new(RelOp::Project {
                terms: vec![RamTerm::RowLoad(RowVar(0), 0)],
                rel: sym("Path", 1, 1),
                rule: 3,
            }),
        };
        let out = augment(RamStmt::Insert(op)).unwrap();
        let text = format!("{}", out);
        assert!(text.contains("1 + max-depth(row0)"), "{}", text);
        assert!(text.contains(", 3) into"), "{}", text);
    }

    #[test]
    fn test_functional_atoms_are_rejected() {
        let gen = datalog_ast::NamedGen::new(
            "gen",
            std::sync::Arc::new(|_: &[Boxed]| -> Vec<Vec<Boxed>> { vec![] }),
        );
        let op = RelOp::Functional {
            rv: RowVar(0),
            gen,
            args: vec![],
            out_arity: 1,
            body: Box::new(RelOp::Project {
                terms: vec![],
                rel: sym("A", 0, 1),
                rule: 7,
            }),
        };
        let err = augment(RamStmt::Insert(op)).unwrap_err();
        assert_eq!(err, ProvenanceError::FunctionalUnsupported { rule: 7 });
    }
}
