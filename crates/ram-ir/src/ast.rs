//! High-level relational algebra machine (RAM)
//!
//! The compiler lowers Datalog into this representation. Statements express
//! control flow (sequencing, parallel blocks, fixpoint loops, relation
//! maintenance); relation operations express one rule body as a stack of
//! nested scans ending in a projection.
//!
//! The high-level RAM still refers to relations by symbol and to values by
//! their boxed form; the lowering phase resolves both to dense slots.

use datalog_ast::{Boxed, NamedFn, NamedGen, NamedPred, RamSym, RowVar};
use std::fmt;

/// A RAM statement.
#[derive(Debug, Clone)]
pub enum RamStmt {
    /// Run a relation operation for its projections.
    Insert(RelOp),
    /// Merge all tuples of `src` into `dst`, joining lattice values.
    MergeInto { src: RamSym, dst: RamSym },
    /// Exchange the contents of two relations of identical schema.
    Swap { a: RamSym, b: RamSym },
    /// Drop all tuples of a relation.
    Purge(RamSym),
    Seq(Vec<RamStmt>),
    /// Statements safe to run concurrently; joined before continuing.
    Par(Vec<RamStmt>),
    /// Repeat `body` until every condition holds at the start of a round.
    Until { conds: Vec<BoolExp>, body: Box<RamStmt> },
    Comment(String),
    /// Profiling probe: record `(size, duplicates on attrs)` of a relation
    /// into the numbered profile buffer, once per fixpoint round.
    EstimateJoinSize {
        buf: usize,
        rel: RamSym,
        attrs: Vec<usize>,
    },
}

impl RamStmt {
    /// Sequence two statements, flattening nested sequences.
    pub fn seq(stmts: Vec<RamStmt>) -> RamStmt {
        let mut out = Vec::new();
        for s in stmts {
            match s {
                RamStmt::Seq(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        if out.len() == 1 {
            out.pop().expect("bug: singleton sequence")
        } else {
            RamStmt::Seq(out)
        }
    }
}

/// A relation operation: one nested-loop join pipeline.
#[derive(Debug, Clone)]
pub enum RelOp {
    /// Scan every tuple of `rel`, binding `rv`.
    Search {
        rv: RowVar,
        rel: RamSym,
        body: Box<RelOp>,
    },
    /// Range scan of `rel` over the attributes bound in `prefix`.
    /// Each entry fixes one attribute to the value of a term that is ground
    /// once the enclosing scans have bound their row variables.
    Query {
        rv: RowVar,
        rel: RamSym,
        prefix: Vec<(usize, RamTerm)>,
        body: Box<RelOp>,
    },
    /// Bind `rv` to each output row of a host generator.
    Functional {
        rv: RowVar,
        gen: NamedGen,
        args: Vec<RamTerm>,
        out_arity: usize,
        body: Box<RelOp>,
    },
    /// Evaluate the terms and insert into `rel`. For lattice relations the
    /// last term is the lattice value. `rule` is the originating rule
    /// number, recorded for provenance and debug dumps.
    Project {
        terms: Vec<RamTerm>,
        rel: RamSym,
        rule: usize,
    },
    /// Run `body` only when every condition holds.
    If { conds: Vec<BoolExp>, body: Box<RelOp> },
}

impl RelOp {
    /// Wrap `body` in an `If` unless the condition list is empty.
    pub fn guarded(conds: Vec<BoolExp>, body: RelOp) -> RelOp {
        if conds.is_empty() {
            body
        } else {
            RelOp::If {
                conds,
                body: Box::new(body),
            }
        }
    }
}

/// A term of the RAM: evaluates to one attribute value.
#[derive(Debug, Clone)]
pub enum RamTerm {
    Lit(Boxed),
    /// Attribute `col` of the tuple bound to `rv`.
    RowLoad(RowVar, usize),
    /// Greatest lower bound over the lattice values bound by the row vars.
    /// A single-element meet is a plain load.
    Meet(Vec<RowVar>),
    /// Pure host function applied to term values.
    App(NamedFn, Vec<RamTerm>),
    /// One more than the maximum proof depth among the row vars.
    ProvMax(Vec<RowVar>),
}

/// A boolean guard of the RAM.
#[derive(Debug, Clone)]
pub enum BoolExp {
    Not(Box<BoolExp>),
    IsEmpty(RamSym),
    /// The key built from the terms is absent from `rel`. For lattice
    /// relations the final term is the lattice value and membership means
    /// the stored value already subsumes it.
    NotMemberOf(Vec<RamTerm>, RamSym),
    Eq(RamTerm, RamTerm),
    /// `lower` ⊑ `value` in the lattice of `rel`.
    Leq {
        rel: RamSym,
        lower: RamTerm,
        value: RamTerm,
    },
    /// `value` is not the least lattice element of `rel`.
    NotBot { rel: RamSym, value: RamTerm },
    /// Host predicate over term values.
    Guard(NamedPred, Vec<RamTerm>),
}

impl BoolExp {
    pub fn not(self) -> BoolExp {
        BoolExp::Not(Box::new(self))
    }

    /// Whether this guard references a relation (membership or emptiness).
    pub fn rel(&self) -> Option<&RamSym> {
        match self {
            BoolExp::Not(inner) => inner.rel(),
            BoolExp::IsEmpty(rel) | BoolExp::NotMemberOf(_, rel) => Some(rel),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Printing. The debug dump written between phases uses these impls.
// ---------------------------------------------------------------------------

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        write!(f, "    ")?;
    }
    Ok(())
}

fn fmt_terms(f: &mut fmt::Formatter<'_>, terms: &[RamTerm]) -> fmt::Result {
    for (i, t) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", t)?;
    }
    Ok(())
}

impl fmt::Display for RamTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamTerm::Lit(v) => write!(f, "{}", v),
            RamTerm::RowLoad(rv, col) => write!(f, "{}[{}]", rv, col),
            RamTerm::Meet(rvs) => {
                let names: Vec<String> = rvs.iter().map(|rv| format!("{}", rv)).collect();
                write!(f, "⨅({})", names.join(", "))
            }
            RamTerm::App(func, args) => {
                write!(f, "{:?}(", func)?;
                fmt_terms(f, args)?;
                write!(f, ")")
            }
            RamTerm::ProvMax(rvs) => {
                let names: Vec<String> = rvs.iter().map(|rv| format!("{}", rv)).collect();
                write!(f, "1 + max-depth({})", names.join(", "))
            }
        }
    }
}

impl fmt::Display for BoolExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoolExp::Not(inner) => write!(f, "not ({})", inner),
            BoolExp::IsEmpty(rel) => write!(f, "isEmpty({})", rel),
            BoolExp::NotMemberOf(terms, rel) => {
                write!(f, "(")?;
                fmt_terms(f, terms)?;
                write!(f, ") ∉ {}", rel)
            }
            BoolExp::Eq(a, b) => write!(f, "{} == {}", a, b),
            BoolExp::Leq { lower, value, .. } => write!(f, "{} ⊑ {}", lower, value),
            BoolExp::NotBot { value, .. } => write!(f, "{} != ⊥", value),
            BoolExp::Guard(pred, args) => {
                write!(f, "{:?}(", pred)?;
                fmt_terms(f, args)?;
                write!(f, ")")
            }
        }
    }
}

impl RelOp {
    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            RelOp::Search { rv, rel, body } => {
                indent(f, depth)?;
                writeln!(f, "search {} ∈ {} do", rv, rel)?;
                body.fmt_depth(f, depth + 1)
            }
            RelOp::Query {
                rv,
                rel,
                prefix,
                body,
            } => {
                indent(f, depth)?;
                let binds: Vec<String> = prefix
                    .iter()
                    .map(|(col, t)| format!("[{}] = {}", col, t))
                    .collect();
                writeln!(f, "query {{{} ∈ {} | {}}} do", rv, rel, binds.join(", "))?;
                body.fmt_depth(f, depth + 1)
            }
            RelOp::Functional {
                rv,
                gen,
                args,
                body,
                ..
            } => {
                indent(f, depth)?;
                write!(f, "loop({} <- {:?}(", rv, gen)?;
                fmt_terms(f, args)?;
                writeln!(f, ")) do")?;
                body.fmt_depth(f, depth + 1)
            }
            RelOp::Project { terms, rel, .. } => {
                indent(f, depth)?;
                write!(f, "project (")?;
                fmt_terms(f, terms)?;
                writeln!(f, ") into {}", rel)
            }
            RelOp::If { conds, body } => {
                indent(f, depth)?;
                let cs: Vec<String> = conds.iter().map(|c| format!("{}", c)).collect();
                writeln!(f, "if ({}) then", cs.join(" ∧ "))?;
                body.fmt_depth(f, depth + 1)
            }
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl RamStmt {
    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            RamStmt::Insert(op) => op.fmt_depth(f, depth),
            RamStmt::MergeInto { src, dst } => {
                indent(f, depth)?;
                writeln!(f, "merge {} into {}", src, dst)
            }
            RamStmt::Swap { a, b } => {
                indent(f, depth)?;
                writeln!(f, "swap {} and {}", a, b)
            }
            RamStmt::Purge(rel) => {
                indent(f, depth)?;
                writeln!(f, "purge {}", rel)
            }
            RamStmt::Seq(stmts) => {
                for s in stmts {
                    s.fmt_depth(f, depth)?;
                }
                Ok(())
            }
            RamStmt::Par(stmts) => {
                indent(f, depth)?;
                writeln!(f, "par")?;
                for s in stmts {
                    s.fmt_depth(f, depth + 1)?;
                }
                Ok(())
            }
            RamStmt::Until { conds, body } => {
                indent(f, depth)?;
                let cs: Vec<String> = conds.iter().map(|c| format!("{}", c)).collect();
                writeln!(f, "until ({}) do", cs.join(" ∧ "))?;
                body.fmt_depth(f, depth + 1)
            }
            RamStmt::Comment(text) => {
                indent(f, depth)?;
                writeln!(f, "// {}", text)
            }
            RamStmt::EstimateJoinSize { buf, rel, attrs } => {
                indent(f, depth)?;
                writeln!(f, "estimate-join-size #{} {} on {:?}", buf, rel, attrs)
            }
        }
    }
}

impl fmt::Display for RamStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{Denotation, PredSym, RelSym};

    fn sym(name: &str, id: u64) -> RamSym {
        RamSym::full(RelSym::new(PredSym::new(name, id), 2, Denotation::Relational))
    }

    #[test]
    fn test_display_nested_search() {
        let edge = sym("Edge", 0);
        let path = sym("Path", 1);
        let op = RelOp::Search {
            rv: RowVar(0),
            rel: edge,
            body: Box::new(RelOp::Project {
                terms: vec![RamTerm::RowLoad(RowVar(0), 0), RamTerm::RowLoad(RowVar(0), 1)],
                rel: path,
                rule: 0,
            }),
        };
        let text = format!("{}", RamStmt::Insert(op));
        assert!(text.contains("search row0 ∈ Edge%0/2 do"));
        assert!(text.contains("project (row0[0], row0[1]) into Path%1/2"));
    }

    #[test]
    fn test_seq_flattens() {
        let purge = RamStmt::Purge(sym("Edge", 0));
        let nested = RamStmt::seq(vec![
            RamStmt::Seq(vec![purge.clone(), purge.clone()]),
            purge.clone(),
        ]);
        match nested {
            RamStmt::Seq(stmts) => assert_eq!(stmts.len(), 3),
            other => panic!("expected a sequence, got {:?}", other),
        }
    }
}
