//! Abstract syntax for Datalog programs and models
//!
//! A program is a collection of constraints: facts (literal-only head, empty
//! body) and rules (`head :- body`). Body atoms carry a polarity, a fixity
//! and a denotation; guards and functionals are host functions applied to
//! rule variables. A `Datalog` value is either a program, an already solved
//! model, or a join of a model with a program, in which case the model acts
//! as seed facts.

use crate::symbols::{RelSym, Symbol, VarSym};
use crate::value::{Boxed, BoxedFn, BoxedGen, BoxedPred, Denotation};
use internment::Intern;
use std::collections::BTreeMap;
use std::fmt;

/// A host function with a name for printing.
#[derive(Clone)]
pub struct NamedFn {
    pub name: Symbol,
    pub f: BoxedFn,
}

impl NamedFn {
    pub fn new(name: impl Into<String>, f: BoxedFn) -> Self {
        NamedFn {
            name: Intern::new(name.into()),
            f,
        }
    }

    pub fn apply(&self, args: &[Boxed]) -> Boxed {
        (self.f)(args)
    }
}

impl fmt::Debug for NamedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.name)
    }
}

/// A host predicate with a name for printing.
#[derive(Clone)]
pub struct NamedPred {
    pub name: Symbol,
    pub f: BoxedPred,
}

impl NamedPred {
    pub fn new(name: impl Into<String>, f: BoxedPred) -> Self {
        NamedPred {
            name: Intern::new(name.into()),
            f,
        }
    }

    pub fn test(&self, args: &[Boxed]) -> bool {
        (self.f)(args)
    }
}

impl fmt::Debug for NamedPred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.name)
    }
}

/// A host row generator with a name for printing.
#[derive(Clone)]
pub struct NamedGen {
    pub name: Symbol,
    pub f: BoxedGen,
}

impl NamedGen {
    pub fn new(name: impl Into<String>, f: BoxedGen) -> Self {
        NamedGen {
            name: Intern::new(name.into()),
            f,
        }
    }

    pub fn generate(&self, args: &[Boxed]) -> Vec<Vec<Boxed>> {
        (self.f)(args)
    }
}

impl fmt::Debug for NamedGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.name)
    }
}

/// Polarity of a body atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
}

/// Whether an atom participates in delta-driven re-evaluation.
///
/// A `Fixed` atom always reads the `Full` relation, even when its predicate
/// is recursive in the current stratum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixity {
    Loose,
    Fixed,
}

/// A term in a body atom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyTerm {
    Var(VarSym),
    Lit(Boxed),
    Wild,
}

impl BodyTerm {
    pub fn var(name: impl Into<String>) -> Self {
        BodyTerm::Var(Intern::new(name.into()))
    }

    pub fn as_var(&self) -> Option<VarSym> {
        match self {
            BodyTerm::Var(v) => Some(*v),
            _ => None,
        }
    }
}

/// A term in a rule head.
#[derive(Debug, Clone)]
pub enum HeadTerm {
    Var(VarSym),
    Lit(Boxed),
    /// Pure host function applied to rule variables.
    App(NamedFn, Vec<VarSym>),
}

impl HeadTerm {
    pub fn var(name: impl Into<String>) -> Self {
        HeadTerm::Var(Intern::new(name.into()))
    }
}

/// The head atom of a constraint.
#[derive(Debug, Clone)]
pub struct HeadAtom {
    pub rel: RelSym,
    pub terms: Vec<HeadTerm>,
}

impl HeadAtom {
    pub fn new(rel: RelSym, terms: Vec<HeadTerm>) -> Self {
        HeadAtom { rel, terms }
    }

    /// Whether every head term is a literal.
    pub fn is_ground(&self) -> bool {
        self.terms.iter().all(|t| matches!(t, HeadTerm::Lit(_)))
    }
}

/// A predicate occurring in a rule body.
#[derive(Debug, Clone)]
pub enum BodyPredicate {
    Atom {
        rel: RelSym,
        polarity: Polarity,
        fixity: Fixity,
        terms: Vec<BodyTerm>,
    },
    /// Host predicate over rule variables and literals.
    Guard(NamedPred, Vec<BodyTerm>),
    /// Host generator binding `outs` from `ins`.
    Functional {
        outs: Vec<VarSym>,
        gen: NamedGen,
        ins: Vec<VarSym>,
    },
}

impl BodyPredicate {
    pub fn atom(rel: RelSym, terms: Vec<BodyTerm>) -> Self {
        BodyPredicate::Atom {
            rel,
            polarity: Polarity::Positive,
            fixity: Fixity::Loose,
            terms,
        }
    }

    pub fn not_atom(rel: RelSym, terms: Vec<BodyTerm>) -> Self {
        BodyPredicate::Atom {
            rel,
            polarity: Polarity::Negative,
            fixity: Fixity::Loose,
            terms,
        }
    }

    /// The relation read by this predicate, if it is an atom.
    pub fn rel(&self) -> Option<&RelSym> {
        match self {
            BodyPredicate::Atom { rel, .. } => Some(rel),
            _ => None,
        }
    }

    pub fn is_positive_atom(&self) -> bool {
        matches!(
            self,
            BodyPredicate::Atom {
                polarity: Polarity::Positive,
                ..
            }
        )
    }
}

/// A Horn clause `head :- body`. A fact is a constraint with a literal-only
/// head and an empty body.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub head: HeadAtom,
    pub body: Vec<BodyPredicate>,
}

impl Constraint {
    pub fn rule(head: HeadAtom, body: Vec<BodyPredicate>) -> Self {
        Constraint { head, body }
    }

    pub fn fact(head: HeadAtom) -> Self {
        assert!(
            head.is_ground(),
            "bug: fact head contains a non-literal term: {:?}",
            head
        );
        Constraint { head, body: vec![] }
    }

    pub fn is_fact(&self) -> bool {
        self.body.is_empty() && self.head.is_ground()
    }

    /// Relations read by the body, positive atoms only.
    pub fn positive_body_rels(&self) -> impl Iterator<Item = &RelSym> {
        self.body.iter().filter_map(|p| match p {
            BodyPredicate::Atom {
                rel,
                polarity: Polarity::Positive,
                ..
            } => Some(rel),
            _ => None,
        })
    }
}

/// A set of facts and rules.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub facts: Vec<Constraint>,
    pub rules: Vec<Constraint>,
}

impl Program {
    pub fn new(facts: Vec<Constraint>, rules: Vec<Constraint>) -> Self {
        Program { facts, rules }
    }

    /// Every relation mentioned in a head or a body atom.
    pub fn relations(&self) -> Vec<RelSym> {
        let mut out: Vec<RelSym> = Vec::new();
        let mut push = |r: &RelSym| {
            if !out.contains(r) {
                out.push(r.clone());
            }
        };
        for c in self.facts.iter().chain(self.rules.iter()) {
            push(&c.head.rel);
            for p in &c.body {
                if let Some(r) = p.rel() {
                    push(r);
                }
            }
        }
        out
    }
}

/// A Datalog value as handled by the solver façade.
#[derive(Debug, Clone)]
pub enum Datalog {
    /// Facts and rules awaiting evaluation.
    Program(Program),
    /// An already solved model.
    Model(Model),
    /// A model used as seed facts for a program.
    Join(Model, Program),
}

impl Datalog {
    pub fn empty() -> Self {
        Datalog::Program(Program::default())
    }
}

/// A solved model: one row set per relation. For lattice relations the
/// payload is the joined lattice value; relational rows carry `NoValue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub relations: BTreeMap<RelSym, BTreeMap<Vec<Boxed>, Boxed>>,
}

impl Model {
    pub fn new() -> Self {
        Model::default()
    }

    /// Insert a row, joining with the lattice ⊔ on collision.
    pub fn insert(&mut self, rel: &RelSym, key: Vec<Boxed>, payload: Boxed) {
        let rows = self.relations.entry(rel.clone()).or_default();
        match rows.entry(key) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(payload);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                if let Denotation::Latticenal(ops) = &rel.den {
                    let joined = (ops.lub)(e.get(), &payload);
                    e.insert(joined);
                }
            }
        }
    }

    /// Merge another model into this one, per relation.
    pub fn merge(&mut self, other: &Model) {
        for (rel, rows) in &other.relations {
            for (key, payload) in rows {
                self.insert(rel, key.clone(), payload.clone());
            }
        }
    }

    /// All rows of a relation as full tuples, lattice value appended.
    pub fn rows_of(&self, rel: &RelSym) -> Vec<Vec<Boxed>> {
        let Some(rows) = self.relations.get(rel) else {
            return vec![];
        };
        rows.iter()
            .map(|(key, payload)| {
                let mut row = key.clone();
                if rel.den.is_lattice() {
                    row.push(payload.clone());
                }
                row
            })
            .collect()
    }

    /// Total number of stored rows.
    pub fn fact_count(&self) -> usize {
        self.relations.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.values().all(|r| r.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::PredSym;
    use crate::value::LatticeOps;
    use std::sync::Arc;

    fn rel(name: &str, id: u64, arity: usize) -> RelSym {
        RelSym::new(PredSym::new(name, id), arity, Denotation::Relational)
    }

    #[test]
    fn test_fact_requires_ground_head() {
        let edge = rel("Edge", 0, 2);
        let head = HeadAtom::new(
            edge,
            vec![HeadTerm::Lit(Boxed::Int64(1)), HeadTerm::Lit(Boxed::Int64(2))],
        );
        let fact = Constraint::fact(head);
        assert!(fact.is_fact());
    }

    #[test]
    #[should_panic(expected = "non-literal term")]
    fn test_fact_with_var_head_is_a_bug() {
        let edge = rel("Edge", 0, 2);
        let head = HeadAtom::new(edge, vec![HeadTerm::var("x"), HeadTerm::Lit(Boxed::Int64(2))]);
        let _ = Constraint::fact(head);
    }

    #[test]
    fn test_model_merge_is_set_union_for_relational() {
        let edge = rel("Edge", 0, 2);
        let mut m1 = Model::new();
        m1.insert(&edge, vec![Boxed::Int64(1), Boxed::Int64(2)], Boxed::NoValue);
        let mut m2 = Model::new();
        m2.insert(&edge, vec![Boxed::Int64(1), Boxed::Int64(2)], Boxed::NoValue);
        m2.insert(&edge, vec![Boxed::Int64(2), Boxed::Int64(3)], Boxed::NoValue);
        m1.merge(&m2);
        assert_eq!(m1.rows_of(&edge).len(), 2);
    }

    #[test]
    fn test_model_merge_joins_lattice_values() {
        let ops = LatticeOps::new(
            Boxed::Int64(i64::MIN),
            Arc::new(|a: &Boxed, b: &Boxed| a <= b),
            Arc::new(|a: &Boxed, b: &Boxed| if a >= b { a.clone() } else { b.clone() }),
            Arc::new(|a: &Boxed, b: &Boxed| if a <= b { a.clone() } else { b.clone() }),
        );
        let dist = RelSym::new(PredSym::new("Dist", 1), 2, Denotation::Latticenal(ops));

        let mut m1 = Model::new();
        m1.insert(&dist, vec![Boxed::str("a")], Boxed::Int64(3));
        let mut m2 = Model::new();
        m2.insert(&dist, vec![Boxed::str("a")], Boxed::Int64(7));
        m1.merge(&m2);
        assert_eq!(
            m1.rows_of(&dist),
            vec![vec![Boxed::str("a"), Boxed::Int64(7)]]
        );
    }

    #[test]
    fn test_program_relations_deduplicates() {
        let edge = rel("Edge", 0, 2);
        let path = rel("Path", 1, 2);
        let rule = Constraint::rule(
            HeadAtom::new(path.clone(), vec![HeadTerm::var("x"), HeadTerm::var("y")]),
            vec![BodyPredicate::atom(
                edge.clone(),
                vec![BodyTerm::var("x"), BodyTerm::var("y")],
            )],
        );
        let prog = Program::new(vec![], vec![rule]);
        assert_eq!(prog.relations(), vec![path, edge]);
    }
}
