//! Stratified Datalog solver over a relational algebra machine.
//!
//! The façade consumed by the embedding layer: build a [`Datalog`] value
//! from injected facts and rules, then [`solve`] it to its minimal model,
//! or [`solve_with_provenance`] to additionally reconstruct proofs.
//! Programs compose with [`union`], restrict with [`project_sym`] and
//! isolate with [`rename`].

mod error;
mod options;
mod prov;
mod rows;
mod solver;

pub use datalog_ast::{
    BodyPredicate, BodyTerm, Boxed, Constraint, Datalog, Denotation, Fixity, HeadAtom, HeadTerm,
    LatticeOps, Model, NamedFn, NamedGen, NamedPred, Polarity, PredSym, PredicateRegistry,
    Program, RelSym,
};
pub use error::FixpointError;
pub use options::Options;
pub use prov::{ProofTree, Provenance};
pub use rows::{FactRow, FactValue};

use datalog_ast::VarSym;
use std::collections::HashMap;

/// Evaluate a Datalog value to its minimal model.
pub fn solve(d: &Datalog, opts: &Options) -> Result<Model, FixpointError> {
    Ok(solver::run_solve(d, opts)?.model)
}

/// Evaluate with provenance annotations and proof search enabled.
pub fn solve_with_provenance(d: &Datalog, opts: &Options) -> Result<Provenance, FixpointError> {
    let mut opts = opts.clone();
    opts.use_provenance = true;
    let out = solver::run_solve(d, &opts)?;
    let ann = out.ann.expect("bug: provenance run produced no annotations");
    Ok(Provenance::new(out.model, ann, out.rules))
}

/// Compose two Datalog values. Programs concatenate, models merge per
/// relation (joining lattice values), and a model composed with a program
/// becomes a join in which the model seeds the program's facts.
pub fn union(d1: Datalog, d2: Datalog) -> Datalog {
    use Datalog::{Join, Model as M, Program as P};
    match (d1, d2) {
        (P(a), P(b)) => {
            let mut facts = a.facts;
            facts.extend(b.facts);
            let mut rules = a.rules;
            rules.extend(b.rules);
            P(Program::new(facts, rules))
        }
        (M(mut a), M(b)) => {
            a.merge(&b);
            M(a)
        }
        (P(p), M(m)) | (M(m), P(p)) => Join(m, p),
        (Join(m, p), P(q)) | (P(q), Join(m, p)) => {
            let mut facts = p.facts;
            let mut rules = p.rules;
            facts.extend(q.facts);
            rules.extend(q.rules);
            Join(m, Program::new(facts, rules))
        }
        (Join(mut m, p), M(n)) | (M(n), Join(mut m, p)) => {
            m.merge(&n);
            Join(m, p)
        }
        (Join(mut m1, p1), Join(m2, p2)) => {
            m1.merge(&m2);
            let mut facts = p1.facts;
            let mut rules = p1.rules;
            facts.extend(p2.facts);
            rules.extend(p2.rules);
            Join(m1, Program::new(facts, rules))
        }
    }
}

/// Extract the facts whose head predicate is `p`.
pub fn project_sym(p: PredSym, d: &Datalog) -> Datalog {
    let filter_program = |prog: &Program| {
        Program::new(
            prog.facts
                .iter()
                .filter(|f| f.head.rel.pred == p)
                .cloned()
                .collect(),
            vec![],
        )
    };
    let filter_model = |m: &Model| {
        let mut out = Model::new();
        for (rel, rows) in &m.relations {
            if rel.pred == p {
                out.relations.insert(rel.clone(), rows.clone());
            }
        }
        out
    };
    match d {
        Datalog::Program(prog) => Datalog::Program(filter_program(prog)),
        Datalog::Model(m) => Datalog::Model(filter_model(m)),
        Datalog::Join(m, prog) => Datalog::Join(filter_model(m), filter_program(prog)),
    }
}

/// Rename every predicate except those on the keep list by assigning fresh
/// ids, isolating the value from others it may be unioned with.
pub fn rename(keep: &[PredSym], d: &Datalog) -> Datalog {
    let mut registry = PredicateRegistry::new();
    let mut observe_rel = |rel: &RelSym, reg: &mut PredicateRegistry| reg.observe(rel.pred);
    visit_rels(d, &mut |rel| observe_rel(rel, &mut registry));

    let mut mapping: HashMap<PredSym, PredSym> = HashMap::new();
    let mut map_rel = |rel: &RelSym| -> RelSym {
        if keep.contains(&rel.pred) {
            return rel.clone();
        }
        let pred = *mapping
            .entry(rel.pred)
            .or_insert_with(|| registry.fresh(rel.pred.name.as_ref().clone()));
        RelSym::new(pred, rel.arity, rel.den.clone())
    };

    let map_constraint = |c: &Constraint, map_rel: &mut dyn FnMut(&RelSym) -> RelSym| {
        let head = HeadAtom::new(map_rel(&c.head.rel), c.head.terms.clone());
        let body = c
            .body
            .iter()
            .map(|p| match p {
                BodyPredicate::Atom {
                    rel,
                    polarity,
                    fixity,
                    terms,
                } => BodyPredicate::Atom {
                    rel: map_rel(rel),
                    polarity: *polarity,
                    fixity: *fixity,
                    terms: terms.clone(),
                },
                other => other.clone(),
            })
            .collect();
        Constraint::rule(head, body)
    };
    let map_program = |p: &Program, map_rel: &mut dyn FnMut(&RelSym) -> RelSym| {
        Program::new(
            p.facts.iter().map(|c| map_constraint(c, map_rel)).collect(),
            p.rules.iter().map(|c| map_constraint(c, map_rel)).collect(),
        )
    };
    let map_model = |m: &Model, map_rel: &mut dyn FnMut(&RelSym) -> RelSym| {
        let mut out = Model::new();
        for (rel, rows) in &m.relations {
            out.relations.insert(map_rel(rel), rows.clone());
        }
        out
    };

    match d {
        Datalog::Program(p) => Datalog::Program(map_program(p, &mut map_rel)),
        Datalog::Model(m) => Datalog::Model(map_model(m, &mut map_rel)),
        Datalog::Join(m, p) => {
            Datalog::Join(map_model(m, &mut map_rel), map_program(p, &mut map_rel))
        }
    }
}

fn visit_rels(d: &Datalog, visit: &mut dyn FnMut(&RelSym)) {
    let mut visit_program = |p: &Program, visit: &mut dyn FnMut(&RelSym)| {
        for c in p.facts.iter().chain(p.rules.iter()) {
            visit(&c.head.rel);
            for pred in &c.body {
                if let Some(rel) = pred.rel() {
                    visit(rel);
                }
            }
        }
    };
    match d {
        Datalog::Program(p) => visit_program(p, visit),
        Datalog::Model(m) => {
            for rel in m.relations.keys() {
                visit(rel);
            }
        }
        Datalog::Join(m, p) => {
            for rel in m.relations.keys() {
                visit(rel);
            }
            visit_program(p, visit);
        }
    }
}

/// Ingest a sequence of typed rows as facts of predicate `p`.
pub fn inject_into<R: FactRow>(p: PredSym, rows: impl IntoIterator<Item = R>) -> Datalog {
    let rel = RelSym::new(p, R::ARITY, Denotation::Relational);
    let facts = rows
        .into_iter()
        .map(|row| {
            let terms = row.into_row().into_iter().map(HeadTerm::Lit).collect();
            Constraint::fact(HeadAtom::new(rel.clone(), terms))
        })
        .collect();
    Datalog::Program(Program::new(facts, vec![]))
}

/// Extract the facts of predicate `p` as typed rows, in sorted order.
pub fn facts<R: FactRow>(p: PredSym, d: &Datalog) -> Vec<R> {
    let mut rows: Vec<Vec<Boxed>> = Vec::new();
    let collect_program = |prog: &Program, rows: &mut Vec<Vec<Boxed>>| {
        for fact in &prog.facts {
            if fact.head.rel.pred != p || fact.head.terms.len() != R::ARITY {
                continue;
            }
            let row: Vec<Boxed> = fact
                .head
                .terms
                .iter()
                .filter_map(|t| match t {
                    HeadTerm::Lit(v) => Some(v.clone()),
                    _ => None,
                })
                .collect();
            if row.len() == R::ARITY {
                rows.push(row);
            }
        }
    };
    let collect_model = |m: &Model, rows: &mut Vec<Vec<Boxed>>| {
        for (rel, _) in &m.relations {
            if rel.pred == p && rel.arity == R::ARITY {
                rows.extend(m.rows_of(rel));
            }
        }
    };
    match d {
        Datalog::Program(prog) => collect_program(prog, &mut rows),
        Datalog::Model(m) => collect_model(m, &mut rows),
        Datalog::Join(m, prog) => {
            collect_model(m, &mut rows);
            collect_program(prog, &mut rows);
        }
    }
    rows.sort();
    rows.dedup();
    rows.iter().filter_map(|r| R::from_row(r)).collect()
}

/// Pre-order flattened proof of `goal`, or `None` when the goal is not in
/// the model. Provenance is enabled for this call only; queries against a
/// plain `solve` result are rejected by construction.
///
/// TODO: the original solver primed every provenance run with a hard-coded
/// probe goal before answering; the reason is unrecorded, so only the
/// caller's goal is evaluated here.
pub fn prov_of<R: FactRow>(
    p: PredSym,
    goal: R,
    d: &Datalog,
    opts: &Options,
) -> Result<Option<Vec<(PredSym, Vec<Boxed>)>>, FixpointError> {
    let prov = solve_with_provenance(d, opts)?;
    let row = goal.into_row();
    let Some(rel) = prov
        .model()
        .relations
        .keys()
        .find(|rel| rel.pred == p && rel.arity == row.len())
        .cloned()
    else {
        return Ok(None);
    };
    Ok(prov.prove(&rel, &row).map(|tree| tree.flatten()))
}

/// A host guard applied to rule variables.
pub fn guard(name: &str, f: datalog_ast::BoxedPred, args: Vec<&str>) -> BodyPredicate {
    BodyPredicate::Guard(
        NamedPred::new(name, f),
        args.into_iter().map(BodyTerm::var).collect(),
    )
}

/// A host generator binding output variables from input variables.
pub fn functional(
    outs: Vec<&str>,
    name: &str,
    f: datalog_ast::BoxedGen,
    ins: Vec<&str>,
) -> BodyPredicate {
    let intern = |names: Vec<&str>| -> Vec<VarSym> {
        names
            .into_iter()
            .map(|n| internment::Intern::new(n.to_string()))
            .collect()
    };
    BodyPredicate::Functional {
        outs: intern(outs),
        gen: NamedGen::new(name, f),
        ins: intern(ins),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge() -> PredSym {
        PredSym::new("Edge", 0)
    }

    #[test]
    fn test_inject_and_facts_round_trip() {
        let d = inject_into(edge(), vec![(2i64, 3i64), (1i64, 2i64), (1i64, 2i64)]);
        let rows: Vec<(i64, i64)> = facts(edge(), &d);
        assert_eq!(rows, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_union_of_programs_concatenates() {
        let d1 = inject_into(edge(), vec![(1i64, 2i64)]);
        let d2 = inject_into(edge(), vec![(2i64, 3i64)]);
        let rows: Vec<(i64, i64)> = facts(edge(), &union(d1, d2));
        assert_eq!(rows, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_project_sym_drops_other_predicates() {
        let node = PredSym::new("Node", 1);
        let d = union(
            inject_into(edge(), vec![(1i64, 2i64)]),
            inject_into(node, vec![(1i64,)]),
        );
        let projected = project_sym(edge(), &d);
        assert_eq!(facts::<(i64, i64)>(edge(), &projected).len(), 1);
        assert!(facts::<(i64,)>(node, &projected).is_empty());
    }

    #[test]
    fn test_rename_keeps_whitelisted_predicates() {
        let node = PredSym::new("Node", 1);
        let d = union(
            inject_into(edge(), vec![(1i64, 2i64)]),
            inject_into(node, vec![(1i64,)]),
        );
        let renamed = rename(&[edge()], &d);
        // Edge kept its id; Node did not.
        assert_eq!(facts::<(i64, i64)>(edge(), &renamed).len(), 1);
        assert!(facts::<(i64,)>(node, &renamed).is_empty());
    }

    #[test]
    fn test_model_union_is_set_union() {
        let rel = RelSym::new(edge(), 2, Denotation::Relational);
        let mut m1 = Model::new();
        m1.insert(&rel, vec![Boxed::Int64(1), Boxed::Int64(2)], Boxed::NoValue);
        let mut m2 = Model::new();
        m2.insert(&rel, vec![Boxed::Int64(1), Boxed::Int64(2)], Boxed::NoValue);
        m2.insert(&rel, vec![Boxed::Int64(2), Boxed::Int64(3)], Boxed::NoValue);
        let u = union(Datalog::Model(m1), Datalog::Model(m2));
        let rows: Vec<(i64, i64)> = facts(edge(), &u);
        assert_eq!(rows, vec![(1, 2), (2, 3)]);
    }
}
