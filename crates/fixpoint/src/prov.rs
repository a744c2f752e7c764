//! Proof reconstruction
//!
//! A provenance-annotated model stores, per fact, the depth of its cheapest
//! derivation and the rule that fired it. Reconstruction replays that rule:
//! for every positive body atom it looks up a witness fact of strictly
//! smaller depth through a lazy per-`(predicate, selected columns)` index
//! built on first use; negative atoms only check non-membership. The result
//! is a proof tree whose leaves are seed facts (rule −1) or negative
//! witnesses (marked −2 in flattened output positions by their node kind).

use datalog_ast::{
    BodyPredicate, BodyTerm, Boxed, Constraint, HeadTerm, Model, Polarity, PredSym, RelSym,
    VarSym,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// A reconstructed proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofTree {
    /// A seed fact.
    Edb(PredSym, Vec<Boxed>),
    /// A negative witness: the fact is absent from the model.
    Negative(PredSym, Vec<Boxed>),
    /// A derived fact with one subproof per positive body atom.
    Node {
        pred: PredSym,
        row: Vec<Boxed>,
        rule: usize,
        children: Vec<ProofTree>,
    },
}

impl ProofTree {
    /// Pre-order walk: the node itself, then its subproofs.
    pub fn flatten(&self) -> Vec<(PredSym, Vec<Boxed>)> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<(PredSym, Vec<Boxed>)>) {
        match self {
            ProofTree::Edb(pred, row) | ProofTree::Negative(pred, row) => {
                out.push((*pred, row.clone()));
            }
            ProofTree::Node {
                pred,
                row,
                children,
                ..
            } => {
                out.push((*pred, row.clone()));
                for child in children {
                    child.flatten_into(out);
                }
            }
        }
    }
}

type Ann = BTreeMap<RelSym, BTreeMap<Vec<Boxed>, (i64, i64)>>;
type LazyIndex = HashMap<Vec<Boxed>, Vec<(Vec<Boxed>, i64)>>;

/// A solved model with provenance annotations and proof search.
pub struct Provenance {
    model: Model,
    ann: Ann,
    rules: Vec<Constraint>,
    /// Per-(predicate id, selected columns) witness indexes, built lazily.
    lazy: Mutex<HashMap<(u64, Vec<usize>), LazyIndex>>,
}

impl Provenance {
    pub(crate) fn new(model: Model, ann: Ann, rules: Vec<Constraint>) -> Self {
        Provenance {
            model,
            ann,
            rules,
            lazy: Mutex::new(HashMap::new()),
        }
    }

    /// The annotated model, without its annotations.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Depth and firing rule of a fact, when it is in the model.
    pub fn annotation_of(&self, rel: &RelSym, key: &[Boxed]) -> Option<(i64, i64)> {
        self.ann.get(rel)?.get(key).copied()
    }

    /// Reconstruct a proof for a full row (lattice value included) of `rel`.
    pub fn prove(&self, rel: &RelSym, row: &[Boxed]) -> Option<ProofTree> {
        let key = &row[..rel.key_arity()];
        let (depth, rule) = self.annotation_of(rel, key)?;
        if rule < 0 {
            return Some(ProofTree::Edb(rel.pred, row.to_vec()));
        }
        let rule_no = rule as usize;
        let constraint = &self.rules[rule_no];

        // Bind head variables from the goal row; host applications can only
        // be checked once the body grounds their arguments.
        let mut bindings: HashMap<VarSym, Boxed> = HashMap::new();
        let mut deferred: Vec<(&datalog_ast::NamedFn, &[VarSym], &Boxed)> = Vec::new();
        for (term, value) in constraint.head.terms.iter().zip(row) {
            match term {
                HeadTerm::Var(v) => {
                    if let Some(prev) = bindings.insert(*v, value.clone()) {
                        if prev != *value {
                            return None;
                        }
                    }
                }
                HeadTerm::Lit(l) => {
                    if l != value {
                        return None;
                    }
                }
                HeadTerm::App(f, args) => deferred.push((f, args.as_slice(), value)),
            }
        }

        let witnesses = self.search_body(&constraint.body, 0, bindings, depth, &deferred)?;
        let children = witnesses
            .into_iter()
            .map(|w| match w {
                Witness::Positive(rel, row) => self
                    .prove(&rel, &row)
                    .unwrap_or(ProofTree::Edb(rel.pred, row)),
                Witness::Negative(rel, row) => ProofTree::Negative(rel.pred, row),
            })
            .collect();
        Some(ProofTree::Node {
            pred: rel.pred,
            row: row.to_vec(),
            rule: rule_no,
            children,
        })
    }

    fn search_body(
        &self,
        body: &[BodyPredicate],
        idx: usize,
        bindings: HashMap<VarSym, Boxed>,
        depth: i64,
        deferred: &[(&datalog_ast::NamedFn, &[VarSym], &Boxed)],
    ) -> Option<Vec<Witness>> {
        let Some(pred) = body.get(idx) else {
            // Body exhausted: verify the deferred head applications.
            for (f, args, expected) in deferred {
                let vals: Vec<Boxed> = args.iter().map(|v| bindings[v].clone()).collect();
                if f.apply(&vals) != **expected {
                    return None;
                }
            }
            return Some(Vec::new());
        };

        match pred {
            BodyPredicate::Atom {
                rel,
                polarity: Polarity::Positive,
                terms,
                ..
            } => {
                // Select the columns already ground under the bindings.
                let mut sel_cols = Vec::new();
                let mut sel_vals = Vec::new();
                for (col, term) in terms.iter().enumerate() {
                    match term {
                        BodyTerm::Lit(v) => {
                            sel_cols.push(col);
                            sel_vals.push(v.clone());
                        }
                        BodyTerm::Var(v) => {
                            if let Some(val) = bindings.get(v) {
                                sel_cols.push(col);
                                sel_vals.push(val.clone());
                            }
                        }
                        BodyTerm::Wild => {}
                    }
                }
                let candidates = self.lookup(rel, &sel_cols, &sel_vals);
                for (candidate, cand_depth) in candidates {
                    if cand_depth >= depth {
                        continue;
                    }
                    let mut next = bindings.clone();
                    let mut ok = true;
                    for (col, term) in terms.iter().enumerate() {
                        if let BodyTerm::Var(v) = term {
                            match next.get(v) {
                                Some(bound) if *bound != candidate[col] => {
                                    ok = false;
                                    break;
                                }
                                Some(_) => {}
                                None => {
                                    next.insert(*v, candidate[col].clone());
                                }
                            }
                        }
                    }
                    if !ok {
                        continue;
                    }
                    if let Some(mut rest) =
                        self.search_body(body, idx + 1, next, depth, deferred)
                    {
                        rest.insert(0, Witness::Positive(rel.clone(), candidate));
                        return Some(rest);
                    }
                }
                None
            }
            BodyPredicate::Atom {
                rel,
                polarity: Polarity::Negative,
                terms,
                ..
            } => {
                let mut row = Vec::with_capacity(terms.len());
                for term in terms {
                    match term {
                        BodyTerm::Lit(v) => row.push(v.clone()),
                        BodyTerm::Var(v) => row.push(bindings.get(v)?.clone()),
                        BodyTerm::Wild => return None,
                    }
                }
                let key = &row[..rel.key_arity()];
                let present = self
                    .model
                    .relations
                    .get(rel)
                    .is_some_and(|rows| rows.contains_key(key));
                if present {
                    return None;
                }
                let mut rest = self.search_body(body, idx + 1, bindings, depth, deferred)?;
                rest.insert(0, Witness::Negative(rel.clone(), row));
                Some(rest)
            }
            BodyPredicate::Guard(f, terms) => {
                let mut vals = Vec::with_capacity(terms.len());
                for term in terms {
                    match term {
                        BodyTerm::Lit(v) => vals.push(v.clone()),
                        BodyTerm::Var(v) => vals.push(bindings.get(v)?.clone()),
                        BodyTerm::Wild => return None,
                    }
                }
                if !f.test(&vals) {
                    return None;
                }
                self.search_body(body, idx + 1, bindings, depth, deferred)
            }
            BodyPredicate::Functional { .. } => {
                unreachable!("bug: functional atom survived provenance augmentation")
            }
        }
    }

    /// Witness rows of `rel` matching the selected column values, with
    /// their depths. Builds the `(predicate, columns)` index on first use.
    fn lookup(&self, rel: &RelSym, sel_cols: &[usize], sel_vals: &[Boxed]) -> Vec<(Vec<Boxed>, i64)> {
        let mut lazy = self.lazy.lock();
        let index = lazy
            .entry((rel.pred.id, sel_cols.to_vec()))
            .or_insert_with(|| {
                let mut index: LazyIndex = HashMap::new();
                let Some(rows) = self.model.relations.get(rel) else {
                    return index;
                };
                let anns = self.ann.get(rel);
                for (key, payload) in rows {
                    let mut row = key.clone();
                    if rel.den.is_lattice() {
                        row.push(payload.clone());
                    }
                    let depth = anns
                        .and_then(|a| a.get(key))
                        .map(|&(d, _)| d)
                        .unwrap_or(0);
                    let sel: Vec<Boxed> =
                        sel_cols.iter().map(|&c| row[c].clone()).collect();
                    index.entry(sel).or_default().push((row, depth));
                }
                index
            });
        index.get(sel_vals).cloned().unwrap_or_default()
    }
}

enum Witness {
    Positive(RelSym, Vec<Boxed>),
    Negative(RelSym, Vec<Boxed>),
}
