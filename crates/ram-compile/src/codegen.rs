//! Semi-naive code generation
//!
//! Lowers stratified Datalog rules into high-level RAM. Every stratum
//! produces an initial phase that joins all positive atoms against the
//! `Full` relations and projects into `New`, followed by a fixpoint loop in
//! which each rule is copied once per recursive body atom, that copy reading
//! the atom from `Delta` and everything else from `Full`. After each round
//! the loop merges `New` into `Full`, swaps `New` with `Delta` and purges
//! `New`. Independent strata of one pseudo-stratum run under `Par`.
//!
//! The generator keeps rule compilation simple: every scan is emitted as a
//! `Search` and every constraint as a guard in one innermost `If`. The
//! hoisting phase later folds equality guards into index queries.

use crate::unify::Positions;
use datalog_ast::{
    BodyPredicate, BodyTerm, Constraint, Fixity, HeadTerm, Polarity, RamSym, RelSym, RowVar,
    VarSym,
};
use datalog_stratify::Stratification;
use ram_ir::{BoolExp, RamStmt, RamTerm, RelOp};
use std::collections::HashMap;

/// Shared state threaded through the compiler phases.
pub struct Context {
    pub positions: Positions,
    /// Unified positions of each functional's output columns.
    pub func_out_pos: HashMap<RowVar, Vec<usize>>,
    /// Row variables allocated so far; lowering sizes its registers by this.
    pub rv_count: u32,
    pub use_provenance: bool,
}

impl Context {
    pub fn new(positions: Positions, use_provenance: bool) -> Self {
        Context {
            positions,
            func_out_pos: HashMap::new(),
            rv_count: 0,
            use_provenance,
        }
    }

    fn fresh_rv(&mut self) -> RowVar {
        let rv = RowVar(self.rv_count);
        self.rv_count += 1;
        rv
    }
}

/// Compile the rules of a program into a RAM statement.
///
/// `rules` must be the full rule list; rule numbers recorded in projections
/// index into it.
pub fn compile_program(
    rules: &[Constraint],
    strat: &Stratification,
    ctx: &mut Context,
) -> RamStmt {
    let mut pseudo_stmts = Vec::new();
    for (pi, pseudo) in strat.pseudo_strata.iter().enumerate() {
        let mut stratum_stmts = Vec::new();
        for (si, _preds) in pseudo.iter().enumerate() {
            // Rules whose head lives in this stratum, in program order.
            let stratum_rules: Vec<(usize, &Constraint)> = rules
                .iter()
                .enumerate()
                .filter(|(_, r)| strat.placement_of(&r.head.rel.pred) == Some((pi, si)))
                .collect();
            if stratum_rules.is_empty() {
                continue;
            }
            stratum_stmts.push(compile_stratum(&stratum_rules, ctx));
        }
        match stratum_stmts.len() {
            0 => {}
            1 => pseudo_stmts.push(stratum_stmts.pop().expect("bug: singleton stratum")),
            _ => pseudo_stmts.push(RamStmt::Par(stratum_stmts)),
        }
    }
    RamStmt::seq(pseudo_stmts)
}

fn compile_stratum(stratum_rules: &[(usize, &Constraint)], ctx: &mut Context) -> RamStmt {
    // Relations derived here, deduplicated and ordered for determinism.
    let mut derived: Vec<RelSym> = Vec::new();
    for (_, rule) in stratum_rules {
        if !derived.contains(&rule.head.rel) {
            derived.push(rule.head.rel.clone());
        }
    }
    derived.sort();

    let mut stmts = Vec::new();

    // Initial step: all positive atoms read Full.
    for &(rule_no, rule) in stratum_rules {
        if let Some(op) = compile_rule(rule, rule_no, None, ctx) {
            stmts.push(RamStmt::Comment(describe_rule(rule_no, rule)));
            stmts.push(RamStmt::Insert(op));
        }
    }
    for d in &derived {
        stmts.push(RamStmt::MergeInto {
            src: RamSym::new_ver(d.clone()),
            dst: RamSym::full(d.clone()),
        });
        stmts.push(RamStmt::MergeInto {
            src: RamSym::new_ver(d.clone()),
            dst: RamSym::delta(d.clone()),
        });
        stmts.push(RamStmt::Purge(RamSym::new_ver(d.clone())));
    }

    // Incremental step: one copy per recursive body atom, reading Delta.
    let mut body = Vec::new();
    for &(rule_no, rule) in stratum_rules {
        for (j, pred) in rule.body.iter().enumerate() {
            let recursive = matches!(
                pred,
                BodyPredicate::Atom {
                    rel,
                    polarity: Polarity::Positive,
                    fixity: Fixity::Loose,
                    ..
                } if derived.contains(rel)
            );
            if !recursive {
                continue;
            }
            if let Some(op) = compile_rule(rule, rule_no, Some(j), ctx) {
                body.push(RamStmt::Comment(format!(
                    "{} (Δ on atom {})",
                    describe_rule(rule_no, rule),
                    j
                )));
                body.push(RamStmt::Insert(op));
            }
        }
    }
    for d in &derived {
        body.push(RamStmt::MergeInto {
            src: RamSym::new_ver(d.clone()),
            dst: RamSym::full(d.clone()),
        });
        body.push(RamStmt::Swap {
            a: RamSym::new_ver(d.clone()),
            b: RamSym::delta(d.clone()),
        });
        body.push(RamStmt::Purge(RamSym::new_ver(d.clone())));
    }

    let conds = derived
        .iter()
        .map(|d| BoolExp::IsEmpty(RamSym::delta(d.clone())))
        .collect();
    stmts.push(RamStmt::Until {
        conds,
        body: Box::new(RamStmt::seq(body)),
    });

    RamStmt::seq(stmts)
}

fn describe_rule(rule_no: usize, rule: &Constraint) -> String {
    let body: Vec<String> = rule
        .body
        .iter()
        .map(|p| match p {
            BodyPredicate::Atom {
                rel,
                polarity: Polarity::Positive,
                ..
            } => rel.pred.name.to_string(),
            BodyPredicate::Atom { rel, .. } => format!("not {}", rel.pred.name),
            BodyPredicate::Guard(f, _) => format!("{:?}", f),
            BodyPredicate::Functional { gen, .. } => format!("{:?}", gen),
        })
        .collect();
    format!(
        "rule #{}: {} :- {}",
        rule_no,
        rule.head.rel.pred.name,
        body.join(", ")
    )
}

/// How a rule variable is currently addressable.
enum Binding {
    /// Bound to a key attribute of a scanned tuple.
    Key(RowVar, usize),
    /// Bound to the lattice payload(s) of one or more scanned tuples.
    Lat(Vec<RowVar>, RelSym),
}

struct RuleState {
    bindings: HashMap<VarSym, Binding>,
    guards: Vec<BoolExp>,
    scans: Vec<Scan>,
}

enum Scan {
    Atom {
        rv: RowVar,
        sym: RamSym,
    },
    Func {
        rv: RowVar,
        gen: datalog_ast::NamedGen,
        args: Vec<RamTerm>,
        out_arity: usize,
    },
}

impl RuleState {
    /// A term usable wherever a boxed or key value is expected.
    fn resolve(&self, term: &BodyTerm, rule_no: usize) -> RamTerm {
        match term {
            BodyTerm::Lit(v) => RamTerm::Lit(v.clone()),
            BodyTerm::Var(v) => self.resolve_var(*v, rule_no),
            BodyTerm::Wild => panic!(
                "bug: wildcard where a bound term is required in rule #{}",
                rule_no
            ),
        }
    }

    fn resolve_var(&self, v: VarSym, rule_no: usize) -> RamTerm {
        match self.bindings.get(&v) {
            Some(Binding::Key(rv, col)) => RamTerm::RowLoad(*rv, *col),
            Some(Binding::Lat(rvs, _)) => RamTerm::Meet(rvs.clone()),
            None => panic!("bug: unbound variable {} in rule #{}", v, rule_no),
        }
    }
}

/// Compile one rule into a relation operation. `delta` selects the body
/// atom read from `Delta`; `None` compiles the initial (all-`Full`) step.
/// Returns `None` when a constant guard makes the rule unsatisfiable.
fn compile_rule(
    rule: &Constraint,
    rule_no: usize,
    delta: Option<usize>,
    ctx: &mut Context,
) -> Option<RelOp> {
    let mut st = RuleState {
        bindings: HashMap::new(),
        guards: Vec::new(),
        scans: Vec::new(),
    };

    for (j, pred) in rule.body.iter().enumerate() {
        match pred {
            BodyPredicate::Atom {
                rel,
                polarity: Polarity::Positive,
                terms,
                ..
            } => {
                let rv = ctx.fresh_rv();
                let sym = if delta == Some(j) {
                    RamSym::delta(rel.clone())
                } else {
                    RamSym::full(rel.clone())
                };
                compile_positive_terms(&mut st, rv, rel, terms, rule_no);
                st.scans.push(Scan::Atom { rv, sym });
            }
            BodyPredicate::Atom {
                rel,
                polarity: Polarity::Negative,
                terms,
                ..
            } => {
                let mut ts: Vec<RamTerm> = terms
                    .iter()
                    .take(rel.key_arity())
                    .map(|t| st.resolve(t, rule_no))
                    .collect();
                if rel.den.is_lattice() {
                    ts.push(st.resolve(&terms[rel.key_arity()], rule_no));
                }
                st.guards
                    .push(BoolExp::NotMemberOf(ts, RamSym::full(rel.clone())));
            }
            BodyPredicate::Guard(f, terms) => {
                if terms.is_empty() {
                    // Constant guard: decide now; an unsatisfiable rule is
                    // elided entirely.
                    if !f.test(&[]) {
                        return None;
                    }
                    continue;
                }
                let args: Vec<RamTerm> = terms.iter().map(|t| st.resolve(t, rule_no)).collect();
                st.guards.push(BoolExp::Guard(f.clone(), args));
            }
            BodyPredicate::Functional { outs, gen, ins } => {
                let rv = ctx.fresh_rv();
                let args: Vec<RamTerm> = ins
                    .iter()
                    .map(|v| st.resolve_var(*v, rule_no))
                    .collect();
                for (k, out) in outs.iter().enumerate() {
                    let prior = match st.bindings.get(out) {
                        None => None,
                        Some(Binding::Key(rv0, c0)) => Some((*rv0, *c0)),
                        Some(Binding::Lat(..)) => panic!(
                            "bug: lattice value {} rebound by a functional in rule #{}",
                            out, rule_no
                        ),
                    };
                    match prior {
                        None => {
                            st.bindings.insert(*out, Binding::Key(rv, k));
                        }
                        Some((rv0, c0)) => st.guards.push(BoolExp::Eq(
                            RamTerm::RowLoad(rv, k),
                            RamTerm::RowLoad(rv0, c0),
                        )),
                    }
                }
                let out_positions: Vec<usize> = outs
                    .iter()
                    .map(|v| ctx.positions.var(rule_no, *v))
                    .collect();
                ctx.func_out_pos.insert(rv, out_positions);
                st.scans.push(Scan::Func {
                    rv,
                    gen: gen.clone(),
                    args,
                    out_arity: outs.len(),
                });
            }
        }
    }

    // A lattice value met from several atoms can be bottom; guard it.
    let mut meet_guards = Vec::new();
    for binding in st.bindings.values() {
        if let Binding::Lat(rvs, rel) = binding {
            if rvs.len() > 1 {
                meet_guards.push(BoolExp::NotBot {
                    rel: RamSym::full(rel.clone()),
                    value: RamTerm::Meet(rvs.clone()),
                });
            }
        }
    }
    st.guards.extend(meet_guards);

    // Head projection.
    let head = &rule.head;
    let mut terms: Vec<RamTerm> = Vec::with_capacity(head.terms.len());
    for term in head.terms.iter().take(head.rel.key_arity()) {
        terms.push(compile_head_term(&st, term, rule_no));
    }
    if head.rel.den.is_lattice() {
        terms.push(compile_head_term(&st, &head.terms[head.rel.key_arity()], rule_no));
    }

    // Only genuinely new tuples (or lattice values not yet subsumed) may
    // reach `New`; without this test the delta never drains.
    st.guards.push(BoolExp::NotMemberOf(
        terms.clone(),
        RamSym::full(head.rel.clone()),
    ));

    let project = RelOp::Project {
        terms,
        rel: RamSym::new_ver(head.rel.clone()),
        rule: rule_no,
    };

    let mut op = RelOp::guarded(std::mem::take(&mut st.guards), project);
    for scan in st.scans.into_iter().rev() {
        op = match scan {
            Scan::Atom { rv, sym } => RelOp::Search {
                rv,
                rel: sym,
                body: Box::new(op),
            },
            Scan::Func {
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
    Some(op)
}

fn compile_positive_terms(
    st: &mut RuleState,
    rv: RowVar,
    rel: &RelSym,
    terms: &[BodyTerm],
    rule_no: usize,
) {
    assert_eq!(
        terms.len(),
        rel.arity,
        "bug: atom of {} has arity {} in rule #{}",
        rel,
        terms.len(),
        rule_no
    );
    for (col, term) in terms.iter().take(rel.key_arity()).enumerate() {
        match term {
            BodyTerm::Wild => {}
            BodyTerm::Lit(v) => st.guards.push(BoolExp::Eq(
                RamTerm::RowLoad(rv, col),
                RamTerm::Lit(v.clone()),
            )),
            BodyTerm::Var(v) => {
                let prior = match st.bindings.get(v) {
                    None => None,
                    Some(Binding::Key(rv0, c0)) => Some((*rv0, *c0)),
                    Some(Binding::Lat(..)) => panic!(
                        "bug: lattice value {} flows into a key attribute in rule #{}",
                        v, rule_no
                    ),
                };
                match prior {
                    None => {
                        st.bindings.insert(*v, Binding::Key(rv, col));
                    }
                    Some((rv0, c0)) => st.guards.push(BoolExp::Eq(
                        RamTerm::RowLoad(rv, col),
                        RamTerm::RowLoad(rv0, c0),
                    )),
                }
            }
        }
    }
    if rel.den.is_lattice() {
        match &terms[rel.key_arity()] {
            BodyTerm::Wild => {}
            BodyTerm::Lit(v) => st.guards.push(BoolExp::Leq {
                rel: RamSym::full(rel.clone()),
                lower: RamTerm::Lit(v.clone()),
                value: RamTerm::Meet(vec![rv]),
            }),
            BodyTerm::Var(v) => {
                if !st.bindings.contains_key(v) {
                    st.bindings
                        .insert(*v, Binding::Lat(vec![rv], rel.clone()));
                } else {
                    let prior_key = match st.bindings.get_mut(v) {
                        Some(Binding::Lat(rvs, _)) => {
                            rvs.push(rv);
                            None
                        }
                        Some(Binding::Key(rv0, c0)) => Some((*rv0, *c0)),
                        None => unreachable!(),
                    };
                    if let Some((rv0, c0)) = prior_key {
                        st.guards.push(BoolExp::Leq {
                            rel: RamSym::full(rel.clone()),
                            lower: RamTerm::RowLoad(rv0, c0),
                            value: RamTerm::Meet(vec![rv]),
                        });
                    }
                }
            }
        }
    }
}

fn compile_head_term(st: &RuleState, term: &HeadTerm, rule_no: usize) -> RamTerm {
    match term {
        HeadTerm::Var(v) => st.resolve_var(*v, rule_no),
        HeadTerm::Lit(v) => RamTerm::Lit(v.clone()),
        HeadTerm::App(f, args) => RamTerm::App(
            f.clone(),
            args.iter().map(|v| st.resolve_var(*v, rule_no)).collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unify::unify_positions;
    use datalog_ast::{Denotation, HeadAtom, PredSym};
    use datalog_stratify::stratify;

    fn rel(name: &str, id: u64, arity: usize) -> RelSym {
        RelSym::new(PredSym::new(name, id), arity, Denotation::Relational)
    }

    fn tc_rules() -> Vec<Constraint> {
        let edge = rel("Edge", 0, 2);
        let path = rel("Path", 1, 2);
        vec![
            Constraint::rule(
                HeadAtom::new(path.clone(), vec![HeadTerm::var("x"), HeadTerm::var("y")]),
                vec![BodyPredicate::atom(
                    edge.clone(),
                    vec![BodyTerm::var("x"), BodyTerm::var("y")],
                )],
            ),
            Constraint::rule(
                HeadAtom::new(path.clone(), vec![HeadTerm::var("x"), HeadTerm::var("z")]),
                vec![
                    BodyPredicate::atom(path.clone(), vec![BodyTerm::var("x"), BodyTerm::var("y")]),
                    BodyPredicate::atom(edge.clone(), vec![BodyTerm::var("y"), BodyTerm::var("z")]),
                ],
            ),
        ]
    }

    fn compile(rules: &[Constraint]) -> (RamStmt, Context) {
        let strat = stratify(rules).unwrap();
        let mut ctx = Context::new(unify_positions(rules), false);
        let stmt = compile_program(rules, &strat, &mut ctx);
        (stmt, ctx)
    }

    fn count_inserts(stmt: &RamStmt) -> usize {
        match stmt {
            RamStmt::Insert(_) => 1,
            RamStmt::Seq(ss) | RamStmt::Par(ss) => ss.iter().map(count_inserts).sum(),
            RamStmt::Until { body, .. } => count_inserts(body),
            _ => 0,
        }
    }

    #[test]
    fn test_transitive_closure_shape() {
        let rules = tc_rules();
        let (stmt, ctx) = compile(&rules);
        // Phase A: two rules. Phase B: one recursive atom (Path in rule 1).
        assert_eq!(count_inserts(&stmt), 3);
        // Five atom scans allocate five row variables (1 + 2 + 2).
        assert_eq!(ctx.rv_count, 5);
        let text = format!("{}", stmt);
        assert!(text.contains("until"));
        assert!(text.contains("ΔPath"));
        assert!(text.contains("swap"));
    }

    #[test]
    fn test_constant_false_guard_elides_rule() {
        let a = rel("A", 0, 1);
        let b = rel("B", 1, 1);
        let never = datalog_ast::NamedPred::new("never", std::sync::Arc::new(|_: &[datalog_ast::Boxed]| false));
        let rules = vec![Constraint::rule(
            HeadAtom::new(b.clone(), vec![HeadTerm::var("x")]),
            vec![
                BodyPredicate::atom(a.clone(), vec![BodyTerm::var("x")]),
                BodyPredicate::Guard(never, vec![]),
            ],
        )];
        let (stmt, _) = compile(&rules);
        assert_eq!(count_inserts(&stmt), 0);
    }

    #[test]
    fn test_negative_atom_becomes_not_member_guard() {
        let person = rel("Person", 0, 1);
        let has_parent = rel("HasParent", 1, 1);
        let orphan = rel("Orphan", 2, 1);
        let rules = vec![
            Constraint::rule(
                HeadAtom::new(has_parent.clone(), vec![HeadTerm::var("c")]),
                vec![BodyPredicate::atom(person.clone(), vec![BodyTerm::var("c")])],
            ),
            Constraint::rule(
                HeadAtom::new(orphan.clone(), vec![HeadTerm::var("c")]),
                vec![
                    BodyPredicate::atom(person.clone(), vec![BodyTerm::var("c")]),
                    BodyPredicate::not_atom(has_parent.clone(), vec![BodyTerm::var("c")]),
                ],
            ),
        ];
        let (stmt, _) = compile(&rules);
        let text = format!("{}", stmt);
        assert!(text.contains("∉ HasParent"));
    }
}
