//! The solve pipeline
//!
//! Orchestrates the phases end to end: decompose the Datalog value into
//! rules and seed facts, compute unified positions, stratify, generate and
//! optimize RAM, lower, seed the machine, run it to fixpoint and marshal
//! the `Full` relations back into a model. Indexes and environments live
//! and die inside one call; only the model (and, with provenance, the
//! annotations) leave it.

use crate::error::FixpointError;
use crate::options::Options;
use datalog_ast::{
    Boxed, Constraint, Datalog, Denotation, HeadTerm, Model, PredicateRegistry, RelSym, Version,
};
use datalog_stratify::stratify;
use log::debug;
use ram_compile::{
    augment, bernoulli_sample, compile_program, hoist, instrument, lower, reorder, select_indexes,
    simplify, unify_positions, Context, JoinProfile,
};
use ram_interp::Machine;
use ram_ir::ExecProgram;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;
use tuple_store::ValueStore;

/// One seed fact: key attributes and the payload (lattice value or
/// `NoValue`).
#[derive(Debug, Clone)]
pub(crate) struct FactData {
    pub key: Vec<Boxed>,
    pub payload: Boxed,
}

/// Result of one solve, before it is shaped into `Model` or `Provenance`.
pub(crate) struct SolveOutput {
    pub model: Model,
    /// `(depth, rule)` per fact key, present when provenance ran.
    pub ann: Option<BTreeMap<RelSym, BTreeMap<Vec<Boxed>, (i64, i64)>>>,
    pub rules: Vec<Constraint>,
}

/// Split a Datalog value into rules and grouped seed facts.
pub(crate) fn decompose(
    d: &Datalog,
) -> Result<(Vec<Constraint>, BTreeMap<RelSym, Vec<FactData>>), FixpointError> {
    let mut rules = Vec::new();
    let mut facts: BTreeMap<RelSym, Vec<FactData>> = BTreeMap::new();

    let mut add_program = |p: &datalog_ast::Program,
                           facts: &mut BTreeMap<RelSym, Vec<FactData>>,
                           rules: &mut Vec<Constraint>|
     -> Result<(), FixpointError> {
        rules.extend(p.rules.iter().cloned());
        for fact in &p.facts {
            let rel = &fact.head.rel;
            if fact.head.terms.len() != rel.arity {
                return Err(FixpointError::InvalidInput(format!(
                    "fact of {} has {} terms",
                    rel,
                    fact.head.terms.len()
                )));
            }
            let mut row = Vec::with_capacity(rel.arity);
            for term in &fact.head.terms {
                match term {
                    HeadTerm::Lit(v) => row.push(v.clone()),
                    other => {
                        return Err(FixpointError::InvalidInput(format!(
                            "fact of {} has non-literal term {:?}",
                            rel, other
                        )))
                    }
                }
            }
            let payload = if rel.den.is_lattice() {
                row.pop().expect("bug: lattice fact with no value column")
            } else {
                Boxed::NoValue
            };
            facts
                .entry(rel.clone())
                .or_default()
                .push(FactData { key: row, payload });
        }
        Ok(())
    };

    let mut add_model = |m: &Model, facts: &mut BTreeMap<RelSym, Vec<FactData>>| {
        for (rel, rows) in &m.relations {
            let bucket = facts.entry(rel.clone()).or_default();
            for (key, payload) in rows {
                bucket.push(FactData {
                    key: key.clone(),
                    payload: payload.clone(),
                });
            }
        }
    };

    match d {
        Datalog::Program(p) => add_program(p, &mut facts, &mut rules)?,
        Datalog::Model(m) => add_model(m, &mut facts),
        Datalog::Join(m, p) => {
            add_model(m, &mut facts);
            add_program(p, &mut facts, &mut rules)?;
        }
    }
    Ok((rules, facts))
}

fn full_slot(prog: &ExecProgram, rel: &RelSym) -> usize {
    prog.relations
        .iter()
        .position(|d| d.sym.ver == Version::Full && d.sym.rel == *rel)
        .unwrap_or_else(|| panic!("bug: no Full store for {}", rel))
}

/// Encode and insert one relation's seed facts. Provenance columns are
/// depth 0 and rule −1; lattice bottoms are never materialized.
fn seed_facts(
    machine: &Machine,
    prog: &ExecProgram,
    rel: &RelSym,
    rows: &[FactData],
    values: &ValueStore,
    ctx: &Context,
    with_prov: bool,
) {
    let slot = full_slot(prog, rel);
    let positions: Vec<usize> = (0..rel.key_arity())
        .map(|col| ctx.positions.column(rel.pred.id, col))
        .collect();
    let keys: Vec<Vec<Boxed>> = rows.iter().map(|f| f.key.clone()).collect();
    let tuples = values.unbox_rows(&keys, &positions);
    for (tuple, fact) in tuples.into_iter().zip(rows) {
        if let Denotation::Latticenal(ops) = &rel.den {
            if ops.is_bot(&fact.payload) {
                continue;
            }
        }
        let mut tuple = tuple;
        if with_prov {
            tuple.push(0);
            tuple.push(-1);
        }
        machine.seed(slot, tuple, fact.payload.clone());
    }
}

fn dump(opts: &Options, phase: &str, text: &str) {
    if !opts.enable_debugging {
        return;
    }
    let write = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&opts.debug_file_name)
        .and_then(|mut f| writeln!(f, "== {} ==\n{}", phase, text));
    if let Err(e) = write {
        log::warn!("could not write debug dump {}: {}", opts.debug_file_name, e);
    }
}

/// Run the whole pipeline.
pub(crate) fn run_solve(d: &Datalog, opts: &Options) -> Result<SolveOutput, FixpointError> {
    let (rules, facts) = decompose(d)?;

    // Registry lifecycle: observe every predicate so renames and derived
    // variants stay unique.
    let mut registry = PredicateRegistry::new();
    let mut all_rels: Vec<RelSym> = Vec::new();
    let mut note = |rel: &RelSym, all: &mut Vec<RelSym>, reg: &mut PredicateRegistry| {
        reg.observe(rel.pred);
        if !all.contains(rel) {
            all.push(rel.clone());
        }
    };
    for rule in &rules {
        note(&rule.head.rel, &mut all_rels, &mut registry);
        for pred in &rule.body {
            if let Some(rel) = pred.rel() {
                note(rel, &mut all_rels, &mut registry);
            }
        }
    }
    for rel in facts.keys() {
        note(rel, &mut all_rels, &mut registry);
    }
    all_rels.sort();
    debug!(
        "solving: {} rules, {} relations, {} predicate ids",
        rules.len(),
        all_rels.len(),
        registry.id_count()
    );

    // Unified positions come from the rules plus one synthetic fact per
    // seeded relation, so EDB-only predicates own positions too.
    let mut unify_input = rules.clone();
    for (rel, rows) in &facts {
        if let Some(first) = rows.first() {
            let mut terms: Vec<HeadTerm> =
                first.key.iter().map(|v| HeadTerm::Lit(v.clone())).collect();
            if rel.den.is_lattice() {
                terms.push(HeadTerm::Lit(first.payload.clone()));
            }
            unify_input.push(Constraint::fact(datalog_ast::HeadAtom::new(
                rel.clone(),
                terms,
            )));
        }
    }
    let positions = unify_positions(&unify_input);
    let values = Arc::new(ValueStore::new(positions.count()));

    let strat = stratify(&rules)?;
    let mut ctx = Context::new(positions, false);
    let mut stmt = compile_program(&rules, &strat, &mut ctx);
    dump(opts, "compiled", &format!("{}", stmt));

    stmt = simplify(stmt);
    dump(opts, "simplified", &format!("{}", stmt));

    stmt = hoist(stmt);
    dump(opts, "hoisted", &format!("{}", stmt));

    let mut catalogue = select_indexes(&stmt, &all_rels);

    // Join optimization runs on a sampled profile when the input is big
    // enough to make ordering matter.
    let total_facts: usize = facts.values().map(|v| v.len()).sum();
    if !opts.disable_join_optimizer && total_facts >= opts.profiler_minimum_facts {
        let (probe_stmt, probes) = instrument(&stmt);
        let probe_prog = lower(&probe_stmt, &all_rels, &catalogue, &ctx, &values);
        let machine = Machine::new(&probe_prog, values.clone(), opts.index_arity, 0);
        let mut rng = StdRng::seed_from_u64(opts.profiler_seed);
        for (rel, rows) in &facts {
            let sample = bernoulli_sample(
                rows,
                opts.profiler_discrimination,
                opts.profiler_fact_lower_bound,
                &mut rng,
            );
            seed_facts(&machine, &probe_prog, rel, &sample, &values, &ctx, false);
        }
        machine.run(&probe_prog);
        let samples: Vec<Vec<(u64, u64)>> = (0..probes.len())
            .map(|buf| machine.profile_samples(buf))
            .collect();
        let profile = JoinProfile::from_samples(&probes, samples);
        stmt = reorder(stmt, &profile);
        dump(opts, "reordered", &format!("{}", stmt));
        catalogue = select_indexes(&stmt, &all_rels);
    }

    if opts.use_provenance {
        stmt = augment(stmt)?;
        ctx.use_provenance = true;
        dump(opts, "provenance", &format!("{}", stmt));
        catalogue = select_indexes(&stmt, &all_rels);
    }

    let prog = lower(&stmt, &all_rels, &catalogue, &ctx, &values);
    dump(opts, "lowered", &format!("{}", prog));

    let machine = Machine::new(&prog, values.clone(), opts.index_arity, opts.par_level);
    for (rel, rows) in &facts {
        seed_facts(&machine, &prog, rel, rows, &values, &ctx, ctx.use_provenance);
    }
    let stats = machine.run(&prog);
    debug!(
        "fixpoint reached after {} rounds, {} facts inserted",
        stats.iterations, stats.facts_inserted
    );

    // Marshal the Full relations back into boxed rows.
    let mut model = Model::new();
    let mut ann: BTreeMap<RelSym, BTreeMap<Vec<Boxed>, (i64, i64)>> = BTreeMap::new();
    for rel in &all_rels {
        let slot = full_slot(&prog, rel);
        let key_arity = rel.key_arity();
        let positions: Vec<usize> = (0..key_arity)
            .map(|col| ctx.positions.column(rel.pred.id, col))
            .collect();
        model.relations.entry(rel.clone()).or_default();
        machine.relation(slot).primary().for_each(|tuple, payload| {
            let key: Vec<Boxed> = positions
                .iter()
                .enumerate()
                .map(|(col, &pos)| values.box_with(tuple[col], pos))
                .collect();
            if ctx.use_provenance {
                ann.entry(rel.clone())
                    .or_default()
                    .insert(key.clone(), (tuple[key_arity], tuple[key_arity + 1]));
            }
            model.insert(rel, key, payload.clone());
        });
    }

    if opts.enable_debug_print_facts {
        let mut text = String::new();
        for (rel, _) in &model.relations {
            text.push_str(&format!("{}\n", rel));
            for row in model.rows_of(rel) {
                let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                text.push_str(&format!("  ({})\n", cells.join(", ")));
            }
        }
        dump(opts, "facts", &text);
    }

    Ok(SolveOutput {
        model,
        ann: ctx.use_provenance.then_some(ann),
        rules,
    })
}
