//! Execution of lowered RAM programs
//!
//! The machine owns one relation store per lowered relation declaration and
//! executes statements against per-worker environments. Indexes are shared
//! across workers and synchronize internally; the environment arrays are
//! cloned at every worker-spawn point, so a worker never observes another
//! worker's bindings.

use datalog_ast::{Boxed, Denotation};
use log::trace;
use parking_lot::Mutex;
use ram_ir::{
    ExecBool, ExecOp, ExecProgram, ExecStmt, KeyTerm, LatTerm, RelDecl, Write,
};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tuple_store::{OrderedIndex, Tuple, ValueStore};

/// One relation: its declaration and its physical indexes.
#[derive(Debug)]
pub struct RelStore {
    pub decl: RelDecl,
    pub indexes: Vec<OrderedIndex>,
}

impl RelStore {
    fn build(decl: RelDecl, chunk: usize) -> Self {
        assert!(!decl.orders.is_empty(), "bug: relation {} has no index", decl.sym);
        let indexes = decl
            .orders
            .iter()
            .map(|order| OrderedIndex::new(order.clone(), chunk))
            .collect();
        RelStore { decl, indexes }
    }

    pub fn primary(&self) -> &OrderedIndex {
        &self.indexes[0]
    }

    /// Insert a tuple into every index; returns whether the fact is new
    /// (or, for lattices, whether the joined value changed).
    pub fn insert(&self, tuple: Tuple, payload: Boxed) -> bool {
        match &self.decl.den {
            Denotation::Relational => {
                let fresh = self.primary().put(tuple.clone(), payload.clone());
                if fresh {
                    for index in &self.indexes[1..] {
                        index.put(tuple.clone(), payload.clone());
                    }
                }
                fresh
            }
            Denotation::Latticenal(ops) => {
                let lub = |a: &Boxed, b: &Boxed| (ops.lub)(a, b);
                let changed = self.primary().put_with(lub, tuple.clone(), payload.clone());
                if changed {
                    for index in &self.indexes[1..] {
                        index.put_with(lub, tuple.clone(), payload.clone());
                    }
                }
                changed
            }
        }
    }
}

/// Search-tuple bounds and active bindings for one worker.
#[derive(Debug, Clone)]
pub struct Env {
    pub min: Vec<Vec<i64>>,
    pub max: Vec<Vec<i64>>,
    pub tuple: Vec<Tuple>,
    pub lat: Vec<Boxed>,
}

impl Env {
    fn new(prog: &ExecProgram) -> Self {
        let min = prog
            .rv_arities
            .iter()
            .map(|&a| vec![i64::MIN; a])
            .collect();
        let max = prog
            .rv_arities
            .iter()
            .map(|&a| vec![i64::MAX; a])
            .collect();
        let mut env = Env {
            min,
            max,
            tuple: prog.rv_arities.iter().map(|&a| vec![0; a]).collect(),
            lat: vec![Boxed::NoValue; prog.rv_arities.len()],
        };
        for cw in &prog.const_writes {
            env.min[cw.rv][cw.col] = cw.value;
            env.max[cw.rv][cw.col] = cw.value;
        }
        env
    }

    #[inline]
    fn bind(&mut self, rv: usize, tuple: &Tuple, payload: &Boxed, writes: &[Write]) {
        self.tuple[rv].clone_from(tuple);
        self.lat[rv] = payload.clone();
        for w in writes {
            let v = tuple[w.src_col];
            self.min[w.dst_rv][w.dst_col] = v;
            self.max[w.dst_rv][w.dst_col] = v;
        }
    }
}

/// Statistics of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Fixpoint rounds across all `Until` loops.
    pub iterations: usize,
    /// Tuples that entered a relation as new (or with a changed value).
    pub facts_inserted: usize,
}

/// The interpreter.
pub struct Machine {
    rels: Vec<RelStore>,
    values: Arc<ValueStore>,
    /// Join-size samples per profile buffer, one entry per fixpoint round.
    profile: Vec<Mutex<Vec<(u64, u64)>>>,
    par_level: usize,
    iterations: AtomicUsize,
    inserted: AtomicUsize,
}

impl Machine {
    /// Build the machine for a program. `index_arity` sizes the backing
    /// tree fan-out; `par_level` caps how many enclosing searches may still
    /// split work across the pool.
    pub fn new(
        prog: &ExecProgram,
        values: Arc<ValueStore>,
        index_arity: usize,
        par_level: usize,
    ) -> Self {
        let rels = prog
            .relations
            .iter()
            .map(|decl| RelStore::build(decl.clone(), index_arity))
            .collect();
        Machine {
            rels,
            values,
            profile: (0..prog.profile_bufs).map(|_| Mutex::new(Vec::new())).collect(),
            par_level,
            iterations: AtomicUsize::new(0),
            inserted: AtomicUsize::new(0),
        }
    }

    pub fn relations(&self) -> &[RelStore] {
        &self.rels
    }

    pub fn relation(&self, slot: usize) -> &RelStore {
        &self.rels[slot]
    }

    /// Seed a relation store directly, bypassing the program.
    pub fn seed(&self, slot: usize, tuple: Tuple, payload: Boxed) {
        self.rels[slot].insert(tuple, payload);
    }

    /// Collected join-size samples of one profile buffer; empty when the
    /// probe was never placed or never fired.
    pub fn profile_samples(&self, buf: usize) -> Vec<(u64, u64)> {
        self.profile
            .get(buf)
            .map(|samples| samples.lock().clone())
            .unwrap_or_default()
    }

    /// Execute the program to completion.
    pub fn run(&self, prog: &ExecProgram) -> RunStats {
        let mut env = Env::new(prog);
        self.exec_stmt(&prog.stmt, &mut env, self.par_level);
        RunStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            facts_inserted: self.inserted.load(Ordering::Relaxed),
        }
    }

    fn exec_stmt(&self, stmt: &ExecStmt, env: &mut Env, budget: usize) {
        match stmt {
            ExecStmt::Insert(op) => self.exec_op(op, env, budget),
            ExecStmt::MergeInto { src, dst } => {
                let src = &self.rels[*src];
                let dst = &self.rels[*dst];
                match &dst.decl.den {
                    Denotation::Relational => {
                        for index in &dst.indexes {
                            src.primary().merge_into(index);
                        }
                    }
                    Denotation::Latticenal(ops) => {
                        for index in &dst.indexes {
                            src.primary().merge_with(|a, b| (ops.lub)(a, b), index);
                        }
                    }
                }
            }
            ExecStmt::Swap { a, b } => {
                let ra = &self.rels[*a];
                let rb = &self.rels[*b];
                assert_eq!(
                    ra.indexes.len(),
                    rb.indexes.len(),
                    "bug: swapping relations with unlike index schemas"
                );
                for (ia, ib) in ra.indexes.iter().zip(&rb.indexes) {
                    ia.swap_contents(ib);
                }
            }
            ExecStmt::Purge { rel } => {
                for index in &self.rels[*rel].indexes {
                    index.clear();
                }
            }
            ExecStmt::Seq(stmts) => {
                for s in stmts {
                    self.exec_stmt(s, env, budget);
                }
            }
            ExecStmt::Par(stmts) => {
                // Each worker owns a deep clone of the environment; only the
                // indexes are shared.
                stmts.par_iter().for_each(|s| {
                    let mut worker_env = env.clone();
                    self.exec_stmt(s, &mut worker_env, budget);
                });
            }
            ExecStmt::Until { conds, body } => loop {
                if conds.iter().all(|c| self.eval_bool(c, env)) {
                    break;
                }
                self.iterations.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "fixpoint round {}",
                    self.iterations.load(Ordering::Relaxed)
                );
                self.exec_stmt(body, env, budget);
            },
            ExecStmt::EstimateJoinSize { buf, rel, attrs } => {
                let index = self.rels[*rel].primary();
                let mut size = 0u64;
                let mut distinct: HashSet<Vec<i64>> = HashSet::new();
                index.for_each(|tuple, _| {
                    size += 1;
                    distinct.insert(attrs.iter().map(|&a| tuple[a]).collect());
                });
                let dups = size - distinct.len() as u64;
                self.profile[*buf].lock().push((size, dups));
            }
            ExecStmt::Comment(text) => trace!("// {}", text),
        }
    }

    fn exec_op(&self, op: &ExecOp, env: &mut Env, budget: usize) {
        match op {
            ExecOp::Search {
                rv,
                rel,
                writes,
                body,
            } => {
                let index = self.rels[*rel].primary();
                if budget > 0 {
                    let base = &*env;
                    index.par_for_each(|tuple, payload| {
                        let mut worker_env = base.clone();
                        worker_env.bind(*rv, tuple, payload, writes);
                        self.exec_op(body, &mut worker_env, budget - 1);
                    });
                } else {
                    index.for_each(|tuple, payload| {
                        env.bind(*rv, tuple, payload, writes);
                        self.exec_op(body, env, 0);
                    });
                }
            }
            ExecOp::Query {
                rv,
                rel,
                index,
                writes,
                body,
            } => {
                let store = &self.rels[*rel];
                let lo = std::mem::take(&mut env.min[*rv]);
                let hi = std::mem::take(&mut env.max[*rv]);
                store.indexes[*index].range(&lo, &hi, |tuple, payload| {
                    env.bind(*rv, tuple, payload, writes);
                    self.exec_op(body, env, 0);
                });
                env.min[*rv] = lo;
                env.max[*rv] = hi;
            }
            ExecOp::Functional {
                rv,
                gen,
                args,
                out_pos,
                writes,
                body,
            } => {
                let arg_values: Vec<Boxed> =
                    args.iter().map(|a| self.eval_lat(a, env)).collect();
                for row in gen.generate(&arg_values) {
                    assert_eq!(
                        row.len(),
                        out_pos.len(),
                        "bug: functional {:?} produced a row of arity {}",
                        gen,
                        row.len()
                    );
                    let tuple: Tuple = row
                        .iter()
                        .zip(out_pos)
                        .map(|(v, &pos)| self.values.unbox_with(v, pos))
                        .collect();
                    env.bind(*rv, &tuple, &Boxed::NoValue, writes);
                    self.exec_op(body, env, budget);
                }
            }
            ExecOp::Project {
                key,
                extra,
                payload,
                rel,
            } => {
                let store = &self.rels[*rel];
                let value = match payload {
                    Some(term) => {
                        let v = self.eval_lat(term, env);
                        if let Denotation::Latticenal(ops) = &store.decl.den {
                            // Bottom elements are never materialized.
                            if ops.is_bot(&v) {
                                return;
                            }
                        }
                        v
                    }
                    None => Boxed::NoValue,
                };
                let mut tuple: Tuple = key.iter().map(|t| self.eval_key(t, env)).collect();
                tuple.extend(extra.iter().map(|t| self.eval_key(t, env)));
                if store.insert(tuple, value) {
                    self.inserted.fetch_add(1, Ordering::Relaxed);
                }
            }
            ExecOp::If { conds, body } => {
                if conds.iter().all(|c| self.eval_bool(c, env)) {
                    self.exec_op(body, env, budget);
                }
            }
        }
    }

    fn eval_bool(&self, cond: &ExecBool, env: &Env) -> bool {
        match cond {
            ExecBool::Not(inner) => !self.eval_bool(inner, env),
            ExecBool::IsEmpty { rel } => self.rels[*rel].primary().is_empty(),
            ExecBool::NotMemberOf { key, value, rel } => {
                let tuple: Tuple = key.iter().map(|t| self.eval_key(t, env)).collect();
                let store = &self.rels[*rel];
                match (value, store.decl.den.lattice()) {
                    (Some(term), Some(ops)) => match store.primary().get(&tuple) {
                        None => true,
                        Some(stored) => {
                            let v = self.eval_lat(term, env);
                            !(ops.leq)(&v, &stored)
                        }
                    },
                    _ => !store.primary().member_of(&tuple),
                }
            }
            ExecBool::Eq(a, b) => self.eval_key(a, env) == self.eval_key(b, env),
            ExecBool::Leq { lower, value, ops } => {
                let lo = self.eval_lat(lower, env);
                let v = self.eval_lat(value, env);
                (ops.leq)(&lo, &v)
            }
            ExecBool::NotBot { value, ops } => {
                let v = self.eval_lat(value, env);
                !ops.is_bot(&v)
            }
            ExecBool::Guard { f, args } => {
                let vals: Vec<Boxed> = args.iter().map(|a| self.eval_lat(a, env)).collect();
                f.test(&vals)
            }
        }
    }

    fn eval_key(&self, term: &KeyTerm, env: &Env) -> i64 {
        match term {
            KeyTerm::Const(v) => *v,
            KeyTerm::RowLoad { rv, col } => env.tuple[*rv][*col],
            KeyTerm::App { f, args, out_pos } => {
                let vals: Vec<Boxed> = args.iter().map(|a| self.eval_lat(a, env)).collect();
                self.values.unbox_with(&f.apply(&vals), *out_pos)
            }
            KeyTerm::ProvMax(loads) => {
                let mut depth = -1i64;
                for &(rv, col) in loads {
                    depth = depth.max(env.tuple[rv][col]);
                }
                depth + 1
            }
        }
    }

    fn eval_lat(&self, term: &LatTerm, env: &Env) -> Boxed {
        match term {
            LatTerm::Lit(v) => v.clone(),
            LatTerm::BoxLoad { rv, col, pos } => self.values.box_with(env.tuple[*rv][*col], *pos),
            LatTerm::Meet { rvs, ops } => {
                let mut iter = rvs.iter();
                let first = iter
                    .next()
                    .expect("bug: empty meet chain");
                let mut acc = env.lat[*first].clone();
                for rv in iter {
                    acc = (ops.glb)(&acc, &env.lat[*rv]);
                }
                acc
            }
            LatTerm::App { f, args } => {
                let vals: Vec<Boxed> = args.iter().map(|a| self.eval_lat(a, env)).collect();
                f.apply(&vals)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{PredSym, RamSym, RelSym};

    fn decl(name: &str, id: u64, arity: usize) -> RelDecl {
        RelDecl {
            sym: RamSym::full(RelSym::new(
                PredSym::new(name, id),
                arity,
                Denotation::Relational,
            )),
            key_arity: arity,
            tuple_arity: arity,
            den: Denotation::Relational,
            orders: vec![(0..arity).collect()],
        }
    }

    fn program(relations: Vec<RelDecl>, rv_arities: Vec<usize>, stmt: ExecStmt) -> ExecProgram {
        ExecProgram {
            relations,
            rv_arities,
            const_writes: vec![],
            profile_bufs: 0,
            stmt,
        }
    }

    /// Copy Edge into Path, then close transitively:
    /// search e ∈ Edge, query p ∈ Path with p[0] = e[1], project (e[0], p[1]).
    fn transitive_closure_program() -> ExecProgram {
        let edge = decl("Edge", 0, 2);
        let path = decl("Path", 1, 2);
        let delta = decl("Path", 1, 2);
        let new = decl("Path", 1, 2);

        let copy = ExecStmt::Insert(ExecOp::Search {
            rv: 0,
            rel: 0,
            writes: vec![],
            body: Box::new(ExecOp::Project {
                key: vec![
                    KeyTerm::RowLoad { rv: 0, col: 0 },
                    KeyTerm::RowLoad { rv: 0, col: 1 },
                ],
                extra: vec![],
                payload: None,
                rel: 3,
            }),
        });

        let step = ExecStmt::Insert(ExecOp::Search {
            rv: 0,
            rel: 2, // delta
            writes: vec![Write {
                src_col: 1,
                dst_rv: 1,
                dst_col: 0,
            }],
            body: Box::new(ExecOp::Query {
                rv: 1,
                rel: 0, // edge
                index: 0,
                writes: vec![],
                body: Box::new(ExecOp::If {
                    conds: vec![ExecBool::NotMemberOf {
                        key: vec![
                            KeyTerm::RowLoad { rv: 0, col: 0 },
                            KeyTerm::RowLoad { rv: 1, col: 1 },
                        ],
                        value: None,
                        rel: 1,
                    }],
                    body: Box::new(ExecOp::Project {
                        key: vec![
                            KeyTerm::RowLoad { rv: 0, col: 0 },
                            KeyTerm::RowLoad { rv: 1, col: 1 },
                        ],
                        extra: vec![],
                        payload: None,
                        rel: 3,
                    }),
                }),
            }),
        });

        let mut body = vec![step];
        body.extend([
            ExecStmt::MergeInto { src: 3, dst: 1 },
            ExecStmt::Swap { a: 3, b: 2 },
            ExecStmt::Purge { rel: 3 },
        ]);

        let stmt = ExecStmt::Seq(vec![
            copy,
            ExecStmt::MergeInto { src: 3, dst: 1 },
            ExecStmt::Swap { a: 3, b: 2 },
            ExecStmt::Purge { rel: 3 },
            ExecStmt::Until {
                conds: vec![ExecBool::IsEmpty { rel: 2 }],
                body: Box::new(ExecStmt::Seq(body)),
            },
        ]);

        program(
            vec![edge, path, delta, new],
            vec![2, 2],
            stmt,
        )
    }

    #[test]
    fn test_transitive_closure_fixpoint() {
        let prog = transitive_closure_program();
        let machine = Machine::new(&prog, Arc::new(ValueStore::new(0)), 64, 0);
        for (a, b) in [(1, 2), (2, 3), (3, 4)] {
            machine.seed(0, vec![a, b], Boxed::NoValue);
        }
        machine.run(&prog);

        let mut paths = Vec::new();
        machine.relation(1).primary().for_each(|t, _| paths.push((t[0], t[1])));
        paths.sort_unstable();
        assert_eq!(
            paths,
            vec![(1, 2), (1, 3), (1, 4), (2, 3), (2, 4), (3, 4)]
        );
    }

    #[test]
    fn test_parallel_search_matches_sequential() {
        let prog = transitive_closure_program();
        let machine = Machine::new(&prog, Arc::new(ValueStore::new(0)), 4, 2);
        for (a, b) in [(1, 2), (2, 3), (3, 4), (4, 5), (5, 6)] {
            machine.seed(0, vec![a, b], Boxed::NoValue);
        }
        machine.run(&prog);
        // n*(n-1)/2 pairs along a 6-node line.
        assert_eq!(machine.relation(1).primary().len(), 15);
    }

    #[test]
    fn test_until_runs_conditions_first() {
        // An empty delta means the loop body must never run.
        let edge = decl("Edge", 0, 2);
        let stmt = ExecStmt::Until {
            conds: vec![ExecBool::IsEmpty { rel: 0 }],
            body: Box::new(ExecStmt::Comment("unreachable".into())),
        };
        let prog = program(vec![edge], vec![], stmt);
        let machine = Machine::new(&prog, Arc::new(ValueStore::new(0)), 64, 0);
        let stats = machine.run(&prog);
        assert_eq!(stats.iterations, 0);
    }

    #[test]
    fn test_estimate_join_size_counts_duplicates() {
        let edge = decl("Edge", 0, 2);
        let stmt = ExecStmt::EstimateJoinSize {
            buf: 0,
            rel: 0,
            attrs: vec![0],
        };
        let mut prog = program(vec![edge], vec![], stmt);
        prog.profile_bufs = 1;
        let machine = Machine::new(&prog, Arc::new(ValueStore::new(0)), 64, 0);
        machine.seed(0, vec![1, 2], Boxed::NoValue);
        machine.seed(0, vec![1, 3], Boxed::NoValue);
        machine.seed(0, vec![2, 3], Boxed::NoValue);
        machine.run(&prog);
        assert_eq!(machine.profile_samples(0), vec![(3, 1)]);
    }
}
