//! Lowering to executable RAM
//!
//! Resolves every symbolic reference of the optimized high-level RAM:
//! relations become positions in a flat store table, row variables become
//! tuple-register indices, query prefixes split into start-up constant
//! writes (literal bounds, unboxed once) and per-binding write lists
//! (copy attribute `i` of the freshly bound tuple into the search bounds of
//! a later scan), and every literal is unboxed through its unified
//! position. The interpreter never consults a dictionary at runtime.

use crate::codegen::Context;
use crate::index_select::{collect_syms, IndexCatalogue};
use datalog_ast::{Denotation, LatticeOps, RamSym, RelSym, RowVar};
use ram_ir::{
    BoolExp, ConstWrite, ExecBool, ExecOp, ExecProgram, ExecStmt, KeyTerm, LatTerm, RamStmt,
    RamTerm, RelDecl, RelOp, Write,
};
use std::collections::{BTreeSet, HashMap};
use tuple_store::ValueStore;

struct Lowerer<'a> {
    ctx: &'a Context,
    values: &'a ValueStore,
    catalogue: &'a IndexCatalogue,
    rel_slot: HashMap<RamSym, usize>,
    relations: Vec<RelDecl>,
    rv_rel: HashMap<RowVar, RamSym>,
    rv_arities: Vec<usize>,
    writes_for: HashMap<RowVar, Vec<Write>>,
    const_writes: Vec<ConstWrite>,
    profile_bufs: usize,
}

/// Lower a statement into an executable program. `all_rels` lists every
/// registered relation so seed facts and marshalling always find a `Full`
/// store.
pub fn lower(
    stmt: &RamStmt,
    all_rels: &[RelSym],
    catalogue: &IndexCatalogue,
    ctx: &Context,
    values: &ValueStore,
) -> ExecProgram {
    let mut syms: BTreeSet<RamSym> = BTreeSet::new();
    collect_syms(stmt, &mut syms);
    for rel in all_rels {
        syms.insert(RamSym::full(rel.clone()));
    }

    let prov_cols = if ctx.use_provenance { 2 } else { 0 };
    let mut rel_slot = HashMap::new();
    let mut relations = Vec::new();
    for sym in syms {
        let key_arity = sym.rel.key_arity();
        let decl = RelDecl {
            sym: sym.clone(),
            key_arity,
            tuple_arity: key_arity + prov_cols,
            den: sym.rel.den.clone(),
            orders: catalogue.orders_of(&sym).to_vec(),
        };
        rel_slot.insert(sym, relations.len());
        relations.push(decl);
    }

    let mut lowerer = Lowerer {
        ctx,
        values,
        catalogue,
        rel_slot,
        relations,
        rv_rel: HashMap::new(),
        rv_arities: vec![0; ctx.rv_count as usize],
        writes_for: HashMap::new(),
        const_writes: Vec::new(),
        profile_bufs: 0,
    };
    lowerer.collect_stmt(stmt);
    let out = lowerer.lower_stmt(stmt);
    ExecProgram {
        relations: lowerer.relations,
        rv_arities: lowerer.rv_arities,
        const_writes: lowerer.const_writes,
        profile_bufs: lowerer.profile_bufs,
        stmt: out,
    }
}

impl<'a> Lowerer<'a> {
    fn slot(&self, sym: &RamSym) -> usize {
        *self
            .rel_slot
            .get(sym)
            .unwrap_or_else(|| panic!("bug: unregistered relation {}", sym))
    }

    fn pos_of(&self, sym: &RamSym, col: usize) -> usize {
        self.ctx.positions.column(sym.rel.pred.id, col)
    }

    fn rel_of(&self, rv: RowVar) -> &RamSym {
        self.rv_rel
            .get(&rv)
            .unwrap_or_else(|| panic!("bug: row variable {} has no scanned relation", rv))
    }

    fn lattice_of(&self, rv: RowVar) -> LatticeOps {
        match &self.rel_of(rv).rel.den {
            Denotation::Latticenal(ops) => ops.clone(),
            Denotation::Relational => {
                panic!("bug: lattice value read from relational {}", self.rel_of(rv))
            }
        }
    }

    // --- Pass 1: row variables, write lists, constant writes. ---

    fn collect_stmt(&mut self, stmt: &RamStmt) {
        match stmt {
            RamStmt::Insert(op) => self.collect_op(op),
            RamStmt::Seq(stmts) | RamStmt::Par(stmts) => {
                for s in stmts {
                    self.collect_stmt(s);
                }
            }
            RamStmt::Until { body, .. } => self.collect_stmt(body),
            _ => {}
        }
    }

    fn collect_op(&mut self, op: &RelOp) {
        match op {
            RelOp::Search { rv, rel, body } => {
                self.bind_atom_rv(*rv, rel);
                self.collect_op(body);
            }
            RelOp::Query {
                rv,
                rel,
                prefix,
                body,
            } => {
                self.bind_atom_rv(*rv, rel);
                for (col, term) in prefix {
                    match term {
                        RamTerm::Lit(v) => {
                            let value = self.values.unbox_with(v, self.pos_of(rel, *col));
                            self.const_writes.push(ConstWrite {
                                rv: rv.0 as usize,
                                col: *col,
                                value,
                            });
                        }
                        RamTerm::RowLoad(src, src_col) => {
                            self.writes_for.entry(*src).or_default().push(Write {
                                src_col: *src_col,
                                dst_rv: rv.0 as usize,
                                dst_col: *col,
                            });
                        }
                        other => panic!("bug: {} cannot bound an index query", other),
                    }
                }
                self.collect_op(body);
            }
            RelOp::Functional {
                rv, out_arity, body, ..
            } => {
                self.rv_arities[rv.0 as usize] = *out_arity;
                self.collect_op(body);
            }
            RelOp::Project { .. } => {}
            RelOp::If { body, .. } => self.collect_op(body),
        }
    }

    fn bind_atom_rv(&mut self, rv: RowVar, rel: &RamSym) {
        let slot = self.slot(rel);
        self.rv_arities[rv.0 as usize] = self.relations[slot].tuple_arity;
        self.rv_rel.insert(rv, rel.clone());
    }

    // --- Pass 2: translation. ---

    fn lower_stmt(&mut self, stmt: &RamStmt) -> ExecStmt {
        match stmt {
            RamStmt::Insert(op) => ExecStmt::Insert(self.lower_op(op)),
            RamStmt::MergeInto { src, dst } => ExecStmt::MergeInto {
                src: self.slot(src),
                dst: self.slot(dst),
            },
            RamStmt::Swap { a, b } => ExecStmt::Swap {
                a: self.slot(a),
                b: self.slot(b),
            },
            RamStmt::Purge(rel) => ExecStmt::Purge {
                rel: self.slot(rel),
            },
            RamStmt::Seq(stmts) => {
                ExecStmt::Seq(stmts.iter().map(|s| self.lower_stmt(s)).collect())
            }
            RamStmt::Par(stmts) => {
                ExecStmt::Par(stmts.iter().map(|s| self.lower_stmt(s)).collect())
            }
            RamStmt::Until { conds, body } => ExecStmt::Until {
                conds: conds.iter().map(|c| self.lower_bool(c)).collect(),
                body: Box::new(self.lower_stmt(body)),
            },
            RamStmt::Comment(text) => ExecStmt::Comment(text.clone()),
            RamStmt::EstimateJoinSize { buf, rel, attrs } => {
                self.profile_bufs = self.profile_bufs.max(buf + 1);
                ExecStmt::EstimateJoinSize {
                    buf: *buf,
                    rel: self.slot(rel),
                    attrs: attrs.clone(),
                }
            }
        }
    }

    fn lower_op(&mut self, op: &RelOp) -> ExecOp {
        match op {
            RelOp::Search { rv, rel, body } => ExecOp::Search {
                rv: rv.0 as usize,
                rel: self.slot(rel),
                writes: self.writes_for.get(rv).cloned().unwrap_or_default(),
                body: Box::new(self.lower_op(body)),
            },
            RelOp::Query {
                rv,
                rel,
                prefix,
                body,
            } => {
                let attrs: BTreeSet<usize> = prefix.iter().map(|(col, _)| *col).collect();
                ExecOp::Query {
                    rv: rv.0 as usize,
                    rel: self.slot(rel),
                    index: self.catalogue.index_for(rel, &attrs),
                    writes: self.writes_for.get(rv).cloned().unwrap_or_default(),
                    body: Box::new(self.lower_op(body)),
                }
            }
            RelOp::Functional {
                rv,
                gen,
                args,
                out_arity: _,
                body,
            } => ExecOp::Functional {
                rv: rv.0 as usize,
                gen: gen.clone(),
                args: args.iter().map(|t| self.lower_lat(t)).collect(),
                out_pos: self
                    .ctx
                    .func_out_pos
                    .get(rv)
                    .unwrap_or_else(|| panic!("bug: functional {} has no output positions", rv))
                    .clone(),
                writes: self.writes_for.get(rv).cloned().unwrap_or_default(),
                body: Box::new(self.lower_op(body)),
            },
            RelOp::If { conds, body } => ExecOp::If {
                conds: conds.iter().map(|c| self.lower_bool(c)).collect(),
                body: Box::new(self.lower_op(body)),
            },
            RelOp::Project { terms, rel, .. } => self.lower_project(terms, rel),
        }
    }

    fn lower_project(&mut self, terms: &[RamTerm], rel: &RamSym) -> ExecOp {
        let key_arity = rel.rel.key_arity();
        let lat = rel.rel.den.is_lattice();
        let prov = self.ctx.use_provenance;
        let expected = key_arity + usize::from(lat) + if prov { 2 } else { 0 };
        assert_eq!(
            terms.len(),
            expected,
            "bug: projection into {} has {} terms",
            rel,
            terms.len()
        );

        let key = (0..key_arity)
            .map(|col| self.lower_key(&terms[col], Some(self.pos_of(rel, col))))
            .collect();
        let payload = lat.then(|| self.lower_lat(&terms[key_arity]));
        let extra = if prov {
            terms[key_arity + usize::from(lat)..]
                .iter()
                .map(|t| self.lower_prov(t))
                .collect()
        } else {
            Vec::new()
        };
        ExecOp::Project {
            key,
            extra,
            payload,
            rel: self.slot(rel),
        }
    }

    /// Provenance columns are raw 64-bit values, never boxed.
    fn lower_prov(&self, term: &RamTerm) -> KeyTerm {
        match term {
            RamTerm::ProvMax(rvs) => KeyTerm::ProvMax(
                rvs.iter()
                    .map(|rv| {
                        let depth_col = self.rel_of(*rv).rel.key_arity();
                        (rv.0 as usize, depth_col)
                    })
                    .collect(),
            ),
            RamTerm::Lit(datalog_ast::Boxed::Int64(n)) => KeyTerm::Const(*n),
            other => panic!("bug: {} is not a provenance column", other),
        }
    }

    fn lower_bool(&mut self, cond: &BoolExp) -> ExecBool {
        match cond {
            BoolExp::Not(inner) => ExecBool::Not(Box::new(self.lower_bool(inner))),
            BoolExp::IsEmpty(rel) => ExecBool::IsEmpty {
                rel: self.slot(rel),
            },
            BoolExp::NotMemberOf(terms, rel) => {
                let key_arity = rel.rel.key_arity();
                let key = (0..key_arity)
                    .map(|col| self.lower_key(&terms[col], Some(self.pos_of(rel, col))))
                    .collect();
                let value = rel
                    .rel
                    .den
                    .is_lattice()
                    .then(|| self.lower_lat(&terms[key_arity]));
                ExecBool::NotMemberOf {
                    key,
                    value,
                    rel: self.slot(rel),
                }
            }
            BoolExp::Eq(a, b) => {
                // A literal side borrows its boxing position from the
                // attribute on the other side.
                let hint = self.eq_position(a, b);
                ExecBool::Eq(self.lower_key(a, hint), self.lower_key(b, hint))
            }
            BoolExp::Leq { rel, lower, value } => {
                let ops = rel
                    .rel
                    .den
                    .lattice()
                    .unwrap_or_else(|| panic!("bug: Leq over relational {}", rel))
                    .clone();
                ExecBool::Leq {
                    lower: self.lower_lat(lower),
                    value: self.lower_lat(value),
                    ops,
                }
            }
            BoolExp::NotBot { rel, value } => {
                let ops = rel
                    .rel
                    .den
                    .lattice()
                    .unwrap_or_else(|| panic!("bug: NotBot over relational {}", rel))
                    .clone();
                ExecBool::NotBot {
                    value: self.lower_lat(value),
                    ops,
                }
            }
            BoolExp::Guard(f, args) => ExecBool::Guard {
                f: f.clone(),
                args: args.iter().map(|t| self.lower_lat(t)).collect(),
            },
        }
    }

    fn eq_position(&self, a: &RamTerm, b: &RamTerm) -> Option<usize> {
        for term in [a, b] {
            if let RamTerm::RowLoad(rv, col) = term {
                return Some(self.pos_of(self.rel_of(*rv), *col));
            }
        }
        None
    }

    fn lower_key(&self, term: &RamTerm, pos: Option<usize>) -> KeyTerm {
        match term {
            RamTerm::RowLoad(rv, col) => KeyTerm::RowLoad {
                rv: rv.0 as usize,
                col: *col,
            },
            RamTerm::Lit(v) => {
                let pos =
                    pos.unwrap_or_else(|| panic!("bug: literal {} has no boxing position", v));
                KeyTerm::Const(self.values.unbox_with(v, pos))
            }
            RamTerm::App(f, args) => KeyTerm::App {
                f: f.clone(),
                args: args.iter().map(|t| self.lower_lat(t)).collect(),
                out_pos: pos
                    .unwrap_or_else(|| panic!("bug: application {:?} has no boxing position", f)),
            },
            other => panic!("bug: {} in a key attribute", other),
        }
    }

    fn lower_lat(&self, term: &RamTerm) -> LatTerm {
        match term {
            RamTerm::Lit(v) => LatTerm::Lit(v.clone()),
            RamTerm::RowLoad(rv, col) => LatTerm::BoxLoad {
                rv: rv.0 as usize,
                col: *col,
                pos: self.pos_of(self.rel_of(*rv), *col),
            },
            RamTerm::Meet(rvs) => {
                let first = rvs.first().expect("bug: empty meet chain");
                LatTerm::Meet {
                    rvs: rvs.iter().map(|rv| rv.0 as usize).collect(),
                    ops: self.lattice_of(*first),
                }
            }
            RamTerm::App(f, args) => LatTerm::App {
                f: f.clone(),
                args: args.iter().map(|t| self.lower_lat(t)).collect(),
            },
            RamTerm::ProvMax(_) => panic!("bug: provenance term outside a projection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{compile_program, Context};
    use crate::hoist::hoist;
    use crate::index_select::select_indexes;
    use crate::simplify::simplify;
    use crate::unify::unify_positions;
    use datalog_ast::{
        BodyPredicate, BodyTerm, Constraint, HeadAtom, HeadTerm, PredSym,
    };
    use datalog_stratify::stratify;

    fn rel(name: &str, id: u64, arity: usize) -> RelSym {
        RelSym::new(PredSym::new(name, id), arity, Denotation::Relational)
    }

    fn lower_tc() -> ExecProgram {
        let edge = rel("Edge", 0, 2);
        let path = rel("Path", 1, 2);
        let rules = vec![
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
        ];
        let strat = stratify(&rules).unwrap();
        let mut ctx = Context::new(unify_positions(&rules), false);
        let stmt = hoist(simplify(compile_program(&rules, &strat, &mut ctx)));
        let all_rels = vec![edge, path];
        let catalogue = select_indexes(&stmt, &all_rels);
        let values = ValueStore::new(ctx.positions.count());
        lower(&stmt, &all_rels, &catalogue, &ctx, &values)
    }

    #[test]
    fn test_lowered_program_has_dense_slots() {
        let prog = lower_tc();
        // Edge Full, Path Full, Path Delta, Path New.
        assert_eq!(prog.relations.len(), 4);
        let names: Vec<String> = prog.relations.iter().map(|d| d.sym.to_string()).collect();
        assert!(names.contains(&"Edge%0/2".to_string()));
        assert!(names.contains(&"ΔPath%1/2".to_string()));
        assert_eq!(prog.rv_arities.len(), 5);
        assert!(prog.rv_arities.iter().all(|&a| a == 2));
    }

    #[test]
    fn test_join_produces_write_list_for_query_bounds() {
        let prog = lower_tc();
        // Somewhere a search carries a write list feeding the inner query.
        fn has_write(op: &ExecOp) -> bool {
            match op {
                ExecOp::Search { writes, body, .. } | ExecOp::Query { writes, body, .. } => {
                    !writes.is_empty() || has_write(body)
                }
                ExecOp::Functional { body, .. } | ExecOp::If { body, .. } => has_write(body),
                ExecOp::Project { .. } => false,
            }
        }
        fn stmt_has_write(stmt: &ExecStmt) -> bool {
            match stmt {
                ExecStmt::Insert(op) => has_write(op),
                ExecStmt::Seq(ss) | ExecStmt::Par(ss) => ss.iter().any(stmt_has_write),
                ExecStmt::Until { body, .. } => stmt_has_write(body),
                _ => false,
            }
        }
        assert!(stmt_has_write(&prog.stmt));
    }
}
