//! Join-order optimization
//!
//! Two halves. `instrument` rewrites the program so every fixpoint loop
//! starts with `EstimateJoinSize` probes covering every bound-attribute set
//! any join order could produce; the façade runs the instrumented program
//! on sampled facts. `reorder` then solves, per rule, a Selinger-style
//! dynamic program over subsets of the atom scans: the cost of scanning
//! atom `v` after a partial order `O` is the atom's arity times the
//! expected number of produced bindings, summed over fixpoint rounds, using
//! the profiled `size / distinct` estimates. Ties prefer the
//! lexicographically smaller order. Functionals and residual guards are
//! re-attached after the scans, preserving the bindings they require; their
//! cost would be infinite anywhere earlier, so they always run last.

use crate::hoist::{self, ScanNode, StackForm};
use crate::index_select::collect_syms;
use crate::profiler::JoinProfile;
use datalog_ast::{Boxed, RamSym, RowVar};
use log::debug;
use ram_ir::{BoolExp, RamStmt, RamTerm, RelOp};
use std::collections::{BTreeSet, HashMap};

/// Rules with more scans than this keep their written order; the subset
/// dynamic program would not pay for itself.
const MAX_DP_ATOMS: usize = 10;

/// Equality information of one flattened rule, used to decide which
/// attributes of a scan are bound under a partial join order.
struct EqInfo {
    /// Per (rv, col): literal-pinned?
    lit_cols: BTreeSet<(RowVar, usize)>,
    /// Per (rv, col): the other sites of its equality class.
    peers: HashMap<(RowVar, usize), Vec<(RowVar, usize)>>,
}

impl EqInfo {
    fn build(guards: &[BoolExp]) -> EqInfo {
        // Union-find over the sites that occur in equality guards.
        let mut ids: HashMap<(RowVar, usize), usize> = HashMap::new();
        let mut parent: Vec<usize> = Vec::new();
        let mut sites: Vec<(RowVar, usize)> = Vec::new();
        let mut lits: Vec<(usize, Boxed)> = Vec::new();

        fn find(parent: &mut Vec<usize>, mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        let mut site = |ids: &mut HashMap<(RowVar, usize), usize>,
                        parent: &mut Vec<usize>,
                        sites: &mut Vec<(RowVar, usize)>,
                        key: (RowVar, usize)| {
            *ids.entry(key).or_insert_with(|| {
                parent.push(parent.len());
                sites.push(key);
                parent.len() - 1
            })
        };

        let mut unions: Vec<(usize, usize)> = Vec::new();
        for guard in guards {
            match guard {
                BoolExp::Eq(RamTerm::RowLoad(rv1, c1), RamTerm::RowLoad(rv2, c2)) => {
                    let a = site(&mut ids, &mut parent, &mut sites, (*rv1, *c1));
                    let b = site(&mut ids, &mut parent, &mut sites, (*rv2, *c2));
                    unions.push((a, b));
                }
                BoolExp::Eq(RamTerm::RowLoad(rv, c), RamTerm::Lit(v))
                | BoolExp::Eq(RamTerm::Lit(v), RamTerm::RowLoad(rv, c)) => {
                    let a = site(&mut ids, &mut parent, &mut sites, (*rv, *c));
                    lits.push((a, v.clone()));
                }
                _ => {}
            }
        }
        for (a, b) in unions {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            if ra != rb {
                parent[ra] = rb;
            }
        }

        let mut class_members: HashMap<usize, Vec<(RowVar, usize)>> = HashMap::new();
        for (i, key) in sites.iter().enumerate() {
            let root = find(&mut parent, i);
            class_members.entry(root).or_default().push(*key);
        }
        let mut lit_roots: BTreeSet<usize> = BTreeSet::new();
        for (id, _) in lits {
            lit_roots.insert(find(&mut parent, id));
        }

        let mut lit_cols = BTreeSet::new();
        let mut peers: HashMap<(RowVar, usize), Vec<(RowVar, usize)>> = HashMap::new();
        for (root, members) in class_members {
            for &m in &members {
                if lit_roots.contains(&root) {
                    lit_cols.insert(m);
                }
                let others: Vec<(RowVar, usize)> =
                    members.iter().copied().filter(|&o| o != m).collect();
                peers.insert(m, others);
            }
        }
        EqInfo { lit_cols, peers }
    }

    /// Attributes of `rv` (with `key_arity` columns) bound once the row
    /// variables in `bound` are all scanned.
    fn bound_attrs(&self, rv: RowVar, key_arity: usize, bound: &BTreeSet<RowVar>) -> Vec<usize> {
        let mut attrs = Vec::new();
        for col in 0..key_arity {
            let key = (rv, col);
            let pinned = self.lit_cols.contains(&key)
                || self
                    .peers
                    .get(&key)
                    .is_some_and(|ps| ps.iter().any(|(orv, _)| bound.contains(orv)));
            if pinned {
                attrs.push(col);
            }
        }
        attrs
    }
}

/// The atom scans of a flattened rule, with the metadata the optimizer
/// needs.
fn atom_scans(stack: &StackForm) -> Vec<(RowVar, RamSym)> {
    stack
        .scans
        .iter()
        .filter_map(|s| match s {
            ScanNode::Atom { rv, rel } => Some((*rv, rel.clone())),
            ScanNode::Func { .. } => None,
        })
        .collect()
}

/// Enumerate every bound-attribute set a join order could need, per scanned
/// relation variant.
fn probe_specs(stack: &StackForm, out: &mut BTreeSet<(RamSym, Vec<usize>)>) {
    let atoms = atom_scans(stack);
    if atoms.len() > MAX_DP_ATOMS {
        return;
    }
    let eq = EqInfo::build(&stack.guards);
    for (i, (rv, sym)) in atoms.iter().enumerate() {
        let others: Vec<RowVar> = atoms
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, (orv, _))| *orv)
            .collect();
        for mask in 0u32..(1 << others.len()) {
            let bound: BTreeSet<RowVar> = others
                .iter()
                .enumerate()
                .filter(|&(j, _)| mask & (1 << j) != 0)
                .map(|(_, rv)| *rv)
                .collect();
            let attrs = eq.bound_attrs(*rv, sym.rel.key_arity(), &bound);
            out.insert((sym.clone(), attrs));
        }
    }
}

/// Insert join-size probes at the head of every fixpoint loop whose body
/// touches the probed relation. Returns the rewritten program and the
/// probe table (buffer index order).
pub fn instrument(stmt: &RamStmt) -> (RamStmt, Vec<(RamSym, Vec<usize>)>) {
    let mut specs: BTreeSet<(RamSym, Vec<usize>)> = BTreeSet::new();
    collect_probe_specs(stmt, &mut specs);
    let probes: Vec<(RamSym, Vec<usize>)> = specs.into_iter().collect();
    let out = place_probes(stmt.clone(), &probes);
    (out, probes)
}

fn collect_probe_specs(stmt: &RamStmt, out: &mut BTreeSet<(RamSym, Vec<usize>)>) {
    match stmt {
        RamStmt::Insert(op) => {
            let stack = hoist::unhoist(op.clone());
            probe_specs(&stack, out);
        }
        RamStmt::Seq(stmts) | RamStmt::Par(stmts) => {
            for s in stmts {
                collect_probe_specs(s, out);
            }
        }
        RamStmt::Until { body, .. } => collect_probe_specs(body, out),
        _ => {}
    }
}

fn place_probes(stmt: RamStmt, probes: &[(RamSym, Vec<usize>)]) -> RamStmt {
    match stmt {
        RamStmt::Seq(stmts) => RamStmt::Seq(
            stmts
                .into_iter()
                .map(|s| place_probes(s, probes))
                .collect(),
        ),
        RamStmt::Par(stmts) => RamStmt::Par(
            stmts
                .into_iter()
                .map(|s| place_probes(s, probes))
                .collect(),
        ),
        RamStmt::Until { conds, body } => {
            let mut local: BTreeSet<RamSym> = BTreeSet::new();
            collect_syms(&body, &mut local);
            let mut stmts: Vec<RamStmt> = probes
                .iter()
                .enumerate()
                .filter(|(_, (sym, _))| local.contains(sym))
                .map(|(buf, (sym, attrs))| RamStmt::EstimateJoinSize {
                    buf,
                    rel: sym.clone(),
                    attrs: attrs.clone(),
                })
                .collect();
            stmts.push(place_probes(*body, probes));
            RamStmt::Until {
                conds,
                body: Box::new(RamStmt::seq(stmts)),
            }
        }
        other => other,
    }
}

/// Reorder the scans of every rule according to the profile. Rules without
/// complete estimates keep their written order.
pub fn reorder(stmt: RamStmt, profile: &JoinProfile) -> RamStmt {
    match stmt {
        RamStmt::Insert(op) => {
            let stack = hoist::unhoist(op.clone());
            match reorder_stack(stack, profile) {
                Some(new_op) => RamStmt::Insert(new_op),
                None => RamStmt::Insert(op),
            }
        }
        RamStmt::Seq(stmts) => RamStmt::seq(
            stmts
                .into_iter()
                .map(|s| reorder(s, profile))
                .collect(),
        ),
        RamStmt::Par(stmts) => RamStmt::Par(
            stmts
                .into_iter()
                .map(|s| reorder(s, profile))
                .collect(),
        ),
        RamStmt::Until { conds, body } => RamStmt::Until {
            conds,
            body: Box::new(reorder(*body, profile)),
        },
        other => other,
    }
}

fn reorder_stack(stack: StackForm, profile: &JoinProfile) -> Option<RelOp> {
    let atoms = atom_scans(&stack);
    let n = atoms.len();
    if n < 2 || n > MAX_DP_ATOMS {
        return None;
    }
    let eq = EqInfo::build(&stack.guards);

    // Align all estimates on a common round count.
    let mut rounds = usize::MAX;
    let mut est: HashMap<(usize, Vec<usize>), Vec<f64>> = HashMap::new();
    for (i, (rv, sym)) in atoms.iter().enumerate() {
        let others: Vec<RowVar> = atoms
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, (orv, _))| *orv)
            .collect();
        for mask in 0u32..(1 << others.len()) {
            let bound: BTreeSet<RowVar> = others
                .iter()
                .enumerate()
                .filter(|&(j, _)| mask & (1 << j) != 0)
                .map(|(_, rv)| *rv)
                .collect();
            let attrs = eq.bound_attrs(*rv, sym.rel.key_arity(), &bound);
            if est.contains_key(&(i, attrs.clone())) {
                continue;
            }
            let e = profile.expectation(sym, &attrs)?;
            rounds = rounds.min(e.len());
            est.insert((i, attrs), e);
        }
    }
    if rounds == 0 || rounds == usize::MAX {
        return None;
    }

    // Selinger dynamic program over subsets of the atom scans.
    struct Best {
        cost: f64,
        rows: Vec<f64>,
        order: Vec<usize>,
    }
    let mut best: Vec<Option<Best>> = (0..(1usize << n)).map(|_| None).collect();
    best[0] = Some(Best {
        cost: 0.0,
        rows: vec![1.0; rounds],
        order: vec![],
    });

    for mask in 1usize..(1 << n) {
        for v in 0..n {
            if mask & (1 << v) == 0 {
                continue;
            }
            let prev_mask = mask & !(1 << v);
            let Some(prev) = &best[prev_mask] else { continue };

            let bound: BTreeSet<RowVar> = (0..n)
                .filter(|j| prev_mask & (1 << j) != 0)
                .map(|j| atoms[j].0)
                .collect();
            let attrs = eq.bound_attrs(atoms[v].0, atoms[v].1.rel.key_arity(), &bound);
            let e = &est[&(v, attrs)];

            let mut step = 0.0;
            let mut rows = Vec::with_capacity(rounds);
            for i in 0..rounds {
                step += prev.rows[i] * e[i];
                rows.push(prev.rows[i] * e[i]);
            }
            let cost = prev.cost + atoms[v].1.rel.key_arity() as f64 * step;
            let mut order = prev.order.clone();
            order.push(v);

            let better = match &best[mask] {
                None => true,
                Some(b) => cost < b.cost || (cost == b.cost && order < b.order),
            };
            if better {
                best[mask] = Some(Best { cost, rows, order });
            }
        }
    }

    let winner = best[(1 << n) - 1].take()?;
    if winner.order == (0..n).collect::<Vec<_>>() {
        return None; // already optimal
    }
    debug!(
        "reordering joins of projection into {:?}: {:?}",
        atoms.first().map(|(_, s)| s.to_string()),
        winner.order
    );

    // Restack: atoms in the chosen order, then functionals in written
    // order; hoisting re-derives prefixes and guard placement.
    let StackForm {
        scans,
        guards,
        project,
    } = stack;
    let mut atom_nodes: Vec<Option<ScanNode>> = Vec::new();
    let mut func_nodes: Vec<ScanNode> = Vec::new();
    for scan in scans {
        match scan {
            a @ ScanNode::Atom { .. } => atom_nodes.push(Some(a)),
            f @ ScanNode::Func { .. } => func_nodes.push(f),
        }
    }
    let mut new_scans: Vec<ScanNode> = winner
        .order
        .iter()
        .map(|&i| atom_nodes[i].take().expect("bug: atom scan used twice"))
        .collect();
    new_scans.extend(func_nodes);

    hoist::rebuild(StackForm {
        scans: new_scans,
        guards,
        project,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiler::JoinProfile;
    use datalog_ast::{Denotation, PredSym, RelSym};

    fn sym(name: &str, id: u64) -> RamSym {
        RamSym::full(RelSym::new(PredSym::new(name, id), 2, Denotation::Relational))
    }

    fn project() -> RelOp {
        RelOp::Project {
            terms: vec![RamTerm::RowLoad(RowVar(0), 0), RamTerm::RowLoad(RowVar(1), 1)],
            rel: sym("Out", 9),
            rule: 0,
        }
    }

    /// search big, search small joined on big[1] == small[0].
    fn joined_op() -> RelOp {
        RelOp::Search {
            rv: RowVar(0),
            rel: sym("Big", 0),
            body: Box::new(RelOp::Search {
                rv: RowVar(1),
                rel: sym("Small", 1),
                body: Box::new(RelOp::If {
                    conds: vec![BoolExp::Eq(
                        RamTerm::RowLoad(RowVar(1), 0),
                        RamTerm::RowLoad(RowVar(0), 1),
                    )],
                    body: Box::new(project()),
                }),
            }),
        }
    }

    fn profile_with(big: u64, small: u64) -> JoinProfile {
        let probes = vec![
            (sym("Big", 0), vec![]),
            (sym("Big", 0), vec![1]),
            (sym("Small", 1), vec![]),
            (sym("Small", 1), vec![0]),
        ];
        let samples = vec![
            vec![(big, big.saturating_sub(1))],
            vec![(big, big.saturating_sub(2))],
            vec![(small, small.saturating_sub(1))],
            vec![(small, 0)],
        ];
        JoinProfile::from_samples(&probes, samples)
    }

    #[test]
    fn test_instrument_covers_every_bound_set() {
        let stmt = RamStmt::Until {
            conds: vec![],
            body: Box::new(RamStmt::Insert(joined_op())),
        };
        let (out, probes) = instrument(&stmt);
        // Each atom with and without the other bound: four sets.
        assert_eq!(probes.len(), 4);
        let text = format!("{}", out);
        assert!(text.contains("estimate-join-size"));
    }

    #[test]
    fn test_reorder_puts_selective_scan_first() {
        // Big has 1000 rows; Small has 2. Scanning Small first and probing
        // Big through the join attribute is cheaper.
        let profile = profile_with(1000, 2);
        let out = reorder(RamStmt::Insert(joined_op()), &profile);
        let text = format!("{}", out);
        let small_pos = text.find("Small").unwrap();
        let big_pos = text.find("Big").unwrap();
        assert!(
            small_pos < big_pos,
            "expected Small to be scanned first:\n{}",
            text
        );
    }

    #[test]
    fn test_reorder_keeps_order_without_estimates() {
        let profile = JoinProfile::default();
        let before = format!("{}", RamStmt::Insert(joined_op()));
        let out = reorder(RamStmt::Insert(joined_op()), &profile);
        assert_eq!(format!("{}", out), before);
    }
}
