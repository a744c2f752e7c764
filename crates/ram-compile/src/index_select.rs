//! Automatic index selection
//!
//! Collects, per relation, the primitive searches (unordered bound-attribute
//! sets) of every `Query` in the program, then solves minimum chain cover
//! over the subset poset: by König's theorem a minimum chain cover
//! corresponds to a maximum matching in the bipartite graph with an edge
//! `a -> b` whenever `a ⊊ b`. Each maximal chain becomes one physical index
//! whose key order concatenates the successive set differences; every
//! primitive search in the chain is then some permutation of a prefix of
//! that index. Orders are completed to full key arity, relations that are
//! never queried get a sequential default, and `New` relations inherit the
//! orders of their `Delta` so the two can be swapped in place.

use datalog_ast::{RamSym, RelSym, Version};
use ram_ir::{BoolExp, RamStmt, RelOp};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Physical index orders per relation variant, and the search-to-index map.
#[derive(Debug, Clone, Default)]
pub struct IndexCatalogue {
    orders: HashMap<RamSym, Vec<Vec<usize>>>,
}

impl IndexCatalogue {
    /// Index key orders of a relation; `orders[0]` is the primary.
    pub fn orders_of(&self, sym: &RamSym) -> &[Vec<usize>] {
        self.orders
            .get(sym)
            .unwrap_or_else(|| panic!("bug: no index selected for {}", sym))
    }

    /// Position of an index whose prefix covers exactly the primitive
    /// search `attrs`.
    pub fn index_for(&self, sym: &RamSym, attrs: &BTreeSet<usize>) -> usize {
        let orders = self.orders_of(sym);
        orders
            .iter()
            .position(|order| {
                attrs.len() <= order.len()
                    && order[..attrs.len()].iter().all(|c| attrs.contains(c))
            })
            .unwrap_or_else(|| panic!("bug: missing index for {} on {:?}", sym, attrs))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RamSym, &Vec<Vec<usize>>)> {
        self.orders.iter()
    }
}

/// Collect every relation variant a statement references.
pub(crate) fn collect_syms(stmt: &RamStmt, out: &mut BTreeSet<RamSym>) {
    match stmt {
        RamStmt::Insert(op) => collect_op_syms(op, out),
        RamStmt::MergeInto { src, dst } => {
            out.insert(src.clone());
            out.insert(dst.clone());
        }
        RamStmt::Swap { a, b } => {
            out.insert(a.clone());
            out.insert(b.clone());
        }
        RamStmt::Purge(rel) => {
            out.insert(rel.clone());
        }
        RamStmt::Seq(stmts) | RamStmt::Par(stmts) => {
            for s in stmts {
                collect_syms(s, out);
            }
        }
        RamStmt::Until { conds, body } => {
            for c in conds {
                collect_guard_syms(c, out);
            }
            collect_syms(body, out);
        }
        RamStmt::EstimateJoinSize { rel, .. } => {
            out.insert(rel.clone());
        }
        RamStmt::Comment(_) => {}
    }
}

fn collect_op_syms(op: &RelOp, out: &mut BTreeSet<RamSym>) {
    match op {
        RelOp::Search { rel, body, .. } | RelOp::Query { rel, body, .. } => {
            out.insert(rel.clone());
            collect_op_syms(body, out);
        }
        RelOp::Functional { body, .. } => collect_op_syms(body, out),
        RelOp::Project { rel, .. } => {
            out.insert(rel.clone());
        }
        RelOp::If { conds, body } => {
            for c in conds {
                collect_guard_syms(c, out);
            }
            collect_op_syms(body, out);
        }
    }
}

fn collect_guard_syms(cond: &BoolExp, out: &mut BTreeSet<RamSym>) {
    match cond {
        BoolExp::Not(inner) => collect_guard_syms(inner, out),
        BoolExp::IsEmpty(rel) | BoolExp::NotMemberOf(_, rel) => {
            out.insert(rel.clone());
        }
        _ => {}
    }
}

/// Primitive searches per relation variant.
fn collect_searches(stmt: &RamStmt, out: &mut BTreeMap<RamSym, BTreeSet<BTreeSet<usize>>>) {
    match stmt {
        RamStmt::Insert(op) => collect_op_searches(op, out),
        RamStmt::Seq(stmts) | RamStmt::Par(stmts) => {
            for s in stmts {
                collect_searches(s, out);
            }
        }
        RamStmt::Until { body, .. } => collect_searches(body, out),
        _ => {}
    }
}

fn collect_op_searches(op: &RelOp, out: &mut BTreeMap<RamSym, BTreeSet<BTreeSet<usize>>>) {
    match op {
        RelOp::Search { body, .. } | RelOp::Functional { body, .. } => {
            collect_op_searches(body, out)
        }
        RelOp::Query {
            rel, prefix, body, ..
        } => {
            let attrs: BTreeSet<usize> = prefix.iter().map(|(col, _)| *col).collect();
            out.entry(rel.clone()).or_default().insert(attrs);
            collect_op_searches(body, out);
        }
        RelOp::Project { .. } => {}
        RelOp::If { body, .. } => collect_op_searches(body, out),
    }
}

/// Greedy-free exact minimum chain cover via maximum bipartite matching
/// (augmenting-path depth-first search).
fn chain_cover(searches: &BTreeSet<BTreeSet<usize>>) -> Vec<Vec<BTreeSet<usize>>> {
    let sets: Vec<&BTreeSet<usize>> = searches.iter().collect();
    let n = sets.len();
    // edge a -> b iff a is a proper subset of b
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
    for a in 0..n {
        for b in 0..n {
            if a != b && sets[a].is_subset(sets[b]) && sets[a].len() < sets[b].len() {
                succs[a].push(b);
            }
        }
    }

    // match_to[b] = left node matched into b
    let mut match_to: Vec<Option<usize>> = vec![None; n];
    let mut next: Vec<Option<usize>> = vec![None; n];

    fn augment(
        a: usize,
        succs: &[Vec<usize>],
        match_to: &mut [Option<usize>],
        visited: &mut [bool],
    ) -> Option<usize> {
        for &b in &succs[a] {
            if visited[b] {
                continue;
            }
            visited[b] = true;
            if match_to[b].is_none()
                || augment(match_to[b].expect("bug: checked"), succs, match_to, visited).is_some()
            {
                match_to[b] = Some(a);
                return Some(b);
            }
        }
        None
    }

    for a in 0..n {
        let mut visited = vec![false; n];
        augment(a, &succs, &mut match_to, &mut visited);
    }
    for (b, m) in match_to.iter().enumerate() {
        if let Some(a) = m {
            next[*a] = Some(b);
        }
    }

    // Chain heads are sets nobody precedes.
    let mut is_tail = vec![false; n];
    for b in match_to.iter().enumerate().filter_map(|(b, m)| m.map(|_| b)) {
        is_tail[b] = true;
    }

    let mut chains = Vec::new();
    for head in 0..n {
        if is_tail[head] {
            continue;
        }
        let mut chain = Vec::new();
        let mut cur = Some(head);
        while let Some(i) = cur {
            chain.push(sets[i].clone());
            cur = next[i];
        }
        chains.push(chain);
    }
    chains
}

/// Key order of one chain: successive set differences, each sorted, then
/// the missing columns in ascending order.
fn order_of_chain(chain: &[BTreeSet<usize>], key_arity: usize) -> Vec<usize> {
    let mut order: Vec<usize> = Vec::with_capacity(key_arity);
    let mut covered: BTreeSet<usize> = BTreeSet::new();
    for set in chain {
        for &col in set {
            if covered.insert(col) {
                order.push(col);
            }
        }
    }
    for col in 0..key_arity {
        if covered.insert(col) {
            order.push(col);
        }
    }
    order
}

fn default_order(key_arity: usize) -> Vec<usize> {
    (0..key_arity).collect()
}

/// Select the physical indexes for every relation variant referenced by the
/// program. `all_rels` lists every registered relation; each gets at least
/// a `Full` store so seed facts and marshalling always find one.
pub fn select_indexes(stmt: &RamStmt, all_rels: &[RelSym]) -> IndexCatalogue {
    let mut syms: BTreeSet<RamSym> = BTreeSet::new();
    collect_syms(stmt, &mut syms);
    for rel in all_rels {
        syms.insert(RamSym::full(rel.clone()));
    }

    let mut searches: BTreeMap<RamSym, BTreeSet<BTreeSet<usize>>> = BTreeMap::new();
    collect_searches(stmt, &mut searches);

    let mut catalogue = IndexCatalogue::default();
    // Delta orders are computed before New copies them.
    let mut ordered: Vec<&RamSym> = syms.iter().collect();
    ordered.sort_by_key(|s| (s.ver, s.rel.clone()));

    for sym in ordered {
        let key_arity = sym.rel.key_arity();
        let orders = if sym.ver == Version::New {
            // New must mirror Delta so Swap exchanges stores pairwise.
            let delta = sym.with_version(Version::Delta);
            match catalogue.orders.get(&delta) {
                Some(orders) => orders.clone(),
                None => vec![default_order(key_arity)],
            }
        } else {
            match searches.get(sym) {
                None => vec![default_order(key_arity)],
                Some(set) => {
                    let chains = chain_cover(set);
                    let mut orders: Vec<Vec<usize>> = chains
                        .iter()
                        .map(|chain| order_of_chain(chain, key_arity))
                        .collect();
                    if orders.is_empty() {
                        orders.push(default_order(key_arity));
                    }
                    orders
                }
            }
        };
        catalogue.orders.insert(sym.clone(), orders);
    }
    catalogue
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalog_ast::{Denotation, PredSym};

    fn set(cols: &[usize]) -> BTreeSet<usize> {
        cols.iter().copied().collect()
    }

    #[test]
    fn test_chain_cover_nested_sets_form_one_chain() {
        let searches: BTreeSet<BTreeSet<usize>> =
            [set(&[0]), set(&[0, 1]), set(&[0, 1, 2])].into_iter().collect();
        let chains = chain_cover(&searches);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].len(), 3);
        assert_eq!(order_of_chain(&chains[0], 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_chain_cover_incomparable_sets_need_two_indexes() {
        let searches: BTreeSet<BTreeSet<usize>> = [set(&[0]), set(&[1])].into_iter().collect();
        let chains = chain_cover(&searches);
        assert_eq!(chains.len(), 2);
    }

    #[test]
    fn test_diamond_needs_two_chains() {
        // {0} and {1} both below {0,1}: two chains, one absorbing {0,1}.
        let searches: BTreeSet<BTreeSet<usize>> =
            [set(&[0]), set(&[1]), set(&[0, 1])].into_iter().collect();
        let chains = chain_cover(&searches);
        assert_eq!(chains.len(), 2);
        let covered: usize = chains.iter().map(|c| c.len()).sum();
        assert_eq!(covered, 3);
    }

    #[test]
    fn test_every_search_has_a_prefix_index() {
        let rel = RelSym::new(PredSym::new("R", 0), 3, Denotation::Relational);
        let sym = RamSym::full(rel.clone());
        let op = RelOp::Query {
            rv: datalog_ast::RowVar(0),
            rel: sym.clone(),
            prefix: vec![(1, ram_ir::RamTerm::Lit(datalog_ast::Boxed::Int64(1)))],
            body: Box::new(RelOp::Project {
                terms: vec![],
                rel: sym.clone(),
                rule: 0,
            }),
        };
        let catalogue = select_indexes(&RamStmt::Insert(op), &[rel]);
        let idx = catalogue.index_for(&sym, &set(&[1]));
        let order = &catalogue.orders_of(&sym)[idx];
        assert_eq!(order[0], 1);
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_new_inherits_delta_orders() {
        let rel = RelSym::new(PredSym::new("R", 0), 2, Denotation::Relational);
        let delta = RamSym::delta(rel.clone());
        let new = RamSym::new_ver(rel.clone());
        let op = RelOp::Query {
            rv: datalog_ast::RowVar(0),
            rel: delta.clone(),
            prefix: vec![(1, ram_ir::RamTerm::Lit(datalog_ast::Boxed::Int64(1)))],
            body: Box::new(RelOp::Project {
                terms: vec![],
                rel: new.clone(),
                rule: 0,
            }),
        };
        let stmt = RamStmt::Seq(vec![
            RamStmt::Insert(op),
            RamStmt::Swap {
                a: new.clone(),
                b: delta.clone(),
            },
        ]);
        let catalogue = select_indexes(&stmt, &[rel]);
        assert_eq!(catalogue.orders_of(&new), catalogue.orders_of(&delta));
        assert_eq!(catalogue.orders_of(&delta)[0][0], 1);
    }
}
