//! Unified positions
//!
//! Every identifier site - a relation column or a rule-variable occurrence -
//! is assigned a *unified position*: the equivalence class of sites that must
//! share one type and one boxing table. Sites are unified when a rule
//! variable occurs at several columns, when a variable flows into the head,
//! and when a functional output or guard argument names a variable. The
//! `Full`, `Delta` and `New` variants of a relation share columns by
//! construction, as do merged or swapped relations, since sites are keyed on
//! the base predicate.
//!
//! The union-find closure computed here governs type inference (mixing
//! boxed kinds inside one class is a bug caught by the value store) and
//! column-compatible storage.

use datalog_ast::{BodyPredicate, BodyTerm, Constraint, HeadTerm, VarSym};
use std::collections::HashMap;

/// A site that needs a boxing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Site {
    /// Column `col` of the relation with base predicate id `pred`.
    Column { pred: u64, col: usize },
    /// A rule variable that occurs at no relation column (functional output
    /// or guard-only variable) in rule `rule`.
    Loose { rule: usize, var: VarSym },
}

/// The computed closure: site -> dense unified position.
#[derive(Debug, Clone, Default)]
pub struct Positions {
    columns: HashMap<(u64, usize), usize>,
    loose: HashMap<(usize, VarSym), usize>,
    count: usize,
}

impl Positions {
    /// Unified position of a relation column.
    pub fn column(&self, pred: u64, col: usize) -> usize {
        *self
            .columns
            .get(&(pred, col))
            .unwrap_or_else(|| panic!("bug: no unified position for predicate {} col {}", pred, col))
    }

    /// Unified position of a rule variable, through whichever column sites
    /// it was unified with.
    pub fn var(&self, rule: usize, var: VarSym) -> usize {
        *self
            .loose
            .get(&(rule, var))
            .unwrap_or_else(|| panic!("bug: no unified position for variable {} of rule {}", var, rule))
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind { parent: Vec::new() }
    }

    fn fresh(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        id
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Compute the equality closure over all identifier sites of a program.
pub fn unify_positions(rules: &[Constraint]) -> Positions {
    let mut uf = UnionFind::new();
    let mut site_ids: HashMap<Site, usize> = HashMap::new();

    let mut id_of = |uf: &mut UnionFind, site: Site| -> usize {
        *site_ids.entry(site).or_insert_with(|| uf.fresh())
    };

    for (rule_idx, rule) in rules.iter().enumerate() {
        // Sites of every variable of this rule, in occurrence order.
        let mut var_sites: HashMap<VarSym, Vec<usize>> = HashMap::new();
        let mut loose_vars: Vec<VarSym> = Vec::new();

        for pred in &rule.body {
            match pred {
                BodyPredicate::Atom { rel, terms, .. } => {
                    for (col, term) in terms.iter().take(rel.key_arity()).enumerate() {
                        let site = id_of(
                            &mut uf,
                            Site::Column {
                                pred: rel.pred.id,
                                col,
                            },
                        );
                        if let BodyTerm::Var(v) = term {
                            var_sites.entry(*v).or_default().push(site);
                        }
                    }
                    // The trailing lattice value is never boxed; its
                    // variable stays loose unless a key column names it.
                }
                BodyPredicate::Guard(_, terms) => {
                    for term in terms {
                        if let BodyTerm::Var(v) = term {
                            loose_vars.push(*v);
                        }
                    }
                }
                BodyPredicate::Functional { outs, ins, .. } => {
                    loose_vars.extend(outs.iter().copied());
                    loose_vars.extend(ins.iter().copied());
                }
            }
        }

        let head = &rule.head;
        for (col, term) in head.terms.iter().take(head.rel.key_arity()).enumerate() {
            let site = id_of(
                &mut uf,
                Site::Column {
                    pred: head.rel.pred.id,
                    col,
                },
            );
            match term {
                HeadTerm::Var(v) => var_sites.entry(*v).or_default().push(site),
                HeadTerm::App(_, args) => loose_vars.extend(args.iter().copied()),
                HeadTerm::Lit(_) => {}
            }
        }

        // Unify all column sites of one variable.
        for sites in var_sites.values() {
            for pair in sites.windows(2) {
                uf.union(pair[0], pair[1]);
            }
        }
        // Variables with no column site get a loose site of their own.
        for v in loose_vars {
            if !var_sites.contains_key(&v) {
                let site = id_of(
                    &mut uf,
                    Site::Loose {
                        rule: rule_idx,
                        var: v,
                    },
                );
                var_sites.entry(v).or_default().push(site);
            }
        }
    }

    // Also make sure every fact column owns a position, even for predicates
    // no rule mentions.
    // (Facts are constraints with literal heads; their head loop above
    // already claimed the sites.)

    // Densify representatives into position numbers.
    let mut repr_pos: HashMap<usize, usize> = HashMap::new();
    let mut out = Positions::default();
    let mut pos_of = |uf: &mut UnionFind, site_id: usize, out: &mut Positions| -> usize {
        let root = uf.find(site_id);
        let next = repr_pos.len();
        *repr_pos.entry(root).or_insert_with(|| {
            out.count = next + 1;
            next
        })
    };

    let sites: Vec<(Site, usize)> = site_ids.iter().map(|(s, &i)| (*s, i)).collect();
    for (site, id) in sites {
        let pos = pos_of(&mut uf, id, &mut out);
        match site {
            Site::Column { pred, col } => {
                out.columns.insert((pred, col), pos);
            }
            Site::Loose { rule, var } => {
                out.loose.insert((rule, var), pos);
            }
        }
    }
    // Variables that unified with column sites resolve through the column
    // map; record them for per-rule lookup as well.
    for (rule_idx, rule) in rules.iter().enumerate() {
        for pred in &rule.body {
            if let BodyPredicate::Atom { rel, terms, .. } = pred {
                for (col, term) in terms.iter().take(rel.key_arity()).enumerate() {
                    if let BodyTerm::Var(v) = term {
                        let pos = out.column(rel.pred.id, col);
                        out.loose.entry((rule_idx, *v)).or_insert(pos);
                    }
                }
            }
        }
        for (col, term) in rule
            .head
            .terms
            .iter()
            .take(rule.head.rel.key_arity())
            .enumerate()
        {
            if let HeadTerm::Var(v) = term {
                let pos = out.column(rule.head.rel.pred.id, col);
                out.loose.entry((rule_idx, *v)).or_insert(pos);
            }
        }
    }

    out
}
