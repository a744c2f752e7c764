//! Executable (lowered) RAM
//!
//! The lowering phase resolves every symbolic reference of the high-level
//! RAM to a dense slot: row variables become tuple-register indices,
//! relations become positions in a flat relation table, and literal equality
//! constants become `ConstWrite`s stamped into the search-tuple bounds once
//! at start-up. The interpreter executes this form without any hashing or
//! dictionary lookups.

use datalog_ast::{Boxed, Denotation, LatticeOps, NamedFn, NamedGen, NamedPred, RamSym};
use std::fmt;

/// Declaration of one relation store.
#[derive(Debug, Clone)]
pub struct RelDecl {
    pub sym: RamSym,
    /// Number of orderable key attributes.
    pub key_arity: usize,
    /// Full width of the canonical tuple, including provenance columns.
    pub tuple_arity: usize,
    pub den: Denotation,
    /// Index key orders; `orders[0]` is the primary index.
    pub orders: Vec<Vec<usize>>,
}

/// Stamp `value` into the min and max search tuple of `rv` at `col` before
/// execution starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstWrite {
    pub rv: usize,
    pub col: usize,
    pub value: i64,
}

/// After binding a tuple for the owning row variable, copy its attribute
/// `src_col` into the min and max search tuple of `dst_rv` at `dst_col`.
/// Write lists replace runtime environment lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Write {
    pub src_col: usize,
    pub dst_rv: usize,
    pub dst_col: usize,
}

/// A complete lowered program.
#[derive(Debug, Clone)]
pub struct ExecProgram {
    pub relations: Vec<RelDecl>,
    /// Width of each tuple register.
    pub rv_arities: Vec<usize>,
    pub const_writes: Vec<ConstWrite>,
    /// Number of join-size profile buffers referenced by the program.
    pub profile_bufs: usize,
    pub stmt: ExecStmt,
}

/// A lowered statement.
#[derive(Debug, Clone)]
pub enum ExecStmt {
    Insert(ExecOp),
    MergeInto { src: usize, dst: usize },
    Swap { a: usize, b: usize },
    Purge { rel: usize },
    Seq(Vec<ExecStmt>),
    Par(Vec<ExecStmt>),
    Until { conds: Vec<ExecBool>, body: Box<ExecStmt> },
    EstimateJoinSize { buf: usize, rel: usize, attrs: Vec<usize> },
    Comment(String),
}

/// A lowered relation operation.
#[derive(Debug, Clone)]
pub enum ExecOp {
    /// Full scan of the primary index of `rel`.
    Search {
        rv: usize,
        rel: usize,
        writes: Vec<Write>,
        body: Box<ExecOp>,
    },
    /// Range scan of index `index` of `rel` between the min and max search
    /// tuples of `rv`.
    Query {
        rv: usize,
        rel: usize,
        index: usize,
        writes: Vec<Write>,
        body: Box<ExecOp>,
    },
    /// Bind `rv` to each output row of the generator; outputs are unboxed
    /// through the listed unified positions.
    Functional {
        rv: usize,
        gen: NamedGen,
        args: Vec<LatTerm>,
        out_pos: Vec<usize>,
        writes: Vec<Write>,
        body: Box<ExecOp>,
    },
    /// Evaluate and insert. `extra` holds provenance columns when enabled.
    Project {
        key: Vec<KeyTerm>,
        extra: Vec<KeyTerm>,
        payload: Option<LatTerm>,
        rel: usize,
    },
    If {
        conds: Vec<ExecBool>,
        body: Box<ExecOp>,
    },
}

/// Term in the unboxed key domain.
#[derive(Debug, Clone)]
pub enum KeyTerm {
    Const(i64),
    RowLoad { rv: usize, col: usize },
    /// Host function; boxed arguments, result unboxed through `out_pos`.
    App {
        f: NamedFn,
        args: Vec<LatTerm>,
        out_pos: usize,
    },
    /// One more than the maximum of the listed `(rv, depth column)` values.
    ProvMax(Vec<(usize, usize)>),
}

/// Term in the boxed payload domain.
#[derive(Debug, Clone)]
pub enum LatTerm {
    Lit(Boxed),
    /// Box key attribute `col` of `rv` through unified position `pos`.
    BoxLoad { rv: usize, col: usize, pos: usize },
    /// Fold the lattice payloads of the row vars with the meet.
    Meet { rvs: Vec<usize>, ops: LatticeOps },
    App { f: NamedFn, args: Vec<LatTerm> },
}

/// A lowered boolean guard.
#[derive(Debug, Clone)]
pub enum ExecBool {
    Not(Box<ExecBool>),
    IsEmpty { rel: usize },
    /// Key absent from `rel`; for lattice relations `value` must not be
    /// subsumed by the stored value.
    NotMemberOf {
        key: Vec<KeyTerm>,
        value: Option<LatTerm>,
        rel: usize,
    },
    Eq(KeyTerm, KeyTerm),
    Leq {
        lower: LatTerm,
        value: LatTerm,
        ops: LatticeOps,
    },
    NotBot { value: LatTerm, ops: LatticeOps },
    Guard { f: NamedPred, args: Vec<LatTerm> },
}

// ---------------------------------------------------------------------------
// Printing, used by the post-lowering debug dump.
// ---------------------------------------------------------------------------

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        write!(f, "    ")?;
    }
    Ok(())
}

impl fmt::Display for KeyTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyTerm::Const(v) => write!(f, "{}", v),
            KeyTerm::RowLoad { rv, col } => write!(f, "r{}[{}]", rv, col),
            KeyTerm::App { f: func, args, .. } => {
                write!(f, "{:?}(", func)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            KeyTerm::ProvMax(loads) => write!(f, "1 + max-depth{:?}", loads),
        }
    }
}

impl fmt::Display for LatTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatTerm::Lit(v) => write!(f, "{}", v),
            LatTerm::BoxLoad { rv, col, .. } => write!(f, "box(r{}[{}])", rv, col),
            LatTerm::Meet { rvs, .. } => write!(f, "⨅{:?}", rvs),
            LatTerm::App { f: func, args } => {
                write!(f, "{:?}(", func)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for ExecBool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecBool::Not(inner) => write!(f, "not ({})", inner),
            ExecBool::IsEmpty { rel } => write!(f, "isEmpty(#{})", rel),
            ExecBool::NotMemberOf { key, rel, .. } => {
                write!(f, "(")?;
                for (i, t) in key.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ") ∉ #{}", rel)
            }
            ExecBool::Eq(a, b) => write!(f, "{} == {}", a, b),
            ExecBool::Leq { lower, value, .. } => write!(f, "{} ⊑ {}", lower, value),
            ExecBool::NotBot { value, .. } => write!(f, "{} != ⊥", value),
            ExecBool::Guard { f: func, args } => {
                write!(f, "{:?}(", func)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl ExecOp {
    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            ExecOp::Search {
                rv, rel, writes, body,
            } => {
                indent(f, depth)?;
                writeln!(f, "search r{} ∈ #{} writes={:?}", rv, rel, writes)?;
                body.fmt_depth(f, depth + 1)
            }
            ExecOp::Query {
                rv,
                rel,
                index,
                writes,
                body,
            } => {
                indent(f, depth)?;
                writeln!(
                    f,
                    "query r{} ∈ #{}.idx{} writes={:?}",
                    rv, rel, index, writes
                )?;
                body.fmt_depth(f, depth + 1)
            }
            ExecOp::Functional { rv, gen, body, .. } => {
                indent(f, depth)?;
                writeln!(f, "loop r{} <- {:?}", rv, gen)?;
                body.fmt_depth(f, depth + 1)
            }
            ExecOp::Project {
                key,
                extra,
                payload,
                rel,
            } => {
                indent(f, depth)?;
                write!(f, "project (")?;
                for (i, t) in key.iter().chain(extra.iter()).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                if let Some(p) = payload {
                    write!(f, "; {}", p)?;
                }
                writeln!(f, ") into #{}", rel)
            }
            ExecOp::If { conds, body } => {
                indent(f, depth)?;
                let cs: Vec<String> = conds.iter().map(|c| format!("{}", c)).collect();
                writeln!(f, "if ({}) then", cs.join(" ∧ "))?;
                body.fmt_depth(f, depth + 1)
            }
        }
    }
}

impl ExecStmt {
    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            ExecStmt::Insert(op) => op.fmt_depth(f, depth),
            ExecStmt::MergeInto { src, dst } => {
                indent(f, depth)?;
                writeln!(f, "merge #{} into #{}", src, dst)
            }
            ExecStmt::Swap { a, b } => {
                indent(f, depth)?;
                writeln!(f, "swap #{} and #{}", a, b)
            }
            ExecStmt::Purge { rel } => {
                indent(f, depth)?;
                writeln!(f, "purge #{}", rel)
            }
            ExecStmt::Seq(stmts) => {
                for s in stmts {
                    s.fmt_depth(f, depth)?;
                }
                Ok(())
            }
            ExecStmt::Par(stmts) => {
                indent(f, depth)?;
                writeln!(f, "par")?;
                for s in stmts {
                    s.fmt_depth(f, depth + 1)?;
                }
                Ok(())
            }
            ExecStmt::Until { conds, body } => {
                indent(f, depth)?;
                let cs: Vec<String> = conds.iter().map(|c| format!("{}", c)).collect();
                writeln!(f, "until ({}) do", cs.join(" ∧ "))?;
                body.fmt_depth(f, depth + 1)
            }
            ExecStmt::EstimateJoinSize { buf, rel, attrs } => {
                indent(f, depth)?;
                writeln!(f, "estimate-join-size #{} rel=#{} on {:?}", buf, rel, attrs)
            }
            ExecStmt::Comment(text) => {
                indent(f, depth)?;
                writeln!(f, "// {}", text)
            }
        }
    }
}

impl fmt::Display for ExecProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "relations:")?;
        for (i, decl) in self.relations.iter().enumerate() {
            writeln!(
                f,
                "    #{} {} key={} arity={} orders={:?}",
                i, decl.sym, decl.key_arity, decl.tuple_arity, decl.orders
            )?;
        }
        if !self.const_writes.is_empty() {
            writeln!(f, "const-writes: {:?}", self.const_writes)?;
        }
        writeln!(f, "program:")?;
        self.stmt.fmt_depth(f, 1)
    }
}
