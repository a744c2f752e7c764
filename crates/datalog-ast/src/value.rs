//! Boxed runtime values and lattice denotations
//!
//! A `Boxed` value is a closed sum over the primitive kinds the engine can
//! store in a relation, plus `NoValue` - the payload used for relational
//! (valueless) tuples. Structured host values (lattice elements such as
//! constant-propagation cells or dual-ordered integers) are represented with
//! the `Vector` and `Tag` variants so they stay comparable and hashable.
//!
//! Ordering and equality respect the underlying type. Comparing values of
//! different variants is a bug in the caller and aborts.

use crate::symbols::Symbol;
use internment::Intern;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A runtime value as seen by the embedding layer.
#[derive(Debug, Clone)]
pub enum Boxed {
    /// Payload sentinel for relational tuples.
    NoValue,
    Bool(bool),
    Char(char),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Str(Symbol),
    /// Ordered collection, e.g. a set-shaped lattice element.
    Vector(Vec<Boxed>),
    /// Tagged host value, e.g. `Cst(51)` or `Down(3)`.
    Tag(Symbol, Vec<Boxed>),
}

impl Boxed {
    /// Convenience constructor for interned strings.
    pub fn str(s: impl Into<String>) -> Self {
        Boxed::Str(Intern::new(s.into()))
    }

    /// Convenience constructor for tagged values.
    pub fn tag(name: impl Into<String>, args: Vec<Boxed>) -> Self {
        Boxed::Tag(Intern::new(name.into()), args)
    }

    /// Short name of the variant, used in bug reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Boxed::NoValue => "NoValue",
            Boxed::Bool(_) => "Bool",
            Boxed::Char(_) => "Char",
            Boxed::Int32(_) => "Int32",
            Boxed::Int64(_) => "Int64",
            Boxed::Float64(_) => "Float64",
            Boxed::Str(_) => "Str",
            Boxed::Vector(_) => "Vector",
            Boxed::Tag(_, _) => "Tag",
        }
    }

    /// Whether the two values inhabit the same variant.
    pub fn same_kind(&self, other: &Boxed) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl PartialEq for Boxed {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Boxed::NoValue, Boxed::NoValue) => true,
            (Boxed::Bool(a), Boxed::Bool(b)) => a == b,
            (Boxed::Char(a), Boxed::Char(b)) => a == b,
            (Boxed::Int32(a), Boxed::Int32(b)) => a == b,
            (Boxed::Int64(a), Boxed::Int64(b)) => a == b,
            (Boxed::Float64(a), Boxed::Float64(b)) => a.to_bits() == b.to_bits(),
            (Boxed::Str(a), Boxed::Str(b)) => a == b,
            (Boxed::Vector(a), Boxed::Vector(b)) => a == b,
            (Boxed::Tag(ta, a), Boxed::Tag(tb, b)) => ta == tb && a == b,
            _ => false,
        }
    }
}

impl Eq for Boxed {}

impl PartialOrd for Boxed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Boxed {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Boxed::NoValue, Boxed::NoValue) => Ordering::Equal,
            (Boxed::Bool(a), Boxed::Bool(b)) => a.cmp(b),
            (Boxed::Char(a), Boxed::Char(b)) => a.cmp(b),
            (Boxed::Int32(a), Boxed::Int32(b)) => a.cmp(b),
            (Boxed::Int64(a), Boxed::Int64(b)) => a.cmp(b),
            (Boxed::Float64(a), Boxed::Float64(b)) => {
                a.partial_cmp(b).unwrap_or_else(|| a.to_bits().cmp(&b.to_bits()))
            }
            (Boxed::Str(a), Boxed::Str(b)) => a.as_ref().cmp(b.as_ref()),
            (Boxed::Vector(a), Boxed::Vector(b)) => a.cmp(b),
            (Boxed::Tag(ta, a), Boxed::Tag(tb, b)) => {
                ta.as_ref().cmp(tb.as_ref()).then_with(|| a.cmp(b))
            }
            (a, b) => panic!(
                "bug: ordering {} against {} at one position",
                a.kind(),
                b.kind()
            ),
        }
    }
}

impl std::hash::Hash for Boxed {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Boxed::NoValue => 0u8.hash(state),
            Boxed::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Boxed::Char(c) => {
                2u8.hash(state);
                c.hash(state);
            }
            Boxed::Int32(i) => {
                3u8.hash(state);
                i.hash(state);
            }
            Boxed::Int64(i) => {
                4u8.hash(state);
                i.hash(state);
            }
            Boxed::Float64(f) => {
                5u8.hash(state);
                f.to_bits().hash(state);
            }
            Boxed::Str(s) => {
                6u8.hash(state);
                s.hash(state);
            }
            Boxed::Vector(v) => {
                7u8.hash(state);
                v.hash(state);
            }
            Boxed::Tag(t, v) => {
                8u8.hash(state);
                t.hash(state);
                v.hash(state);
            }
        }
    }
}

impl fmt::Display for Boxed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boxed::NoValue => write!(f, "()"),
            Boxed::Bool(b) => write!(f, "{}", b),
            Boxed::Char(c) => write!(f, "'{}'", c),
            Boxed::Int32(i) => write!(f, "{}", i),
            Boxed::Int64(i) => write!(f, "{}", i),
            Boxed::Float64(v) => write!(f, "{}", v),
            Boxed::Str(s) => write!(f, "\"{}\"", s),
            Boxed::Vector(v) => {
                write!(f, "[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", x)?;
                }
                write!(f, "]")
            }
            Boxed::Tag(t, v) => {
                write!(f, "{}", t)?;
                if !v.is_empty() {
                    write!(f, "(")?;
                    for (i, x) in v.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", x)?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

/// Shared function over boxed values, `(args) -> value`.
pub type BoxedFn = Arc<dyn Fn(&[Boxed]) -> Boxed + Send + Sync>;
/// Shared predicate over boxed values.
pub type BoxedPred = Arc<dyn Fn(&[Boxed]) -> bool + Send + Sync>;
/// Shared binary predicate, used for the lattice partial order.
pub type BoxedPred2 = Arc<dyn Fn(&Boxed, &Boxed) -> bool + Send + Sync>;
/// Shared binary operation, used for lattice join and meet.
pub type BoxedOp2 = Arc<dyn Fn(&Boxed, &Boxed) -> Boxed + Send + Sync>;
/// Shared generator over boxed values, `(args) -> rows`.
pub type BoxedGen = Arc<dyn Fn(&[Boxed]) -> Vec<Vec<Boxed>> + Send + Sync>;

/// The bounded semi-lattice a `Latticenal` relation maps its keys into.
#[derive(Clone)]
pub struct LatticeOps {
    /// Least element. Tuples whose value is `bot` are never materialized.
    pub bot: Boxed,
    /// Partial order.
    pub leq: BoxedPred2,
    /// Least upper bound (join).
    pub lub: BoxedOp2,
    /// Greatest lower bound (meet).
    pub glb: BoxedOp2,
}

impl LatticeOps {
    pub fn new(bot: Boxed, leq: BoxedPred2, lub: BoxedOp2, glb: BoxedOp2) -> Self {
        LatticeOps { bot, leq, lub, glb }
    }

    /// Whether `v` is the least element.
    pub fn is_bot(&self, v: &Boxed) -> bool {
        (self.leq)(v, &self.bot)
    }
}

impl fmt::Debug for LatticeOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatticeOps").field("bot", &self.bot).finish()
    }
}

/// Whether a relation denotes a set of tuples or a map into a lattice.
#[derive(Debug, Clone)]
pub enum Denotation {
    Relational,
    Latticenal(LatticeOps),
}

impl Denotation {
    pub fn is_lattice(&self) -> bool {
        matches!(self, Denotation::Latticenal(_))
    }

    /// The lattice operations, if any.
    pub fn lattice(&self) -> Option<&LatticeOps> {
        match self {
            Denotation::Relational => None,
            Denotation::Latticenal(ops) => Some(ops),
        }
    }
}
