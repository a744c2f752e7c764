//! Core data model for the fixpoint engine: boxed values, lattice
//! denotations, predicate symbols and the Datalog AST.

mod ast;
mod symbols;
mod value;

pub use ast::{
    BodyPredicate, BodyTerm, Constraint, Datalog, Fixity, HeadAtom, HeadTerm, Model, NamedFn,
    NamedGen, NamedPred, Polarity, Program,
};
pub use symbols::{PredSym, PredicateRegistry, RamSym, RelSym, RowVar, Symbol, VarSym, Version};
pub use value::{
    Boxed, BoxedFn, BoxedGen, BoxedOp2, BoxedPred, BoxedPred2, Denotation, LatticeOps,
};
