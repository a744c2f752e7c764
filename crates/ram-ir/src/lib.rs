//! Intermediate representations of the relational algebra machine.
//!
//! The high-level RAM (`ast`) is produced by the compiler and rewritten by
//! the optimization phases; the executable RAM (`exec`) is the lowered form
//! the interpreter runs. They are separate types so each phase's output is
//! checkable on its own.

mod ast;
mod exec;

pub use ast::{BoolExp, RamStmt, RamTerm, RelOp};
pub use exec::{
    ConstWrite, ExecBool, ExecOp, ExecProgram, ExecStmt, KeyTerm, LatTerm, RelDecl, Write,
};
