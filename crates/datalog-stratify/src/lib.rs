//! Precedence analysis and stratification for Datalog programs.

mod precedence;
mod stratify;

pub use precedence::{EdgeKind, PrecedenceGraph};
pub use stratify::{stratify, Stratification, StratificationError};
