//! Interpreter for the lowered relational algebra machine.

mod machine;

pub use machine::{Env, Machine, RelStore, RunStats};
