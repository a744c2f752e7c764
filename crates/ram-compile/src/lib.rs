//! Compiler phases lowering stratified Datalog to executable RAM.
//!
//! The phases run in pipeline order: equality closure (`unify`), semi-naive
//! code generation (`codegen`), cleanup (`simplify`), query folding
//! (`hoist`), physical index selection (`index_select`), optional join
//! profiling and reordering (`profiler`/`optimizer`), provenance
//! augmentation (`provenance`) and slot resolution (`lower`). The façade
//! crate drives them; each phase is also usable on its own in tests.

mod codegen;
mod hoist;
mod index_select;
mod lower;
mod optimizer;
mod profiler;
mod provenance;
mod simplify;
mod unify;

pub use codegen::{compile_program, Context};
pub use hoist::hoist;
pub use index_select::{select_indexes, IndexCatalogue};
pub use lower::lower;
pub use optimizer::{instrument, reorder};
pub use profiler::{bernoulli_sample, JoinProfile};
pub use provenance::{augment, ProvenanceError};
pub use simplify::simplify;
pub use unify::{unify_positions, Positions};
