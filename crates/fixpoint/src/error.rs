//! Solver errors
//!
//! User-facing failures only: unstratifiable programs, malformed injected
//! rows and provenance restrictions. Internal invariant breaches (missing
//! indexes, mixed value kinds at one position, condensation cycles) are
//! bugs and abort instead of surfacing here.

use datalog_stratify::StratificationError;
use ram_compile::ProvenanceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixpointError {
    /// The program has a cycle through negation.
    Stratification(StratificationError),
    /// The program cannot be augmented with provenance.
    Provenance(ProvenanceError),
    /// Malformed injected input (wrong arity, non-literal fact head).
    InvalidInput(String),
}

impl std::fmt::Display for FixpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixpointError::Stratification(e) => write!(f, "Stratification error: {}", e),
            FixpointError::Provenance(e) => write!(f, "Provenance error: {}", e),
            FixpointError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

impl std::error::Error for FixpointError {}

impl From<StratificationError> for FixpointError {
    fn from(e: StratificationError) -> Self {
        FixpointError::Stratification(e)
    }
}

impl From<ProvenanceError> for FixpointError {
    fn from(e: ProvenanceError) -> Self {
        FixpointError::Provenance(e)
    }
}
