//! Pipeline stages.
//!
//! Each stage renders its prompt, sends it through the provider pool and
//! decodes the completion. Stages never retry; the orchestrator decides
//! whether an unparseable completion earns a reformat retry.

mod explainer;
mod router;
mod solver;
mod traits;
mod verifier;

pub use explainer::{Explainer, ExplainerInput};
pub use router::Router;
pub use solver::{Solver, SolverInput};
pub use traits::{ProviderTrail, Stage, StageContext, StageError, StageRun};
pub use verifier::{decide, Verifier, VerifierInput};
