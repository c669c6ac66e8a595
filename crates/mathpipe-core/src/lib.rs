//! # mathpipe-core
//!
//! Deterministic building blocks of the mathpipe solving pipeline.
//!
//! Nothing in this crate talks to a model provider. It holds:
//! - the data model shared by every stage (problems, classifications,
//!   solutions, verification results, the attempt log)
//! - completion parsing: turning raw model text into those types, with JSON
//!   Schema validation per stage
//! - a small arithmetic evaluator used to check solver steps numerically
//!
//! ## Example
//!
//! ```rust
//! use mathpipe_core::{parse_solution, expression};
//!
//! let raw = r#"{"steps": ["Add", {"description": "Sum", "expression": "2 + 2 = 4"}],
//!              "final_answer": "4"}"#;
//! let solution = parse_solution(raw, 1).unwrap();
//! assert_eq!(solution.final_answer, "4");
//! assert_eq!(expression::evaluate("2 + 2").unwrap(), 4.0);
//! ```

pub mod completion;
pub mod expression;
pub mod types;

// Re-export main types at crate root
pub use completion::{
    answers_agree, extract_json, normalize_answer, numeric_answers, parse_classification,
    parse_explanation, parse_solution, parse_verifier_findings, validate_stage_output,
    ModelVerdict, ParseError, VerifierFindings,
};
pub use expression::ExpressionError;
pub use types::{
    AttemptOutcome, AttemptRecord, Category, Classification, ClassificationSource, Difficulty,
    Explanation, FailureKind, PipelineResult, Problem, ProblemMetadata, ProviderAttempt,
    ProviderErrorKind, Solution, SolutionHistory, StageKind, Step, ToolCall, Verdict,
    VerificationResult,
};
