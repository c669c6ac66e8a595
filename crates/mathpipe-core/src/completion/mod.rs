//! Stage completion handling.
//!
//! Raw provider text is extracted, validated against the stage's JSON Schema
//! and decoded into the typed outputs in [`crate::types`].

mod parser;
mod schema;

pub use parser::{
    answers_agree, extract_json, normalize_answer, numeric_answers, parse_classification,
    parse_explanation, parse_solution, parse_verifier_findings, ModelVerdict, ParseError,
    VerifierFindings,
};
pub use schema::validate_stage_output;
