//! Decoding raw completions into typed stage outputs.
//!
//! Models wrap JSON in code fences or prose more often than not. Parsing is
//! strict about shape (schema-validated) but lenient about the wrapper.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use super::schema::validate_stage_output;
use crate::expression;
use crate::types::{
    Category, Classification, Difficulty, Explanation, Solution, StageKind, Step, ToolCall,
};

lazy_static! {
    /// A fenced block, optionally tagged `json`.
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap();

    /// Separators between alternative answers ("x=2 or x=3", "2, 3").
    static ref ANSWER_SEPARATOR: Regex = Regex::new(r"(?i)\s*(?:,|;|\bor\b|\band\b)\s*").unwrap();

    /// A comma grouping digits, as in "1,000".
    static ref THOUSANDS_SEPARATOR: Regex = Regex::new(r"(\d),(\d{3})\b").unwrap();

    /// `name=value` in a whitespace-free alternative.
    static ref ASSIGNMENT: Regex = Regex::new(r"^([a-z_][a-z0-9_]*)=(.+)$").unwrap();
}

/// Errors from completion parsing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Completion contains no JSON object")]
    NoJson,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("{stage} output failed schema validation: {}", .errors.join("; "))]
    Schema { stage: StageKind, errors: Vec<String> },

    #[error("Missing final answer")]
    MissingFinalAnswer,

    #[error("Empty narrative")]
    EmptyNarrative,

    #[error("Step index {index} out of range for {steps} steps")]
    StepOutOfRange { index: usize, steps: usize },
}

/// Extract the JSON object from a completion.
///
/// Tries, in order: the whole text, the first fenced block, and the span
/// between the first `{` and the last `}`.
pub fn extract_json(raw: &str) -> Result<JsonValue, ParseError> {
    let trimmed = raw.trim();

    if let Ok(value @ JsonValue::Object(_)) = serde_json::from_str::<JsonValue>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = FENCED_BLOCK.captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(value @ JsonValue::Object(_)) = serde_json::from_str::<JsonValue>(block.as_str().trim()) {
            return Ok(value);
        }
    }

    let start = trimmed.find('{').ok_or(ParseError::NoJson)?;
    let end = trimmed.rfind('}').ok_or(ParseError::NoJson)?;
    if end < start {
        return Err(ParseError::NoJson);
    }

    match serde_json::from_str::<JsonValue>(&trimmed[start..=end]) {
        Ok(value @ JsonValue::Object(_)) => Ok(value),
        Ok(_) => Err(ParseError::NoJson),
        Err(e) => Err(ParseError::InvalidJson(e.to_string())),
    }
}

fn extract_for(stage: StageKind, raw: &str) -> Result<JsonValue, ParseError> {
    let value = extract_json(raw)?;
    validate_stage_output(stage, &value).map_err(|errors| ParseError::Schema { stage, errors })?;
    Ok(value)
}

fn decode<T: for<'de> Deserialize<'de>>(value: JsonValue) -> Result<T, ParseError> {
    serde_json::from_value(value).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

// ============================================================================
// Router
// ============================================================================

#[derive(Deserialize)]
struct RouterPayload {
    category: String,
    confidence: f64,
    #[serde(default)]
    difficulty: Option<String>,
}

/// Parse a router completion.
///
/// An unrecognised category label is classified as `Other` rather than
/// rejected; out-of-range confidence is clamped.
pub fn parse_classification(raw: &str) -> Result<Classification, ParseError> {
    let payload: RouterPayload = decode(extract_for(StageKind::Router, raw)?)?;

    let category = Category::from_label(&payload.category).unwrap_or_else(|| {
        tracing::debug!(label = %payload.category, "Unknown category label, using other");
        Category::Other
    });
    let difficulty = payload
        .difficulty
        .as_deref()
        .map(Difficulty::from_label)
        .unwrap_or_default();

    Ok(Classification::new(category, payload.confidence).with_difficulty(difficulty))
}

// ============================================================================
// Solver
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum StepPayload {
    Text(String),
    Structured {
        description: String,
        #[serde(default)]
        expression: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolRequestPayload {
    Expression(String),
    Call {
        #[serde(default)]
        tool: String,
        expression: String,
    },
}

#[derive(Deserialize)]
struct SolverPayload {
    steps: Vec<StepPayload>,
    final_answer: String,
    #[serde(default)]
    tool_requests: Vec<ToolRequestPayload>,
}

/// Parse a solver completion into attempt `attempt_number`.
pub fn parse_solution(raw: &str, attempt_number: u32) -> Result<Solution, ParseError> {
    let payload: SolverPayload = decode(extract_for(StageKind::Solver, raw)?)?;

    let final_answer = payload.final_answer.trim().to_string();
    if final_answer.is_empty() {
        return Err(ParseError::MissingFinalAnswer);
    }

    let steps = payload
        .steps
        .into_iter()
        .filter_map(|step| match step {
            StepPayload::Text(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| Step::new(text, ""))
            }
            StepPayload::Structured {
                description,
                expression,
            } => Some(Step::new(description.trim(), expression.trim())),
        })
        .collect();

    let tool_calls = payload
        .tool_requests
        .into_iter()
        .filter_map(|request| {
            let (tool, expression) = match request {
                ToolRequestPayload::Expression(expression) => (String::new(), expression),
                ToolRequestPayload::Call { tool, expression } => (tool, expression),
            };
            let expression = expression.trim();
            (!expression.is_empty()).then(|| ToolCall::requested(tool.trim(), expression))
        })
        .collect();

    Ok(Solution {
        steps,
        final_answer,
        attempt_number,
        tool_calls,
    })
}

// ============================================================================
// Verifier
// ============================================================================

/// The verifier model's raw judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVerdict {
    Correct,
    Incorrect,
    Uncertain,
}

impl ModelVerdict {
    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "correct" | "accepted" | "accept" | "valid" => ModelVerdict::Correct,
            "incorrect" | "rejected" | "reject" | "invalid" | "wrong" => ModelVerdict::Incorrect,
            _ => ModelVerdict::Uncertain,
        }
    }
}

/// Decoded verifier completion, before cross-checks are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierFindings {
    pub verdict: ModelVerdict,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub derived_answer: Option<String>,
    pub suggested_correction: Option<String>,
}

#[derive(Deserialize)]
struct VerifierPayload {
    verdict: String,
    confidence: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    derived_answer: Option<String>,
    #[serde(default)]
    suggested_correction: Option<String>,
}

/// Parse a verifier completion. Unknown verdict labels become `Uncertain`.
pub fn parse_verifier_findings(raw: &str) -> Result<VerifierFindings, ParseError> {
    let payload: VerifierPayload = decode(extract_for(StageKind::Verifier, raw)?)?;

    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    Ok(VerifierFindings {
        verdict: ModelVerdict::from_label(&payload.verdict),
        confidence: payload.confidence.clamp(0.0, 1.0),
        issues: payload
            .issues
            .into_iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect(),
        derived_answer: non_empty(payload.derived_answer),
        suggested_correction: non_empty(payload.suggested_correction),
    })
}

// ============================================================================
// Explainer
// ============================================================================

#[derive(Deserialize)]
struct ExplainerPayload {
    narrative: String,
    #[serde(default)]
    referenced_steps: Vec<usize>,
    #[serde(default)]
    key_concepts: Vec<String>,
    #[serde(default)]
    common_mistakes: Vec<String>,
}

/// Parse an explainer completion for a solution with `step_count` steps.
pub fn parse_explanation(raw: &str, step_count: usize) -> Result<Explanation, ParseError> {
    let payload: ExplainerPayload = decode(extract_for(StageKind::Explainer, raw)?)?;

    let narrative = payload.narrative.trim().to_string();
    if narrative.is_empty() {
        return Err(ParseError::EmptyNarrative);
    }

    if let Some(&index) = payload.referenced_steps.iter().find(|&&i| i >= step_count) {
        return Err(ParseError::StepOutOfRange {
            index,
            steps: step_count,
        });
    }

    Ok(Explanation {
        narrative,
        referenced_steps: payload.referenced_steps,
        key_concepts: payload.key_concepts,
        common_mistakes: payload.common_mistakes,
    })
}

// ============================================================================
// Answer comparison
// ============================================================================

/// Canonical form of an answer: lowercase, whitespace-free alternatives in
/// sorted order, thousands separators and trailing punctuation dropped.
pub fn normalize_answer(answer: &str) -> Vec<String> {
    let lowered = answer.trim().trim_end_matches('.').to_lowercase();
    let lowered = strip_thousands_separators(&lowered);
    let mut parts: Vec<String> = ANSWER_SEPARATOR
        .split(&lowered)
        .map(|part| part.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|part| !part.is_empty())
        .collect();
    parts.sort();
    parts.dedup();
    parts
}

fn strip_thousands_separators(text: &str) -> String {
    let mut current = text.to_string();
    while THOUSANDS_SEPARATOR.is_match(&current) {
        current = THOUSANDS_SEPARATOR
            .replace_all(&current, "${1}${2}")
            .into_owned();
    }
    current
}

/// One alternative of an answer, e.g. `x=3` or `1/2`.
#[derive(Debug, Clone, PartialEq)]
struct AnswerPart {
    name: Option<String>,
    value: String,
    number: Option<f64>,
}

impl AnswerPart {
    fn parse(part: String) -> Self {
        let (name, value) = match ASSIGNMENT.captures(&part) {
            Some(caps) => (Some(caps[1].to_string()), caps[2].to_string()),
            None => (None, part),
        };
        let number = expression::evaluate(&value).ok();
        Self {
            name,
            value,
            number,
        }
    }

    fn matches(&self, other: &AnswerPart) -> bool {
        let names_compatible = match (&self.name, &other.name) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        let values_equal = match (self.number, other.number) {
            (Some(a), Some(b)) => expression::approx_eq(a, b),
            _ => self.value == other.value,
        };
        names_compatible && values_equal
    }
}

fn answer_parts(answer: &str) -> Vec<AnswerPart> {
    normalize_answer(answer)
        .into_iter()
        .map(AnswerPart::parse)
        .collect()
}

/// Numeric values an answer assigns, with the unknown they name if any.
///
/// `"x = 2 or x = 3"` yields `[(Some("x"), 2.0), (Some("x"), 3.0)]`;
/// alternatives that do not evaluate to a number are left out.
pub fn numeric_answers(answer: &str) -> Vec<(Option<String>, f64)> {
    answer_parts(answer)
        .into_iter()
        .filter_map(|part| part.number.map(|n| (part.name, n)))
        .collect()
}

/// Whether two answers agree after normalisation.
///
/// Alternatives are compared as sets. A leading `x =` is optional on either
/// side, and alternatives that evaluate to numbers are compared numerically,
/// so `x = 2 or x = 3` agrees with `2, 3` and `1/2` with `0.5`.
pub fn answers_agree(a: &str, b: &str) -> bool {
    let left = answer_parts(a);
    let right = answer_parts(b);
    if left.is_empty() || right.is_empty() {
        return left.is_empty() && right.is_empty();
    }

    left.iter().all(|l| right.iter().any(|r| l.matches(r)))
        && right.iter().all(|r| left.iter().any(|l| l.matches(r)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_extract_plain_json() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_fenced_json() {
        let raw = "Here you go:\n```json\n{\"category\": \"algebra\", \"confidence\": 0.9}\n```\nDone.";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["category"], "algebra");
    }

    #[test]
    fn test_extract_prose_wrapped_json() {
        let raw = "Sure! {\"final_answer\": \"4\", \"steps\": []} Hope that helps.";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["final_answer"], "4");
    }

    #[test]
    fn test_extract_no_json() {
        assert_eq!(extract_json("The answer is 4."), Err(ParseError::NoJson));
        assert!(matches!(extract_json("{not json}"), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_parse_classification() {
        let c = parse_classification(
            r#"{"category": "algebra_equation", "confidence": 0.92, "difficulty": "easy"}"#,
        )
        .unwrap();
        assert_eq!(c.category, Category::Algebra);
        assert_eq!(c.difficulty, Difficulty::Easy);
        assert!((c.confidence - 0.92).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_classification_unknown_label_is_other() {
        let c = parse_classification(r#"{"category": "astrology", "confidence": 0.8}"#).unwrap();
        assert_eq!(c.category, Category::Other);
    }

    #[test]
    fn test_parse_classification_schema_violation() {
        let err = parse_classification(r#"{"category": "algebra"}"#).unwrap_err();
        assert!(matches!(err, ParseError::Schema { stage: StageKind::Router, .. }));
    }

    #[test]
    fn test_parse_solution_normalizes_steps() {
        let raw = r#"{
            "steps": [
                "Factor the quadratic",
                {"description": "Set each factor to zero", "expression": " (x-2)(x-3) = 0 "},
                "   "
            ],
            "final_answer": " x=2 or x=3 ",
            "tool_requests": []
        }"#;
        let solution = parse_solution(raw, 2).unwrap();
        assert_eq!(solution.attempt_number, 2);
        assert_eq!(solution.final_answer, "x=2 or x=3");
        assert_eq!(solution.steps.len(), 2);
        assert_eq!(solution.steps[0].expression, "");
        assert_eq!(solution.steps[1].expression, "(x-2)(x-3) = 0");
    }

    #[test]
    fn test_parse_solution_blank_answer() {
        let raw = r#"{"steps": ["think"], "final_answer": "   "}"#;
        assert_eq!(parse_solution(raw, 1), Err(ParseError::MissingFinalAnswer));
    }

    #[test]
    fn test_parse_verifier_findings() {
        let raw = r#"{"verdict": "incorrect", "confidence": 0.9, "issues": ["Step 2 sign error", ""],
                      "derived_answer": "x=2 or x=3", "suggested_correction": null}"#;
        let findings = parse_verifier_findings(raw).unwrap();
        assert_eq!(findings.verdict, ModelVerdict::Incorrect);
        assert_eq!(findings.issues, vec!["Step 2 sign error".to_string()]);
        assert_eq!(findings.derived_answer.as_deref(), Some("x=2 or x=3"));
        assert_eq!(findings.suggested_correction, None);
    }

    #[test]
    fn test_parse_verifier_unknown_verdict_is_uncertain() {
        let findings = parse_verifier_findings(r#"{"verdict": "maybe", "confidence": 2.0}"#).unwrap();
        assert_eq!(findings.verdict, ModelVerdict::Uncertain);
        assert_eq!(findings.confidence, 1.0);
    }

    #[test]
    fn test_parse_explanation_checks_step_range() {
        let raw = r#"{"narrative": "We factor, then solve.", "referenced_steps": [0, 3]}"#;
        assert_eq!(
            parse_explanation(raw, 2),
            Err(ParseError::StepOutOfRange { index: 3, steps: 2 })
        );
        assert!(parse_explanation(raw, 4).is_ok());
    }

    #[test]
    fn test_parse_explanation_empty_narrative() {
        assert_eq!(
            parse_explanation(r#"{"narrative": "  "}"#, 1),
            Err(ParseError::EmptyNarrative)
        );
    }

    #[test]
    fn test_answers_agree() {
        assert!(answers_agree("x=2 or x=3", "x = 3, x = 2"));
        assert!(answers_agree("0.5", ".50"));
        assert!(answers_agree("42.", "42"));
        assert!(!answers_agree("x=2 or x=3", "x=2"));
        assert!(!answers_agree("5", "6"));
    }

    #[test]
    fn test_answers_agree_ignores_formatting() {
        assert!(answers_agree("x = 3", "3"));
        assert!(answers_agree("x = 2 or x = 3", "2, 3"));
        assert!(answers_agree("x = 2 or x = 3", "x = 2, 3"));
        assert!(answers_agree("1/2", "0.5"));
        assert!(answers_agree("1,000", "1000"));
        assert!(answers_agree("1,000,000", "10^6"));
        assert!(answers_agree("Infinitely many", "infinitely many"));
    }

    #[test]
    fn test_answers_agree_still_distinguishes() {
        assert!(!answers_agree("x = 1, y = 2", "y = 1, x = 2"));
        assert!(!answers_agree("x = 3", "x = 4"));
        assert!(!answers_agree("2, 3", "2"));
        assert!(!answers_agree("no solution", "3"));
        assert!(!answers_agree("", "3"));
    }

    #[test]
    fn test_normalize_answer_keeps_grouped_digits() {
        assert_eq!(normalize_answer("1,000"), vec!["1000".to_string()]);
        assert_eq!(
            normalize_answer("x = 2, 3"),
            vec!["3".to_string(), "x=2".to_string()]
        );
    }

    #[test]
    fn test_numeric_answers() {
        assert_eq!(
            numeric_answers("x = 2 or x = 3"),
            vec![(Some("x".to_string()), 2.0), (Some("x".to_string()), 3.0)]
        );
        assert_eq!(numeric_answers("1/4"), vec![(None, 0.25)]);
        assert!(numeric_answers("all real numbers").is_empty());
    }

    #[test]
    fn test_parse_solution_tool_requests() {
        let raw = r#"{
            "steps": ["Compute the power"],
            "final_answer": "1024",
            "tool_requests": ["2^10", {"tool": "arithmetic", "expression": " 2^10 "}, "  "]
        }"#;
        let solution = parse_solution(raw, 1).unwrap();
        assert_eq!(
            solution.tool_calls,
            vec![
                ToolCall::requested("", "2^10"),
                ToolCall::requested("arithmetic", "2^10"),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_extract_json_never_panics(raw in ".{0,200}") {
            let _ = extract_json(&raw);
        }

        #[test]
        fn prop_answers_agree_is_symmetric(a in "[0-9xy=, ]{0,20}", b in "[0-9xy=, ]{0,20}") {
            prop_assert_eq!(answers_agree(&a, &b), answers_agree(&b, &a));
        }

        #[test]
        fn prop_parsed_confidence_in_unit_range(conf in -10.0f64..10.0) {
            let raw = format!(r#"{{"category": "geometry", "confidence": {}}}"#, conf);
            let c = parse_classification(&raw).unwrap();
            prop_assert!((0.0..=1.0).contains(&c.confidence));
        }
    }
}
