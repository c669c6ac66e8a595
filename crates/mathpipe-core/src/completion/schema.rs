//! JSON Schema validation for stage completions.
//!
//! Each stage asks the model for a JSON object of a fixed shape. The
//! completion is validated against the stage's schema before it is decoded,
//! so a structurally wrong answer is reported with every violation at once.

use std::sync::OnceLock;

use crate::types::StageKind;

const ROUTER_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["category", "confidence"],
  "properties": {
    "category": { "type": "string", "minLength": 1 },
    "confidence": { "type": "number" },
    "difficulty": { "type": "string" }
  }
}"#;

const SOLVER_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["steps", "final_answer"],
  "properties": {
    "steps": {
      "type": "array",
      "items": {
        "oneOf": [
          { "type": "string" },
          {
            "type": "object",
            "required": ["description"],
            "properties": {
              "description": { "type": "string" },
              "expression": { "type": "string" }
            }
          }
        ]
      }
    },
    "final_answer": { "type": "string" },
    "tool_requests": {
      "type": "array",
      "items": {
        "oneOf": [
          { "type": "string" },
          {
            "type": "object",
            "required": ["expression"],
            "properties": {
              "tool": { "type": "string" },
              "expression": { "type": "string" }
            }
          }
        ]
      }
    }
  }
}"#;

const VERIFIER_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["verdict", "confidence"],
  "properties": {
    "verdict": { "type": "string" },
    "confidence": { "type": "number" },
    "issues": { "type": "array", "items": { "type": "string" } },
    "derived_answer": { "type": ["string", "null"] },
    "suggested_correction": { "type": ["string", "null"] }
  }
}"#;

const EXPLAINER_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["narrative"],
  "properties": {
    "narrative": { "type": "string" },
    "referenced_steps": {
      "type": "array",
      "items": { "type": "integer", "minimum": 0 }
    },
    "key_concepts": { "type": "array", "items": { "type": "string" } },
    "common_mistakes": { "type": "array", "items": { "type": "string" } }
  }
}"#;

type CompiledSchema = OnceLock<Result<jsonschema::Validator, String>>;

static ROUTER: CompiledSchema = OnceLock::new();
static SOLVER: CompiledSchema = OnceLock::new();
static VERIFIER: CompiledSchema = OnceLock::new();
static EXPLAINER: CompiledSchema = OnceLock::new();

fn compile(source: &str) -> Result<jsonschema::Validator, String> {
    let schema_value: serde_json::Value =
        serde_json::from_str(source).map_err(|e| format!("Invalid schema JSON: {}", e))?;

    jsonschema::options()
        .build(&schema_value)
        .map_err(|e| format!("Failed to compile schema: {}", e))
}

fn validator(stage: StageKind) -> Result<&'static jsonschema::Validator, String> {
    let (cell, source) = match stage {
        StageKind::Router => (&ROUTER, ROUTER_SCHEMA),
        StageKind::Solver => (&SOLVER, SOLVER_SCHEMA),
        StageKind::Verifier => (&VERIFIER, VERIFIER_SCHEMA),
        StageKind::Explainer => (&EXPLAINER, EXPLAINER_SCHEMA),
    };

    cell.get_or_init(|| compile(source)).as_ref().map_err(|e| e.clone())
}

/// Validate a decoded completion against the stage's schema.
///
/// Returns every violation, formatted with its instance path.
pub fn validate_stage_output(
    stage: StageKind,
    value: &serde_json::Value,
) -> Result<(), Vec<String>> {
    let validator = validator(stage).map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
