//! Prompt templates for the pipeline stages.
//!
//! Each prompt is a shared preamble plus a stage template. Templates use
//! `{{field}}` placeholders; [`render`] is pure and fills missing or blank
//! fields with `(none)`.
//!
//! Every rendered prompt starts with a `Task:` line naming the stage.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

use mathpipe_core::StageKind;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{([a-z_]+)\}\}").unwrap();
}

/// Named values substituted into a template.
pub type PromptFields = BTreeMap<&'static str, String>;

/// Preamble shared by every stage.
pub const BASE_PROMPT: &str = r#"
You are one stage of a math tutoring pipeline. Other stages check your work.

## Constraints
1. Respond with a single JSON object and nothing else
2. Do not wrap the JSON in prose; a code fence is tolerated but not needed
3. Use plain ASCII math notation (x^2, sqrt(2), 3/4)
4. If you are unsure, say so through the confidence field instead of guessing
"#;

const ROUTER_TEMPLATE: &str = r#"Task: classify the math problem below.
{{base}}
## Problem
{{problem}}

## Domain hint
{{domain_hint}}

## Output Format (JSON)
{
  "category": "algebra" | "calculus" | "number_theory" | "geometry" | "other",
  "confidence": 0.0-1.0,
  "difficulty": "easy" | "medium" | "hard"
}
"#;

const SOLVER_TEMPLATE: &str = r#"Task: solve the math problem below step by step.
{{base}}
## Problem
{{problem}}

## Classification
Category: {{category}} (difficulty: {{difficulty}})

## Variables
{{variables}}

## Constraints
{{constraints}}

## Requested precision
{{precision}}

## Reference material
{{context}}

## Feedback on your previous attempt
{{feedback}}

## Output Format (JSON)
{
  "steps": [
    {"description": "what this step does", "expression": "a checkable equation such as 2*3 = 6, or empty"}
  ],
  "final_answer": "the answer, e.g. x = 2 or x = 3",
  "tool_requests": ["numeric expressions to evaluate exactly, e.g. 2^10 / 3"]
}

Only put numeric equations without unknowns in "expression" when you want them checked.
"tool_requests" is optional; its results are passed on to the checker.
"#;

const VERIFIER_TEMPLATE: &str = r#"Task: verify the proposed solution below.
{{base}}
## Problem
{{problem}}

## Proposed solution
{{steps}}

Final answer: {{final_answer}}

## Tool results reported with the solution
{{tool_results}}

## Instructions
Solve the problem yourself before judging. Do not trust the proposed steps.
Report the answer you derived independently in "derived_answer".

## Output Format (JSON)
{
  "verdict": "correct" | "incorrect" | "uncertain",
  "confidence": 0.0-1.0,
  "issues": ["specific problems found"],
  "derived_answer": "your own answer",
  "suggested_correction": "how to fix the solution, if it is wrong"
}
"#;

const EXPLAINER_TEMPLATE: &str = r#"Task: explain the verified solution below to a student.
{{base}}
## Problem
{{problem}}

## Verified solution
{{steps}}

Final answer: {{final_answer}}

## Output Format (JSON)
{
  "narrative": "a clear explanation of the solution",
  "referenced_steps": [0, 1],
  "key_concepts": ["concepts the student should know"],
  "common_mistakes": ["mistakes to avoid"]
}

Step indices in "referenced_steps" are 0-based and must refer to steps above.
"#;

/// Appended when a stage is re-invoked after unparseable output.
pub const REFORMAT_HINT: &str = r#"
## Reformat required
Your previous response could not be parsed. Reply with exactly one JSON object
matching the output format above. No prose, no comments, no trailing text.
"#;

fn template(stage: StageKind) -> &'static str {
    match stage {
        StageKind::Router => ROUTER_TEMPLATE,
        StageKind::Solver => SOLVER_TEMPLATE,
        StageKind::Verifier => VERIFIER_TEMPLATE,
        StageKind::Explainer => EXPLAINER_TEMPLATE,
    }
}

/// Render the prompt for `stage` from `fields`.
pub fn render(stage: StageKind, fields: &PromptFields) -> String {
    PLACEHOLDER
        .replace_all(template(stage), |caps: &Captures| {
            let name = &caps[1];
            if name == "base" {
                return BASE_PROMPT.to_string();
            }
            match fields.get(name).map(|v| v.trim()) {
                Some(value) if !value.is_empty() => value.to_string(),
                _ => "(none)".to_string(),
            }
        })
        .into_owned()
}

/// Format solution steps as a numbered list (0-based, matching step indices).
pub fn format_steps(steps: &[mathpipe_core::Step]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            if step.expression.is_empty() {
                format!("{}. {}", i, step.description)
            } else {
                format!("{}. {} [{}]", i, step.description, step.expression)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format executed tool calls as bullet lines.
pub fn format_tool_calls(calls: &[mathpipe_core::ToolCall]) -> String {
    calls
        .iter()
        .map(|call| match (call.value, &call.error) {
            (Some(value), _) => format!("- {}: {} = {}", call.tool, call.expression, value),
            (None, Some(error)) => format!("- {}: {} failed ({})", call.tool, call.expression, error),
            (None, None) => format!("- {}: {} not run", call.tool, call.expression),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format a list of strings as bullet lines.
pub fn bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}
