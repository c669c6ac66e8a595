//! Independent verification of a candidate solution.
//!
//! The verifier model is asked to solve the problem on its own and report
//! the answer it derived. Acceptance then requires all of:
//! - a `correct` verdict
//! - confidence at or above `min_verifier_confidence`
//! - agreement between the derived answer (when given) and the final answer
//! - every numeric step check passing
//! - the final answer satisfying the problem's equation, when it states one
//!   with a single unknown
//!
//! Step checks run through the [`MathTool`]; only `lhs = rhs` expressions
//! without unknowns are checked.

use async_trait::async_trait;
use std::sync::Arc;

use mathpipe_core::{
    answers_agree, parse_verifier_findings, ModelVerdict, Problem, Solution, StageKind,
    VerificationResult, VerifierFindings,
};

use super::traits::{complete_and_parse, Stage, StageContext, StageError, StageRun};
use crate::prompts::{self, format_steps, format_tool_calls, PromptFields};
use crate::providers::CompletionOptions;
use crate::tools::{check_answer, check_equation, AnswerCheck, EquationCheck, MathTool, ToolError};

/// Sampling temperature for verification requests.
const VERIFIER_TEMPERATURE: f32 = 0.1;

/// Input for one verification.
#[derive(Debug, Clone)]
pub struct VerifierInput {
    pub problem: Problem,
    pub solution: Solution,
}

/// Judges a [`Solution`] with a model plus numeric step checks.
#[derive(Clone)]
pub struct Verifier {
    tool: Arc<dyn MathTool>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("tool", &self.tool.name())
            .finish()
    }
}

impl Verifier {
    pub fn new(tool: Arc<dyn MathTool>) -> Self {
        Self { tool }
    }

    /// Check every step expression; returns one reason per failed check.
    async fn check_steps(&self, solution: &Solution) -> Vec<String> {
        let mut failures = Vec::new();
        for (index, step) in solution.steps.iter().enumerate() {
            if step.expression.is_empty() {
                continue;
            }
            match check_equation(self.tool.as_ref(), &step.expression).await {
                Ok(EquationCheck::Holds) | Ok(EquationCheck::NotCheckable) => {}
                Ok(EquationCheck::Fails { lhs, rhs }) => failures.push(format!(
                    "step {} does not hold: {} evaluates to {} = {}",
                    index, step.expression, lhs, rhs
                )),
                Err(ToolError::SyntaxError(reason)) => {
                    tracing::debug!(step = index, expression = %step.expression, reason = %reason, "Step not checkable");
                }
                Err(e @ ToolError::Timeout(_)) => {
                    tracing::warn!(step = index, expression = %step.expression, error = %e, "Step check skipped");
                }
            }
        }
        failures
    }
}

/// Substitute the final answer into the problem; one reason if it fails.
fn check_final_answer(problem: &Problem, solution: &Solution) -> Option<String> {
    match check_answer(&problem.text, &solution.final_answer) {
        AnswerCheck::Violates {
            equation,
            value,
            lhs,
            rhs,
        } => Some(format!(
            "final answer value {} does not satisfy {}: {} = {}",
            value, equation, lhs, rhs
        )),
        AnswerCheck::Satisfies | AnswerCheck::NotCheckable => None,
    }
}

/// Combine the model's findings with the numeric checks into a verdict.
pub fn decide(
    findings: VerifierFindings,
    solution: &Solution,
    min_confidence: f64,
    check_failures: Vec<String>,
) -> VerificationResult {
    let mut reasons = Vec::new();

    match findings.verdict {
        ModelVerdict::Correct => {}
        ModelVerdict::Incorrect => reasons.push("verifier judged the solution incorrect".to_string()),
        ModelVerdict::Uncertain => reasons.push("verifier could not confirm the solution".to_string()),
    }

    if findings.confidence < min_confidence {
        reasons.push(format!(
            "verifier confidence {:.2} is below the required {:.2}",
            findings.confidence, min_confidence
        ));
    }

    if let Some(derived) = &findings.derived_answer {
        if !answers_agree(derived, &solution.final_answer) {
            reasons.push(format!(
                "independently derived answer '{}' disagrees with '{}'",
                derived, solution.final_answer
            ));
        }
    }

    reasons.extend(check_failures);

    if reasons.is_empty() {
        return VerificationResult {
            derived_answer: findings.derived_answer,
            ..VerificationResult::accepted(findings.confidence)
        };
    }

    let mut all_reasons = findings.issues;
    all_reasons.extend(reasons);
    VerificationResult {
        suggested_correction: findings.suggested_correction,
        derived_answer: findings.derived_answer,
        ..VerificationResult::rejected(all_reasons, findings.confidence)
    }
}

#[async_trait]
impl Stage for Verifier {
    type Input = VerifierInput;
    type Output = VerificationResult;

    fn kind(&self) -> StageKind {
        StageKind::Verifier
    }

    fn input_ref(&self, input: &VerifierInput) -> String {
        format!("solution#{}", input.solution.attempt_number)
    }

    fn output_ref(&self, output: &VerificationResult) -> String {
        if output.is_accepted() {
            "verdict:accepted".to_string()
        } else {
            format!("verdict:rejected({} reasons)", output.reasons.len())
        }
    }

    async fn run(
        &self,
        input: &VerifierInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageRun<VerificationResult>, StageError> {
        let mut fields = PromptFields::new();
        fields.insert("problem", input.problem.text.clone());
        fields.insert("steps", format_steps(&input.solution.steps));
        fields.insert("final_answer", input.solution.final_answer.clone());
        fields.insert("tool_results", format_tool_calls(&input.solution.tool_calls));

        let options = CompletionOptions {
            temperature: VERIFIER_TEMPERATURE,
            ..ctx.config.completion.clone()
        };
        let prompt = prompts::render(StageKind::Verifier, &fields);
        let run = complete_and_parse(
            StageKind::Verifier,
            prompt,
            &options,
            ctx,
            parse_verifier_findings,
        )
        .await?;

        let mut check_failures = self.check_steps(&input.solution).await;
        check_failures.extend(check_final_answer(&input.problem, &input.solution));
        let verdict = decide(
            run.output,
            &input.solution,
            ctx.config.min_verifier_confidence,
            check_failures,
        );
        tracing::debug!(
            attempt = input.solution.attempt_number,
            accepted = verdict.is_accepted(),
            reasons = verdict.reasons.len(),
            "Verification finished"
        );

        Ok(StageRun {
            output: verdict,
            provider_used: run.provider_used,
            provider_attempts: run.provider_attempts,
        })
    }
}
