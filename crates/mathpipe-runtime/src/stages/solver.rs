//! Step-by-step solving.
//!
//! Expressions the model lists under `tool_requests` are evaluated with the
//! [`MathTool`] and kept on the [`Solution`], so the verifier sees exact
//! values instead of the model's arithmetic.

use async_trait::async_trait;
use std::sync::Arc;

use mathpipe_core::{
    parse_solution, Classification, Problem, Solution, StageKind, ToolCall, VerificationResult,
};

use super::traits::{complete_and_parse, Stage, StageContext, StageError, StageRun};
use crate::prompts::{self, bullets, PromptFields};
use crate::tools::MathTool;

/// Tool requests beyond this many are dropped.
const MAX_TOOL_CALLS: usize = 16;

/// Input for one solver attempt.
#[derive(Debug, Clone)]
pub struct SolverInput {
    pub problem: Problem,
    pub classification: Classification,
    /// 1-based; increments on every retry
    pub attempt_number: u32,
    /// Verifier feedback on the previous attempt
    pub feedback: Option<VerificationResult>,
}

/// Produces a [`Solution`] for a classified problem.
#[derive(Clone)]
pub struct Solver {
    tool: Arc<dyn MathTool>,
}

impl std::fmt::Debug for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Solver")
            .field("tool", &self.tool.name())
            .finish()
    }
}

impl Solver {
    pub fn new(tool: Arc<dyn MathTool>) -> Self {
        Self { tool }
    }

    /// Run the requested tool calls in order, recording a value or an error
    /// on each. Requests naming another tool are not run.
    async fn run_tool_calls(&self, calls: &mut Vec<ToolCall>) {
        if calls.len() > MAX_TOOL_CALLS {
            tracing::warn!(requested = calls.len(), limit = MAX_TOOL_CALLS, "Dropping excess tool requests");
            calls.truncate(MAX_TOOL_CALLS);
        }

        let tool_name = self.tool.name();
        for call in calls.iter_mut() {
            if call.tool.is_empty() {
                call.tool = tool_name.to_string();
            }
            if call.tool != tool_name {
                tracing::warn!(tool = %call.tool, "Solver requested an unknown tool");
                call.error = Some(format!("unknown tool '{}'", call.tool));
                continue;
            }

            match self.tool.execute(&call.expression).await {
                Ok(value) => call.value = Some(value),
                Err(e) => {
                    tracing::debug!(expression = %call.expression, error = %e, "Tool call failed");
                    call.error = Some(e.to_string());
                }
            }
        }
    }
}

/// Render verifier feedback as a structured hint for the next attempt.
fn feedback_section(feedback: &VerificationResult) -> String {
    let mut sections = Vec::new();
    if !feedback.reasons.is_empty() {
        sections.push(format!("Problems found:\n{}", bullets(&feedback.reasons)));
    }
    if let Some(correction) = &feedback.suggested_correction {
        sections.push(format!("Suggested correction: {}", correction));
    }
    if let Some(answer) = &feedback.derived_answer {
        sections.push(format!("The checker derived: {}", answer));
    }
    sections.join("\n\n")
}

#[async_trait]
impl Stage for Solver {
    type Input = SolverInput;
    type Output = Solution;

    fn kind(&self) -> StageKind {
        StageKind::Solver
    }

    fn input_ref(&self, input: &SolverInput) -> String {
        match input.feedback {
            Some(_) => format!("problem+feedback#{}", input.attempt_number.saturating_sub(1)),
            None => "problem".to_string(),
        }
    }

    fn output_ref(&self, output: &Solution) -> String {
        format!("solution#{}", output.attempt_number)
    }

    async fn run(
        &self,
        input: &SolverInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageRun<Solution>, StageError> {
        let metadata = &input.problem.metadata;

        let mut fields = PromptFields::new();
        fields.insert("problem", input.problem.text.clone());
        fields.insert("category", input.classification.category.to_string());
        fields.insert("difficulty", input.classification.difficulty.as_str().to_string());
        fields.insert("variables", metadata.variables.join(", "));
        fields.insert("constraints", bullets(&metadata.constraints));
        fields.insert(
            "precision",
            metadata
                .precision
                .map(|digits| format!("{} decimal places", digits))
                .unwrap_or_default(),
        );
        fields.insert("context", bullets(&metadata.retrieved_context));
        fields.insert(
            "feedback",
            input.feedback.as_ref().map(feedback_section).unwrap_or_default(),
        );

        let prompt = prompts::render(StageKind::Solver, &fields);
        let attempt_number = input.attempt_number;
        let mut run = complete_and_parse(
            StageKind::Solver,
            prompt,
            &ctx.config.completion,
            ctx,
            |raw| parse_solution(raw, attempt_number),
        )
        .await?;

        self.run_tool_calls(&mut run.output.tool_calls).await;
        Ok(run)
    }
}
