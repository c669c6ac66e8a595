//! Student-facing explanation of an accepted solution.

use async_trait::async_trait;

use mathpipe_core::{parse_explanation, Explanation, Problem, Solution, StageKind};

use super::traits::{complete_and_parse, Stage, StageContext, StageError, StageRun};
use crate::prompts::{self, format_steps, PromptFields};

#[derive(Debug, Clone)]
pub struct ExplainerInput {
    pub problem: Problem,
    /// Must already be accepted by the verifier
    pub solution: Solution,
}

#[derive(Debug, Clone, Default)]
pub struct Explainer;

impl Explainer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for Explainer {
    type Input = ExplainerInput;
    type Output = Explanation;

    fn kind(&self) -> StageKind {
        StageKind::Explainer
    }

    fn input_ref(&self, input: &ExplainerInput) -> String {
        format!("solution#{}", input.solution.attempt_number)
    }

    fn output_ref(&self, _output: &Explanation) -> String {
        "explanation".to_string()
    }

    async fn run(
        &self,
        input: &ExplainerInput,
        ctx: &StageContext<'_>,
    ) -> Result<StageRun<Explanation>, StageError> {
        let mut fields = PromptFields::new();
        fields.insert("problem", input.problem.text.clone());
        fields.insert("steps", format_steps(&input.solution.steps));
        fields.insert("final_answer", input.solution.final_answer.clone());

        let prompt = prompts::render(StageKind::Explainer, &fields);
        let step_count = input.solution.steps.len();
        complete_and_parse(
            StageKind::Explainer,
            prompt,
            &ctx.config.completion,
            ctx,
            |raw| parse_explanation(raw, step_count),
        )
        .await
    }
}
