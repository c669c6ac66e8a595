//! Problem classification.

use async_trait::async_trait;

use mathpipe_core::{parse_classification, Category, Classification, Problem, StageKind};

use super::traits::{complete_and_parse, Stage, StageContext, StageError, StageRun};
use crate::prompts::{self, PromptFields};

/// Classifies a problem into a [`Category`].
///
/// A domain hint naming a known category is trusted and no provider is
/// called. Low confidence is not an error here; the orchestrator decides
/// what to do with it.
#[derive(Debug, Clone, Default)]
pub struct Router;

impl Router {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for Router {
    type Input = Problem;
    type Output = Classification;

    fn kind(&self) -> StageKind {
        StageKind::Router
    }

    fn input_ref(&self, _input: &Problem) -> String {
        "problem".to_string()
    }

    fn output_ref(&self, output: &Classification) -> String {
        format!("classification:{}", output.category)
    }

    async fn run(
        &self,
        problem: &Problem,
        ctx: &StageContext<'_>,
    ) -> Result<StageRun<Classification>, StageError> {
        let hint = problem.metadata.domain_hint.as_deref();
        if let Some(category) = hint.and_then(Category::from_label) {
            tracing::debug!(category = %category, "Routing from domain hint");
            return Ok(StageRun::local(Classification::from_hint(category)));
        }

        let mut fields = PromptFields::new();
        fields.insert("problem", problem.text.clone());
        fields.insert("domain_hint", hint.unwrap_or_default().to_string());

        let prompt = prompts::render(StageKind::Router, &fields);
        complete_and_parse(
            StageKind::Router,
            prompt,
            &ctx.config.completion,
            ctx,
            parse_classification,
        )
        .await
    }
}
