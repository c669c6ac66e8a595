//! Math execution tool available to the stages.
//!
//! [`ArithmeticTool`] runs the deterministic evaluator from `mathpipe-core`
//! on a blocking thread under a deadline.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use mathpipe_core::{expression, numeric_answers};

/// Relative slack when substituting an answer, so rounded answers such as
/// `x = 1.414` for `x^2 = 2` still count.
const ANSWER_TOLERANCE: f64 = 1e-2;

/// Errors from a tool invocation. Never retried by the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Syntax error: {0}")]
    SyntaxError(String),

    #[error("Evaluation timed out after {0:?}")]
    Timeout(Duration),
}

/// Evaluates an expression to a number.
#[async_trait]
pub trait MathTool: Send + Sync {
    async fn execute(&self, expression: &str) -> Result<f64, ToolError>;

    fn name(&self) -> &str;
}

/// Arithmetic evaluation with `pi`, `e` and the common one-argument functions.
#[derive(Debug, Clone)]
pub struct ArithmeticTool {
    timeout: Duration,
}

impl ArithmeticTool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ArithmeticTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl MathTool for ArithmeticTool {
    async fn execute(&self, input: &str) -> Result<f64, ToolError> {
        let owned = input.to_string();
        let task = tokio::task::spawn_blocking(move || expression::evaluate(&owned));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map_err(|e| ToolError::SyntaxError(e.to_string())),
            Ok(Err(join_error)) => Err(ToolError::SyntaxError(format!(
                "evaluation aborted: {}",
                join_error
            ))),
            Err(_) => Err(ToolError::Timeout(self.timeout)),
        }
    }

    fn name(&self) -> &str {
        "arithmetic"
    }
}

/// Outcome of checking one `lhs = rhs` equation.
#[derive(Debug, Clone, PartialEq)]
pub enum EquationCheck {
    Holds,
    Fails { lhs: f64, rhs: f64 },
    /// Not an equation, or it mentions unknowns
    NotCheckable,
}

/// Check a numeric equation with `tool`.
///
/// Equations with free variables are not checkable; tool errors are
/// returned to the caller.
pub async fn check_equation(tool: &dyn MathTool, equation: &str) -> Result<EquationCheck, ToolError> {
    let Ok((lhs, rhs)) = expression::split_equation(equation) else {
        return Ok(EquationCheck::NotCheckable);
    };

    for side in [lhs, rhs] {
        match expression::free_variables(side) {
            Ok(vars) if vars.is_empty() => {}
            Ok(_) => return Ok(EquationCheck::NotCheckable),
            Err(e) => return Err(ToolError::SyntaxError(e.to_string())),
        }
    }

    let left = tool.execute(lhs).await?;
    let right = tool.execute(rhs).await?;
    if expression::approx_eq(left, right) {
        Ok(EquationCheck::Holds)
    } else {
        Ok(EquationCheck::Fails {
            lhs: left,
            rhs: right,
        })
    }
}

/// Outcome of substituting a final answer into the problem's equation.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerCheck {
    Satisfies,
    Violates {
        equation: String,
        value: f64,
        lhs: f64,
        rhs: f64,
    },
    /// No single-unknown equation in the problem, or no numeric answer
    NotCheckable,
}

/// Substitute every numeric value in `final_answer` into the equation
/// stated in `problem`.
///
/// Only equations with exactly one unknown are checked. An answer naming a
/// different unknown is not checkable.
pub fn check_answer(problem: &str, final_answer: &str) -> AnswerCheck {
    let Some(equation) = expression::find_equation(problem) else {
        return AnswerCheck::NotCheckable;
    };
    let unknowns = expression::split_equation(&equation).and_then(|(lhs, rhs)| {
        let mut names = expression::free_variables(lhs)?;
        names.extend(expression::free_variables(rhs)?);
        names.sort();
        names.dedup();
        Ok(names)
    });
    let unknown = match unknowns {
        Ok(mut names) if names.len() == 1 => names.remove(0),
        _ => return AnswerCheck::NotCheckable,
    };

    let values = numeric_answers(final_answer);
    if values.is_empty() {
        return AnswerCheck::NotCheckable;
    }

    for (name, value) in values {
        if name.as_deref().is_some_and(|name| name != unknown) {
            return AnswerCheck::NotCheckable;
        }

        let bindings = BTreeMap::from([(unknown.clone(), value)]);
        match expression::evaluate_equation(&equation, &bindings) {
            Ok((lhs, rhs)) => {
                let scale = lhs.abs().max(rhs.abs()).max(1.0);
                if (lhs - rhs).abs() > ANSWER_TOLERANCE * scale {
                    return AnswerCheck::Violates {
                        equation,
                        value,
                        lhs,
                        rhs,
                    };
                }
            }
            Err(_) => return AnswerCheck::NotCheckable,
        }
    }

    AnswerCheck::Satisfies
}
