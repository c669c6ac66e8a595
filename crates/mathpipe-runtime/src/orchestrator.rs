//! Request orchestrator.
//!
//! Drives one problem through the stages with an explicit state machine:
//!
//! ```text
//! Routing -> Solving -> Verifying -> Explaining -> Done
//!               ^            |
//!               +-- rejected +          (any state) -> Failed
//! ```
//!
//! | From       | Event                       | To         |
//! |------------|-----------------------------|------------|
//! | Routing    | classification              | Solving    |
//! | Routing    | stage error                 | Solving (degraded to Other) |
//! | Solving    | solution                    | Verifying  |
//! | Solving    | stage error                 | Failed     |
//! | Verifying  | accepted                    | Explaining |
//! | Verifying  | rejected, retries < max     | Solving (with feedback) |
//! | Verifying  | rejected, retries == max    | Failed (VerificationExhausted) |
//! | Explaining | explanation or stage error  | Done       |
//!
//! Every stage invocation appends one [`AttemptRecord`]. The whole traversal
//! runs under the request timeout; on expiry the in-flight call is dropped,
//! the interrupted stage is recorded as `timeout_exceeded` with the provider
//! attempts it had made, and the partial trail is returned.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

use mathpipe_core::{
    AttemptOutcome, AttemptRecord, Classification, Explanation, FailureKind, PipelineResult,
    Problem, Solution, SolutionHistory, StageKind, VerificationResult,
};

use crate::config::PipelineConfig;
use crate::providers::ProviderRegistry;
use crate::resilience::ProviderPool;
use crate::stages::{
    Explainer, ExplainerInput, ProviderTrail, Router, Solver, SolverInput, Stage, StageContext,
    StageError, Verifier, VerifierInput,
};
use crate::tools::{ArithmeticTool, MathTool};
use crate::RuntimeError;

/// Pipeline position for one request.
enum Phase {
    Routing,
    Solving {
        classification: Classification,
        feedback: Option<VerificationResult>,
    },
    Verifying {
        classification: Classification,
        solution: Solution,
    },
    Explaining {
        classification: Classification,
        solution: Solution,
        verification: VerificationResult,
    },
}

/// How a traversal ended, before the trail is attached.
enum Outcome {
    Solved {
        classification: Classification,
        solution: Solution,
        verification: VerificationResult,
        explanation: Option<Explanation>,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

/// Per-request state that must survive a timeout.
struct RequestState {
    attempts: Vec<AttemptRecord>,
    history: SolutionHistory,
    retries: u32,
    in_flight: Option<InFlight>,
}

/// The stage invocation currently awaiting its result.
struct InFlight {
    stage: StageKind,
    input_ref: String,
    started: Instant,
}

/// Shared entry point for solving problems.
///
/// Holds only immutable configuration and the provider pool; concurrent
/// `handle` calls share nothing else.
pub struct Orchestrator {
    pool: ProviderPool,
    config: PipelineConfig,
    router: Router,
    solver: Solver,
    verifier: Verifier,
    explainer: Explainer,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ProviderPool {
        &self.pool
    }

    /// Solve `problem` with the orchestrator's own configuration.
    pub async fn handle(&self, problem: Problem) -> PipelineResult {
        self.run(problem, &self.pool, &self.config).await
    }

    /// Solve `problem` with a per-request configuration.
    ///
    /// Providers named in `config.provider_order` must already be in the
    /// pool; failure counters stay shared with every other request.
    pub async fn handle_with(
        &self,
        problem: Problem,
        config: &PipelineConfig,
    ) -> Result<PipelineResult, RuntimeError> {
        let pool = self.pool.reconfigured(config)?;
        Ok(self.run(problem, &pool, config).await)
    }

    async fn run(
        &self,
        problem: Problem,
        pool: &ProviderPool,
        config: &PipelineConfig,
    ) -> PipelineResult {
        let state = Mutex::new(RequestState {
            attempts: Vec::new(),
            history: SolutionHistory::new(config.history_limit),
            retries: 0,
            in_flight: None,
        });
        let trail = ProviderTrail::new(Vec::new());

        let started = Instant::now();
        let traversal = tokio::time::timeout(
            config.request_timeout,
            self.drive(&problem, pool, config, &state, &trail),
        )
        .await;

        let mut state = state.into_inner();
        let outcome = match traversal {
            Ok(outcome) => outcome,
            Err(_) => {
                let message = format!(
                    "request exceeded its {} deadline",
                    humantime::format_duration(config.request_timeout)
                );
                if let Some(in_flight) = state.in_flight.take() {
                    tracing::warn!(stage = ?in_flight.stage, timeout = ?config.request_timeout, "Request timed out");
                    state.attempts.push(AttemptRecord {
                        stage: in_flight.stage,
                        input_ref: in_flight.input_ref,
                        outcome: AttemptOutcome::Error {
                            kind: "timeout_exceeded".to_string(),
                            message: message.clone(),
                        },
                        provider_used: None,
                        provider_attempts: trail.into_inner(),
                        latency: in_flight.started.elapsed(),
                        timestamp: Utc::now(),
                    });
                } else {
                    tracing::warn!(timeout = ?config.request_timeout, "Request timed out");
                }
                Outcome::Failed {
                    kind: FailureKind::TimeoutExceeded,
                    message,
                }
            }
        };

        let RequestState {
            attempts,
            history,
            retries,
            ..
        } = state;

        let result = match outcome {
            Outcome::Solved {
                classification,
                solution,
                verification,
                explanation,
            } => PipelineResult::Success {
                classification,
                solution,
                verification,
                explanation,
                retries,
                history: history.into_vec(),
                attempts,
            },
            Outcome::Failed { kind, message } => PipelineResult::Failed {
                failure_kind: kind,
                message,
                best_solution: history.latest().cloned(),
                retries,
                history: history.into_vec(),
                attempts,
            },
        };

        tracing::info!(
            success = result.is_success(),
            failure_kind = ?result.failure_kind(),
            retries = result.retries(),
            stages = result.attempts().len(),
            elapsed = ?started.elapsed(),
            "Request finished"
        );
        result
    }

    async fn drive(
        &self,
        problem: &Problem,
        pool: &ProviderPool,
        config: &PipelineConfig,
        state: &Mutex<RequestState>,
        trail: &ProviderTrail,
    ) -> Outcome {
        let mut phase = Phase::Routing;

        loop {
            phase = match phase {
                Phase::Routing => {
                    let classification =
                        match self.invoke(&self.router, problem, pool, config, state, trail).await {
                            Ok(classification) => {
                                classification.or_other_below(config.low_confidence_threshold)
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Routing failed, continuing as other");
                                Classification::degraded()
                            }
                        };
                    tracing::debug!(category = %classification.category, confidence = classification.confidence, "Routed");
                    Phase::Solving {
                        classification,
                        feedback: None,
                    }
                }

                Phase::Solving {
                    classification,
                    feedback,
                } => {
                    let input = SolverInput {
                        problem: problem.clone(),
                        classification,
                        attempt_number: state.lock().retries + 1,
                        feedback,
                    };
                    match self.invoke(&self.solver, &input, pool, config, state, trail).await {
                        Ok(solution) => {
                            state.lock().history.push(solution.clone());
                            Phase::Verifying {
                                classification: input.classification,
                                solution,
                            }
                        }
                        Err(e) => return stage_failure(e),
                    }
                }

                Phase::Verifying {
                    classification,
                    solution,
                } => {
                    let input = VerifierInput {
                        problem: problem.clone(),
                        solution,
                    };
                    let verification =
                        match self.invoke(&self.verifier, &input, pool, config, state, trail).await {
                            Ok(verification) => verification,
                            Err(e @ StageError::PoolExhausted { .. }) => return stage_failure(e),
                            Err(e) => {
                                tracing::warn!(error = %e, "Verifier output unusable, rejecting");
                                VerificationResult::rejected(
                                    vec![format!("verification could not be completed: {}", e)],
                                    0.0,
                                )
                            }
                        };

                    if verification.is_accepted() {
                        Phase::Explaining {
                            classification,
                            solution: input.solution,
                            verification,
                        }
                    } else {
                        let retry = {
                            let mut state = state.lock();
                            let retry = state.retries < config.max_solve_retries;
                            if retry {
                                state.retries += 1;
                            }
                            retry
                        };

                        if !retry {
                            tracing::warn!(attempts = input.solution.attempt_number, "Verification exhausted");
                            return Outcome::Failed {
                                kind: FailureKind::VerificationExhausted,
                                message: format!(
                                    "solution rejected on all {} attempts",
                                    input.solution.attempt_number
                                ),
                            };
                        }

                        tracing::info!(attempt = input.solution.attempt_number, reasons = verification.reasons.len(), "Solution rejected, retrying solver");
                        Phase::Solving {
                            classification,
                            feedback: Some(verification),
                        }
                    }
                }

                Phase::Explaining {
                    classification,
                    solution,
                    verification,
                } => {
                    let input = ExplainerInput {
                        problem: problem.clone(),
                        solution,
                    };
                    let explanation =
                        match self.invoke(&self.explainer, &input, pool, config, state, trail).await {
                            Ok(explanation) => Some(explanation),
                            Err(e) => {
                                tracing::warn!(error = %e, "Explainer failed, returning solution without explanation");
                                None
                            }
                        };

                    return Outcome::Solved {
                        classification,
                        solution: input.solution,
                        verification,
                        explanation,
                    };
                }
            };
        }
    }

    /// Run one stage, logging every invocation. Unparseable output earns one
    /// re-invocation with a reformat hint when enabled.
    async fn invoke<S: Stage>(
        &self,
        stage: &S,
        input: &S::Input,
        pool: &ProviderPool,
        config: &PipelineConfig,
        state: &Mutex<RequestState>,
        trail: &ProviderTrail,
    ) -> Result<S::Output, StageError> {
        let mut reformat = false;

        loop {
            let ctx = StageContext {
                pool,
                config,
                reformat,
                trail: Some(trail),
            };
            let started = Instant::now();
            trail.lock().clear();
            state.lock().in_flight = Some(InFlight {
                stage: stage.kind(),
                input_ref: stage.input_ref(input),
                started,
            });
            let result = stage.run(input, &ctx).await;

            let (outcome, provider_used, provider_attempts) = match &result {
                Ok(run) => (
                    AttemptOutcome::Output {
                        output_ref: stage.output_ref(&run.output),
                    },
                    run.provider_used.clone(),
                    run.provider_attempts.clone(),
                ),
                Err(e) => (
                    AttemptOutcome::Error {
                        kind: e.kind_label().to_string(),
                        message: e.to_string(),
                    },
                    e.provider_used().map(String::from),
                    e.provider_attempts().to_vec(),
                ),
            };
            {
                let mut state = state.lock();
                state.in_flight = None;
                state.attempts.push(AttemptRecord {
                    stage: stage.kind(),
                    input_ref: stage.input_ref(input),
                    outcome,
                    provider_used,
                    provider_attempts,
                    latency: started.elapsed(),
                    timestamp: Utc::now(),
                });
            }

            match result {
                Ok(run) => return Ok(run.output),
                Err(e) if e.is_unparseable() && config.reformat_retry && !reformat => {
                    tracing::info!(stage = ?stage.kind(), "Retrying stage with reformat hint");
                    reformat = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn stage_failure(error: StageError) -> Outcome {
    let kind = match error {
        StageError::PoolExhausted { .. } => FailureKind::NoProviderAvailable,
        StageError::Unparseable { .. } => FailureKind::StageFailed,
    };
    tracing::warn!(stage = ?error.stage(), failure_kind = %kind, error = %error, "Request failed");
    Outcome::Failed {
        kind,
        message: error.to_string(),
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    pool: Option<ProviderPool>,
    registry: Option<ProviderRegistry>,
    config: PipelineConfig,
    tool: Option<Arc<dyn MathTool>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            pool: None,
            registry: None,
            config: PipelineConfig::default(),
            tool: None,
        }
    }

    /// Use a pre-built pool instead of building one from the config.
    ///
    /// The pool's order and budgets then win: `provider_order` in the
    /// config is replaced by the pool's provider names.
    pub fn pool(mut self, pool: ProviderPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Registry used to build the pool from `config.provider_order`.
    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Math tool used for solver tool requests and verifier step checks.
    pub fn tool(mut self, tool: Arc<dyn MathTool>) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn build(self) -> Result<Orchestrator, RuntimeError> {
        let mut config = self.config;

        let pool = match self.pool {
            Some(pool) => {
                if pool.is_empty() {
                    return Err(RuntimeError::EmptyPool);
                }
                config.provider_order = pool
                    .provider_names()
                    .into_iter()
                    .map(String::from)
                    .collect();
                config.validate()?;
                pool
            }
            None => {
                config.validate()?;
                let registry = self.registry.unwrap_or_else(ProviderRegistry::with_defaults);
                ProviderPool::from_config(&config, &registry)?
            }
        };

        let tool = self
            .tool
            .unwrap_or_else(|| Arc::new(ArithmeticTool::new(config.tool_timeout)));

        Ok(Orchestrator {
            pool,
            config,
            router: Router::new(),
            solver: Solver::new(tool.clone()),
            verifier: Verifier::new(tool),
            explainer: Explainer::new(),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{ScriptedProvider, StageProvider};
    use crate::providers::ProviderError;
    use crate::resilience::BackoffPolicy;
    use mathpipe_core::{Category, ClassificationSource, StageKind};
    use std::time::Duration;

    const ROUTE: &str = r#"{"category": "algebra", "confidence": 0.92, "difficulty": "easy"}"#;
    const SOLVE: &str = r#"{"steps": [{"description": "Divide by 2", "expression": "6 / 2 = 3"}], "final_answer": "x = 3"}"#;
    const ACCEPT: &str = r#"{"verdict": "correct", "confidence": 0.95, "issues": [], "derived_answer": "x = 3"}"#;
    const REJECT: &str = r#"{"verdict": "incorrect", "confidence": 0.9, "issues": ["off by one"], "derived_answer": "x = 4"}"#;
    const EXPLAIN: &str = r#"{"narrative": "Divide both sides by 2.", "referenced_steps": [0]}"#;

    fn task(prompt: &str) -> &str {
        prompt.lines().next().unwrap_or_default()
    }

    fn replying(
        route: &'static str,
        solve: &'static str,
        verify: &'static str,
        explain: &'static str,
    ) -> Arc<StageProvider> {
        Arc::new(StageProvider::new("mock", move |prompt| {
            let text = match task(prompt) {
                t if t.starts_with("Task: classify") => route,
                t if t.starts_with("Task: solve") => solve,
                t if t.starts_with("Task: verify") => verify,
                _ => explain,
            };
            Ok(text.to_string())
        }))
    }

    fn orchestrator(provider: Arc<StageProvider>, config: PipelineConfig) -> Orchestrator {
        let pool = ProviderPool::new(BackoffPolicy::default()).with_provider(provider, 2);
        Orchestrator::builder().pool(pool).config(config).build().unwrap()
    }

    fn stages(result: &PipelineResult) -> Vec<StageKind> {
        result.attempts().iter().map(|a| a.stage).collect()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let orch = orchestrator(replying(ROUTE, SOLVE, ACCEPT, EXPLAIN), PipelineConfig::default());
        let result = orch.handle(Problem::new("Solve 2x = 6")).await;

        assert!(result.is_success());
        assert_eq!(
            stages(&result),
            vec![StageKind::Router, StageKind::Solver, StageKind::Verifier, StageKind::Explainer]
        );
        match result {
            PipelineResult::Success {
                classification,
                explanation,
                retries,
                ..
            } => {
                assert_eq!(classification.category, Category::Algebra);
                assert!(explanation.is_some());
                assert_eq!(retries, 0);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejections_exhaust_retries() {
        let provider = replying(ROUTE, SOLVE, REJECT, EXPLAIN);
        let config = PipelineConfig {
            max_solve_retries: 1,
            ..Default::default()
        };
        let result = orchestrator(provider, config).handle(Problem::new("Solve 2x = 6")).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::VerificationExhausted));
        assert_eq!(result.retries(), 1);
        assert_eq!(result.stage_count(StageKind::Solver), 2);
        assert_eq!(result.stage_count(StageKind::Verifier), 2);
        assert_eq!(result.stage_count(StageKind::Explainer), 0);
        assert_eq!(result.solution().map(|s| s.attempt_number), Some(2));
        assert_eq!(result.attempts()[3].input_ref, "problem+feedback#1");
    }

    #[tokio::test]
    async fn test_router_failure_degrades_to_other() {
        let provider = replying("no json here", SOLVE, ACCEPT, EXPLAIN);
        let result = orchestrator(provider, PipelineConfig::default())
            .handle(Problem::new("Solve 2x = 6"))
            .await;

        // Two router records: the first attempt and the reformat retry.
        assert_eq!(result.stage_count(StageKind::Router), 2);
        match result {
            PipelineResult::Success { classification, .. } => {
                assert_eq!(classification.category, Category::Other);
                assert_eq!(classification.source, ClassificationSource::Degraded);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_low_confidence_routes_as_other() {
        let provider = replying(
            r#"{"category": "geometry", "confidence": 0.2}"#,
            SOLVE,
            ACCEPT,
            EXPLAIN,
        );
        let result = orchestrator(provider, PipelineConfig::default())
            .handle(Problem::new("Solve 2x = 6"))
            .await;

        match result {
            PipelineResult::Success { classification, .. } => {
                assert_eq!(classification.category, Category::Other);
                assert_eq!(classification.confidence, 0.2);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reformat_retry_recovers() {
        let solver_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = solver_calls.clone();
        let provider = Arc::new(StageProvider::new("mock", move |prompt| {
            let text = match task(prompt) {
                t if t.starts_with("Task: classify") => ROUTE,
                t if t.starts_with("Task: solve") => {
                    let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n == 0 {
                        "Let me think... x is three."
                    } else {
                        assert!(prompt.contains("Reformat required"));
                        SOLVE
                    }
                }
                t if t.starts_with("Task: verify") => ACCEPT,
                _ => EXPLAIN,
            };
            Ok(text.to_string())
        }));

        let result = orchestrator(provider, PipelineConfig::default())
            .handle(Problem::new("Solve 2x = 6"))
            .await;
        assert!(result.is_success());
        assert_eq!(result.stage_count(StageKind::Solver), 2);
        assert!(result.attempts()[1].is_error());
    }

    #[tokio::test]
    async fn test_unparseable_solver_without_reformat_fails() {
        let provider = replying(ROUTE, "nothing useful", ACCEPT, EXPLAIN);
        let config = PipelineConfig {
            reformat_retry: false,
            ..Default::default()
        };
        let result = orchestrator(provider, config).handle(Problem::new("Solve 2x = 6")).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::StageFailed));
        assert_eq!(result.stage_count(StageKind::Solver), 1);
        assert!(result.solution().is_none());
    }

    #[tokio::test]
    async fn test_unusable_verifier_output_counts_as_rejection() {
        let provider = replying(ROUTE, SOLVE, "looks fine to me", EXPLAIN);
        let config = PipelineConfig {
            max_solve_retries: 0,
            ..Default::default()
        };
        let result = orchestrator(provider, config).handle(Problem::new("Solve 2x = 6")).await;

        assert_eq!(result.failure_kind(), Some(FailureKind::VerificationExhausted));
        assert_eq!(result.stage_count(StageKind::Verifier), 2);
        assert_eq!(result.solution().map(|s| s.final_answer.as_str()), Some("x = 3"));
    }

    #[tokio::test]
    async fn test_explainer_failure_still_succeeds() {
        let provider = replying(ROUTE, SOLVE, ACCEPT, r#"{"narrative": ""}"#);
        let result = orchestrator(provider, PipelineConfig::default())
            .handle(Problem::new("Solve 2x = 6"))
            .await;

        match result {
            PipelineResult::Success { explanation, .. } => assert!(explanation.is_none()),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_solver_pool_exhaustion_keeps_trail() {
        let provider = Arc::new(ScriptedProvider::failing(
            "down",
            ProviderError::Timeout(Duration::from_secs(1)),
        ));
        let pool = ProviderPool::new(BackoffPolicy::default()).with_provider(provider.clone(), 2);
        let orch = Orchestrator::builder()
            .pool(pool)
            .config(PipelineConfig::default())
            .build()
            .unwrap();

        let result = orch.handle(Problem::new("Solve 2x = 6")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::NoProviderAvailable));
        // Router degrades, solver fails: one record each, two provider attempts each.
        assert_eq!(
            stages(&result),
            vec![StageKind::Router, StageKind::Solver]
        );
        assert!(result
            .attempts()
            .iter()
            .all(|a| a.provider_attempts.len() == 2 && a.is_error()));
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_records_interrupted_stage() {
        let provider = Arc::new(StageProvider::new("mock", |prompt| {
            if task(prompt).starts_with("Task: classify") {
                Ok(ROUTE.to_string())
            } else {
                Err(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_secs(4)),
                })
            }
        }));
        let pool = ProviderPool::new(BackoffPolicy::default()).with_provider(provider, 50);
        let config = PipelineConfig {
            request_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let orch = Orchestrator::builder().pool(pool).config(config).build().unwrap();

        let result = orch.handle(Problem::new("Solve 2x = 6")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::TimeoutExceeded));
        assert_eq!(stages(&result), vec![StageKind::Router, StageKind::Solver]);

        let solver = &result.attempts()[1];
        assert_eq!(solver.input_ref, "problem");
        assert!(matches!(
            &solver.outcome,
            AttemptOutcome::Error { kind, .. } if kind == "timeout_exceeded"
        ));
        assert_eq!(solver.provider_attempts.len(), 3);
        assert!(solver.latency >= Duration::from_secs(10));
    }

    #[test]
    fn test_supplied_pool_sets_provider_order() {
        let pool = ProviderPool::new(BackoffPolicy::default())
            .with_provider(replying(ROUTE, SOLVE, ACCEPT, EXPLAIN), 2);
        let orch = Orchestrator::builder()
            .pool(pool)
            .config(PipelineConfig::default())
            .build()
            .unwrap();
        assert_eq!(orch.config().provider_order, vec!["mock".to_string()]);
        assert_eq!(orch.pool().provider_names(), vec!["mock"]);
    }

    #[tokio::test]
    async fn test_handle_with_rejects_unknown_provider() {
        let orch = orchestrator(replying(ROUTE, SOLVE, ACCEPT, EXPLAIN), PipelineConfig::default());
        let config = PipelineConfig {
            provider_order: vec!["missing".to_string()],
            ..Default::default()
        };
        let err = orch
            .handle_with(Problem::new("Solve 2x = 6"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[tokio::test]
    async fn test_handle_with_overrides_retries() {
        let orch = orchestrator(replying(ROUTE, SOLVE, REJECT, EXPLAIN), PipelineConfig::default());
        let config = PipelineConfig {
            provider_order: vec!["mock".to_string()],
            max_solve_retries: 0,
            ..Default::default()
        };
        let result = orch
            .handle_with(Problem::new("Solve 2x = 6"), &config)
            .await
            .unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::VerificationExhausted));
        assert_eq!(result.stage_count(StageKind::Solver), 1);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = PipelineConfig {
            provider_order: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            Orchestrator::builder().config(config).build(),
            Err(RuntimeError::Config(_))
        ));
    }

    #[test]
    fn test_builder_rejects_empty_pool() {
        let err = Orchestrator::builder()
            .pool(ProviderPool::new(BackoffPolicy::default()))
            .build()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::EmptyPool));
    }
}
