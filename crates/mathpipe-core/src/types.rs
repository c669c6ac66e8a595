//! Shared data model for the reasoning pipeline.
//!
//! Every value here is produced once and never mutated afterwards: a retry
//! produces a new [`Solution`] rather than editing the previous one, and the
//! attempt log is append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Problem
// ============================================================================

/// A natural-language math problem as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// Raw problem text
    pub text: String,

    /// Optional request metadata
    #[serde(default)]
    pub metadata: ProblemMetadata,
}

/// Optional metadata attached to a problem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProblemMetadata {
    /// Requested precision (decimal places) for numeric answers
    #[serde(default)]
    pub precision: Option<u32>,

    /// Domain hint from an upstream parser (e.g. "algebra")
    #[serde(default)]
    pub domain_hint: Option<String>,

    /// Variables named in the problem
    #[serde(default)]
    pub variables: Vec<String>,

    /// Explicit constraints (e.g. "x > 0")
    #[serde(default)]
    pub constraints: Vec<String>,

    /// Retrieved reference material forwarded to the solver
    #[serde(default)]
    pub retrieved_context: Vec<String>,
}

impl Problem {
    /// Create a problem with no metadata.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: ProblemMetadata::default(),
        }
    }

    /// Attach a domain hint.
    pub fn with_domain_hint(mut self, hint: impl Into<String>) -> Self {
        self.metadata.domain_hint = Some(hint.into());
        self
    }

    /// Attach a requested precision.
    pub fn with_precision(mut self, digits: u32) -> Self {
        self.metadata.precision = Some(digits);
        self
    }

    /// Attach retrieved context.
    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.metadata.retrieved_context = context;
        self
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Broad mathematical category chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Algebra,
    Calculus,
    NumberTheory,
    Geometry,
    Other,
}

impl Category {
    /// All categories in a stable order.
    pub const ALL: [Category; 5] = [
        Category::Algebra,
        Category::Calculus,
        Category::NumberTheory,
        Category::Geometry,
        Category::Other,
    ];

    /// Map a free-form label to a category.
    ///
    /// Accepts the snake_case names plus the finer-grained route labels
    /// older prompts produce (`algebra_equation`, `calculus_limit`, ...).
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let category = match normalized.as_str() {
            "algebra" | "algebra_equation" | "linear_algebra" | "linear_algebra_basic" => {
                Category::Algebra
            }
            "calculus" | "calculus_limit" | "calculus_derivative" | "calculus_optimization"
            | "calculus_integral" => Category::Calculus,
            "number_theory" | "numbertheory" | "arithmetic" => Category::NumberTheory,
            "geometry" | "trigonometry" => Category::Geometry,
            "other" | "out_of_scope" | "probability" | "probability_basic" => Category::Other,
            _ => return None,
        };
        Some(category)
    }

    /// Snake-case label used in prompts and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Algebra => "algebra",
            Category::Calculus => "calculus",
            Category::NumberTheory => "number_theory",
            Category::Geometry => "geometry",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rough difficulty estimate from the router.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    #[default]
    Unknown,
}

impl Difficulty {
    /// Parse a difficulty label, defaulting to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "easy" => Difficulty::Easy,
            "medium" => Difficulty::Medium,
            "hard" => Difficulty::Hard,
            _ => Difficulty::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::Unknown => "unknown",
        }
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Produced by the router model
    Model,
    /// Taken directly from the problem's domain hint
    DomainHint,
    /// Substituted after a router failure or low confidence
    Degraded,
}

/// Router output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,

    /// Confidence in [0, 1]
    pub confidence: f64,

    #[serde(default)]
    pub difficulty: Difficulty,

    pub source: ClassificationSource,
}

impl Classification {
    /// Create a model-produced classification; confidence is clamped to [0, 1].
    pub fn new(category: Category, confidence: f64) -> Self {
        Self {
            category,
            confidence: clamp_unit(confidence),
            difficulty: Difficulty::Unknown,
            source: ClassificationSource::Model,
        }
    }

    /// Classification used when routing fails outright.
    pub fn degraded() -> Self {
        Self {
            category: Category::Other,
            confidence: 0.0,
            difficulty: Difficulty::Unknown,
            source: ClassificationSource::Degraded,
        }
    }

    /// Classification taken from a trusted domain hint.
    pub fn from_hint(category: Category) -> Self {
        Self {
            category,
            confidence: 1.0,
            difficulty: Difficulty::Medium,
            source: ClassificationSource::DomainHint,
        }
    }

    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Treat a low-confidence classification as `Other`.
    ///
    /// The original confidence is kept so the attempt trail still shows what
    /// the router actually said.
    pub fn or_other_below(self, threshold: f64) -> Self {
        if self.confidence < threshold && self.category != Category::Other {
            Self {
                category: Category::Other,
                source: ClassificationSource::Degraded,
                ..self
            }
        } else {
            self
        }
    }
}

// ============================================================================
// Solution
// ============================================================================

/// One step of a candidate solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub description: String,

    /// Optional machine-checkable expression, e.g. `(x-2)(x-3) = 0`
    #[serde(default)]
    pub expression: String,
}

impl Step {
    pub fn new(description: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            expression: expression.into(),
        }
    }
}

/// A math tool invocation requested by the solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Empty until the solver resolves it to its own tool
    #[serde(default)]
    pub tool: String,
    pub expression: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    /// A call that has not run yet.
    pub fn requested(tool: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            expression: expression.into(),
            value: None,
            error: None,
        }
    }
}

/// A candidate solution produced by one solver attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub steps: Vec<Step>,
    pub final_answer: String,

    /// 1-based attempt number
    pub attempt_number: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Bounded history of superseded solutions, oldest first.
#[derive(Debug, Clone)]
pub struct SolutionHistory {
    limit: usize,
    entries: VecDeque<Solution>,
}

impl SolutionHistory {
    /// Create a history keeping at most `limit` solutions (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Append a solution, evicting the oldest once full.
    pub fn push(&mut self, solution: Solution) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(solution);
    }

    /// The most recent solution.
    pub fn latest(&self) -> Option<&Solution> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_vec(self) -> Vec<Solution> {
        self.entries.into()
    }
}

// ============================================================================
// Verification
// ============================================================================

/// Final verifier decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Verifier output for one solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verdict: Verdict,

    /// Ordered reasons; empty only for a clean acceptance
    #[serde(default)]
    pub reasons: Vec<String>,

    #[serde(default)]
    pub suggested_correction: Option<String>,

    /// Verifier confidence in its verdict, in [0, 1]
    pub confidence: f64,

    /// Answer the verifier derived on its own
    #[serde(default)]
    pub derived_answer: Option<String>,
}

impl VerificationResult {
    pub fn accepted(confidence: f64) -> Self {
        Self {
            verdict: Verdict::Accepted,
            reasons: Vec::new(),
            suggested_correction: None,
            confidence: clamp_unit(confidence),
            derived_answer: None,
        }
    }

    pub fn rejected(reasons: Vec<String>, confidence: f64) -> Self {
        Self {
            verdict: Verdict::Rejected,
            reasons,
            suggested_correction: None,
            confidence: clamp_unit(confidence),
            derived_answer: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

// ============================================================================
// Explanation
// ============================================================================

/// Human-readable explanation of an accepted solution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explanation {
    pub narrative: String,

    /// 0-based indices into the solution's steps
    #[serde(default)]
    pub referenced_steps: Vec<usize>,

    #[serde(default)]
    pub key_concepts: Vec<String>,

    #[serde(default)]
    pub common_mistakes: Vec<String>,
}

// ============================================================================
// Attempt log
// ============================================================================

/// The pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Router,
    Solver,
    Verifier,
    Explainer,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Router => "router",
            StageKind::Solver => "solver",
            StageKind::Verifier => "verifier",
            StageKind::Explainer => "explainer",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes a provider can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Timeout,
    AuthFailed,
    Unavailable,
    MalformedResponse,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::AuthFailed => "auth_failed",
            ProviderErrorKind::Unavailable => "unavailable",
            ProviderErrorKind::MalformedResponse => "malformed_response",
        };
        f.write_str(s)
    }
}

/// One call to one provider made by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider: String,

    /// 1-based attempt number on this provider within one pool call
    pub attempt: u32,

    #[serde(with = "duration_millis")]
    pub latency: Duration,

    /// `None` when the call succeeded
    #[serde(default)]
    pub error: Option<ProviderErrorKind>,
}

impl ProviderAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What a stage invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Output { output_ref: String },
    Error { kind: String, message: String },
}

/// Append-only audit entry for one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub stage: StageKind,

    /// Short reference to the stage input (e.g. `problem`, `solution#2`)
    pub input_ref: String,

    pub outcome: AttemptOutcome,

    /// Provider that served the completion, if any did
    #[serde(default)]
    pub provider_used: Option<String>,

    /// Per-provider attempts made by the pool for this invocation
    #[serde(default)]
    pub provider_attempts: Vec<ProviderAttempt>,

    #[serde(with = "duration_millis")]
    pub latency: Duration,

    pub timestamp: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Error { .. })
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ============================================================================
// Pipeline result
// ============================================================================

/// Stable failure classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Every provider exhausted its retry budget
    NoProviderAvailable,
    /// The verifier rejected every allowed solver attempt
    VerificationExhausted,
    /// The request-level timeout expired
    TimeoutExceeded,
    /// A required stage kept producing unusable output
    StageFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NoProviderAvailable => "no_provider_available",
            FailureKind::VerificationExhausted => "verification_exhausted",
            FailureKind::TimeoutExceeded => "timeout_exceeded",
            FailureKind::StageFailed => "stage_failed",
        };
        f.write_str(s)
    }
}

/// Terminal value returned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Success {
        classification: Classification,
        solution: Solution,
        verification: VerificationResult,
        /// `None` when the explainer failed; explanation is best-effort
        explanation: Option<Explanation>,
        /// Solver retries performed after the first attempt
        retries: u32,
        history: Vec<Solution>,
        attempts: Vec<AttemptRecord>,
    },
    Failed {
        failure_kind: FailureKind,
        message: String,
        best_solution: Option<Solution>,
        retries: u32,
        history: Vec<Solution>,
        attempts: Vec<AttemptRecord>,
    },
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResult::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PipelineResult::Failed { failure_kind, .. } => Some(*failure_kind),
            PipelineResult::Success { .. } => None,
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            PipelineResult::Success { attempts, .. } | PipelineResult::Failed { attempts, .. } => {
                attempts
            }
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            PipelineResult::Success { retries, .. } | PipelineResult::Failed { retries, .. } => {
                *retries
            }
        }
    }

    /// The accepted solution, or the best-known one on failure.
    pub fn solution(&self) -> Option<&Solution> {
        match self {
            PipelineResult::Success { solution, .. } => Some(solution),
            PipelineResult::Failed { best_solution, .. } => best_solution.as_ref(),
        }
    }

    /// Number of attempt records for one stage.
    pub fn stage_count(&self, stage: StageKind) -> usize {
        self.attempts().iter().filter(|a| a.stage == stage).count()
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
