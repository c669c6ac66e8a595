//! Provider fallback policy.
//!
//! The pool walks a cursor over (provider index, attempt). After each failed
//! attempt the failure kind decides, through a fixed table, whether the same
//! provider is tried again or the cursor moves to the next provider.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::time::Duration;

use mathpipe_core::ProviderErrorKind;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Retry the same provider after a backoff delay
    RetrySame,
    /// Give up on this provider and move to the next one
    Advance,
}

/// Most attempts a provider gets for failures of `kind`, given its budget.
///
/// | kind              | attempts            |
/// |-------------------|---------------------|
/// | RateLimited       | budget              |
/// | Timeout           | budget              |
/// | MalformedResponse | min(2, budget)      |
/// | Unavailable       | 1                   |
/// | AuthFailed        | 1                   |
pub fn attempt_limit(kind: ProviderErrorKind, budget: u32) -> u32 {
    let budget = budget.max(1);
    match kind {
        ProviderErrorKind::RateLimited | ProviderErrorKind::Timeout => budget,
        ProviderErrorKind::MalformedResponse => budget.min(2),
        ProviderErrorKind::Unavailable | ProviderErrorKind::AuthFailed => 1,
    }
}

/// Decide what follows failed attempt number `attempt` (1-based).
pub fn failure_action(kind: ProviderErrorKind, attempt: u32, budget: u32) -> FailureAction {
    if attempt < attempt_limit(kind, budget) {
        FailureAction::RetrySame
    } else {
        FailureAction::Advance
    }
}

/// Position of the pool within one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Index into the pool's provider list
    pub provider: usize,
    /// 1-based attempt number on that provider
    pub attempt: u32,
}

/// Transition taken after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Retry(Cursor),
    Advance(Cursor),
    Exhausted,
}

impl Cursor {
    pub fn start() -> Self {
        Self {
            provider: 0,
            attempt: 1,
        }
    }

    /// Next position after a failure of `kind` on the current provider.
    pub fn after_failure(
        self,
        kind: ProviderErrorKind,
        budget: u32,
        provider_count: usize,
    ) -> Transition {
        match failure_action(kind, self.attempt, budget) {
            FailureAction::RetrySame => Transition::Retry(Cursor {
                provider: self.provider,
                attempt: self.attempt + 1,
            }),
            FailureAction::Advance if self.provider + 1 < provider_count => {
                Transition::Advance(Cursor {
                    provider: self.provider + 1,
                    attempt: 1,
                })
            }
            FailureAction::Advance => Transition::Exhausted,
        }
    }
}

/// Exponential backoff between attempts on one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            cap: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delays for successive retries: base, 2×base, 4×base, ... capped.
    pub fn delays(&self, max_retries: u32) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.base)
            .with_max_delay(self.cap)
            .with_factor(2.0)
            .with_max_times(max_retries as usize)
            .build()
    }

    /// Delay before the next retry: the server hint when present (capped),
    /// otherwise the next computed delay.
    pub fn next_delay(
        &self,
        delays: &mut impl Iterator<Item = Duration>,
        retry_after: Option<Duration>,
    ) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.cap),
            None => delays.next().unwrap_or(self.cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_KINDS: [ProviderErrorKind; 5] = [
        ProviderErrorKind::RateLimited,
        ProviderErrorKind::Timeout,
        ProviderErrorKind::AuthFailed,
        ProviderErrorKind::Unavailable,
        ProviderErrorKind::MalformedResponse,
    ];

    #[test]
    fn test_policy_table() {
        use ProviderErrorKind::*;

        assert_eq!(failure_action(Timeout, 1, 2), FailureAction::RetrySame);
        assert_eq!(failure_action(Timeout, 2, 2), FailureAction::Advance);
        assert_eq!(failure_action(RateLimited, 3, 4), FailureAction::RetrySame);
        assert_eq!(failure_action(AuthFailed, 1, 5), FailureAction::Advance);
        assert_eq!(failure_action(Unavailable, 1, 5), FailureAction::Advance);
        assert_eq!(failure_action(MalformedResponse, 1, 5), FailureAction::RetrySame);
        assert_eq!(failure_action(MalformedResponse, 2, 5), FailureAction::Advance);
        assert_eq!(failure_action(MalformedResponse, 1, 1), FailureAction::Advance);
    }

    #[test]
    fn test_cursor_walk() {
        let cursor = Cursor::start();
        let Transition::Retry(second) = cursor.after_failure(ProviderErrorKind::Timeout, 2, 2)
        else {
            panic!("expected retry");
        };
        assert_eq!(second, Cursor { provider: 0, attempt: 2 });

        assert_eq!(
            second.after_failure(ProviderErrorKind::Timeout, 2, 2),
            Transition::Advance(Cursor { provider: 1, attempt: 1 })
        );
        assert_eq!(
            Cursor { provider: 1, attempt: 1 }.after_failure(ProviderErrorKind::AuthFailed, 2, 2),
            Transition::Exhausted
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<Duration> = policy.delays(4).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2));
        let mut delays = policy.delays(3);
        assert_eq!(
            policy.next_delay(&mut delays, Some(Duration::from_secs(60))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.next_delay(&mut delays, Some(Duration::from_millis(500))),
            Duration::from_millis(500)
        );
        assert_eq!(policy.next_delay(&mut delays, None), Duration::from_millis(100));
    }

    fn run_cursor(failures: &[usize], budgets: &[u32]) -> Vec<Cursor> {
        let mut visited = vec![Cursor::start()];
        let mut cursor = Cursor::start();
        for &kind_index in failures {
            let kind = ALL_KINDS[kind_index];
            match cursor.after_failure(kind, budgets[cursor.provider], budgets.len()) {
                Transition::Retry(next) | Transition::Advance(next) => {
                    cursor = next;
                    visited.push(next);
                }
                Transition::Exhausted => break,
            }
        }
        visited
    }

    proptest! {
        #[test]
        fn prop_attempts_never_exceed_budget(
            failures in proptest::collection::vec(0usize..5, 0..40),
            budgets in proptest::collection::vec(1u32..5, 1..4),
        ) {
            for cursor in run_cursor(&failures, &budgets) {
                prop_assert!(cursor.attempt <= budgets[cursor.provider]);
                prop_assert!(cursor.provider < budgets.len());
            }
        }

        #[test]
        fn prop_provider_index_is_monotonic(
            failures in proptest::collection::vec(0usize..5, 0..40),
            budgets in proptest::collection::vec(1u32..5, 1..4),
        ) {
            let visited = run_cursor(&failures, &budgets);
            for pair in visited.windows(2) {
                prop_assert!(pair[1].provider >= pair[0].provider);
            }
        }

        #[test]
        fn prop_auth_failure_never_retried(attempt in 1u32..10, budget in 1u32..10) {
            prop_assert_eq!(
                failure_action(ProviderErrorKind::AuthFailed, attempt, budget),
                FailureAction::Advance
            );
        }
    }
}
