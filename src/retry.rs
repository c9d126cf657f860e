use crate::stages::{BoxFuture, StageError};
use std::future::Future;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Action run between attempts when a failure matches `applies`.
pub struct Recovery<'a> {
    pub applies: fn(&StageError) -> bool,
    pub action: &'a (dyn Fn() -> BoxFuture<'a, Result<(), StageError>> + Send + Sync),
}

/// Runs `op` until it succeeds or `policy.max_attempts` is used up.
///
/// Every failed attempt appends `"{label} attempt {n} failed: {err}"` to
/// `errors`. Exhaustion yields `None`; the caller always gets control back.
pub async fn retry_stage<T, Op, Fut>(
    label: &str,
    policy: &RetryPolicy,
    errors: &mut Vec<String>,
    recovery: Option<&Recovery<'_>>,
    op: Op,
) -> Option<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    retry_validated(label, policy, errors, recovery, op, Ok).await
}

/// Like [`retry_stage`], but each raw output must also pass `accept`. A
/// rejection counts as a failed attempt.
pub async fn retry_validated<T, U, Op, Fut, Acc>(
    label: &str,
    policy: &RetryPolicy,
    errors: &mut Vec<String>,
    recovery: Option<&Recovery<'_>>,
    mut op: Op,
    mut accept: Acc,
) -> Option<U>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
    Acc: FnMut(T) -> Result<U, StageError>,
{
    for attempt in 1..=policy.max_attempts {
        let err = match op().await.and_then(&mut accept) {
            Ok(value) => return Some(value),
            Err(err) => err,
        };

        let message = format!("{label} attempt {attempt} failed: {err}");
        warn!(target = "research.retry", stage = label, attempt, error = %err, "stage attempt failed");
        errors.push(message);

        if attempt == policy.max_attempts {
            error!(target = "research.retry", stage = label, attempts = attempt, "max retries reached");
            break;
        }

        if let Some(recovery) = recovery
            && (recovery.applies)(&err)
        {
            warn!(target = "research.retry", stage = label, "recovering browser session");
            if let Err(recover_err) = (recovery.action)().await {
                errors.push(format!("{label} recovery after attempt {attempt} failed: {recover_err}"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_failures_and_records_each() {
        let calls = AtomicU32::new(0);
        let mut errors = Vec::new();
        let out = retry_stage("category_revenue", &RetryPolicy::new(5), &mut errors, None, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(StageError::Failed(format!("flaky {n}")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Some(3));
        assert_eq!(
            errors,
            vec![
                "category_revenue attempt 1 failed: flaky 1",
                "category_revenue attempt 2 failed: flaky 2",
            ]
        );
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let mut errors = Vec::new();
        let out: Option<()> = retry_stage("cerebro", &RetryPolicy::new(3), &mut errors, None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StageError::Failed("down".into())) }
        })
        .await;
        assert!(out.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(errors.len(), 3);
    }

    #[tokio::test]
    async fn recovery_runs_only_for_matching_errors_between_attempts() {
        let recoveries = AtomicU32::new(0);
        let action = || {
            recoveries.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) }) as BoxFuture<'_, Result<(), StageError>>
        };
        let recovery = Recovery {
            applies: StageError::is_surface_missing,
            action: &action,
        };
        let calls = AtomicU32::new(0);
        let mut errors = Vec::new();
        let out: Option<()> = retry_stage(
            "category_revenue",
            &RetryPolicy::new(3),
            &mut errors,
            Some(&recovery),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        Err(StageError::Failed("plain".into()))
                    } else {
                        Err(StageError::SurfaceNotDetected("gone".into()))
                    }
                }
            },
        )
        .await;
        assert!(out.is_none());
        // attempts 1 (surface) -> recover, 2 (plain) -> no recover, 3 (surface) -> last, no recover
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(errors.len(), 3);
    }

    #[tokio::test]
    async fn rejected_output_is_retried() {
        let calls = AtomicU32::new(0);
        let mut errors = Vec::new();
        let out = retry_validated(
            "competitors_flow",
            &RetryPolicy::new(4),
            &mut errors,
            None,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, StageError>(n) }
            },
            |n| {
                if n >= 2 {
                    Ok(n * 10)
                } else {
                    Err(StageError::Rejected("no qualifying product found in CSV".into()))
                }
            },
        )
        .await;
        assert_eq!(out, Some(20));
        assert_eq!(errors.len(), 2);
        assert!(errors[0].ends_with("no qualifying product found in CSV"));
    }

    #[tokio::test]
    async fn failed_recovery_is_recorded_and_loop_continues() {
        let action = || {
            Box::pin(async { Err(StageError::Transport("refused".into())) })
                as BoxFuture<'_, Result<(), StageError>>
        };
        let recovery = Recovery {
            applies: StageError::is_surface_missing,
            action: &action,
        };
        let mut errors = Vec::new();
        let out: Option<()> = retry_stage(
            "monthly_revenue",
            &RetryPolicy::new(2),
            &mut errors,
            Some(&recovery),
            || async { Err(StageError::SurfaceNotDetected("none".into())) },
        )
        .await;
        assert!(out.is_none());
        assert_eq!(errors.len(), 3);
        assert!(errors[1].contains("recovery after attempt 1 failed"));
    }
}
