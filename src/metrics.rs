use tracing::trace;

// Counters are emitted as trace events; a collector can aggregate them from
// the `research.metrics` target.

pub fn inc_requests(route: &'static str) {
    trace!(target = "research.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128, succeeded: bool) {
    trace!(
        target = "research.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        succeeded,
        "stage_elapsed"
    );
}

pub fn product_elapsed(elapsed_ms: u128, error_count: usize) {
    trace!(
        target = "research.metrics",
        elapsed_ms = elapsed_ms as u64,
        error_count = error_count as u64,
        "product_elapsed"
    );
}

pub fn queue_drained(processed: usize, failed: usize) {
    trace!(
        target = "research.metrics",
        processed = processed as u64,
        failed = failed as u64,
        "queue_drained"
    );
}
