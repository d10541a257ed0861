use crate::utils::Backoff;

/// In-process retry of a failed write, before the broker gets involved.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRetryPolicy {
    /// Extra write attempts after the first one
    pub retries: u32,
    pub backoff: Backoff,
}

/// Requeue through the broker once local retries are exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct RequeuePolicy {
    pub enabled: bool,
    pub max_retries: u32,
    /// When false, `max_retries` is ignored and messages requeue indefinitely
    pub limit_retry: bool,
}

impl RequeuePolicy {
    /// Whether a message that has already been requeued `retry_count` times
    /// may be requeued once more. A count at `u32::MAX` cannot be incremented,
    /// so it is never requeued even without a limit.
    pub fn allows(&self, retry_count: u32) -> bool {
        self.enabled
            && retry_count < u32::MAX
            && (!self.limit_retry || retry_count < self.max_retries)
    }
}

/// Immutable after load and shared read-only by every handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub local: LocalRetryPolicy,
    pub requeue: RequeuePolicy,
}
