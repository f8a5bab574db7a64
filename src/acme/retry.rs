//! Uniform repetition of ACME requests.
//!
//! [`resend`] repeats a signed request after a `badNonce` rejection, [`poll_until`] re-fetches a
//! resource until it reaches the state the caller waits for. Both are bounded and both hand back
//! the last envelope they saw when giving up, so callers decide what exhaustion means.

use crate::acme::error::ProtocolResult;
use crate::acme::object::Nonce;
use crate::acme::response::ResponseEnvelope;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Additional sends after the first one, per logical request
pub const MAX_RESEND_ATTEMPTS: u32 = 10;
pub const MAX_POLL_ATTEMPTS: u32 = 10;
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-request resend state. A new context is created for every logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    /// Nonce handed back by the rejected attempt, to be used by the next one
    pub last_nonce: Option<Nonce>,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            last_nonce: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    #[must_use]
    fn next(&self, last_nonce: Option<Nonce>) -> Self {
        Self {
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            last_nonce,
        }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new(MAX_RESEND_ATTEMPTS)
    }
}

/// Runs `operation` and repeats it while the server answers with a transient problem.
///
/// At most [`MAX_RESEND_ATTEMPTS`] repetitions happen. The last envelope is returned unchanged
/// once they are used up.
pub async fn resend<F, Fut>(operation: F) -> ProtocolResult<ResponseEnvelope>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = ProtocolResult<ResponseEnvelope>>,
{
    resend_with(RetryContext::default(), operation).await
}

pub async fn resend_with<F, Fut>(
    mut context: RetryContext,
    mut operation: F,
) -> ProtocolResult<ResponseEnvelope>
where
    F: FnMut(RetryContext) -> Fut,
    Fut: Future<Output = ProtocolResult<ResponseEnvelope>>,
{
    loop {
        let envelope = operation(context.clone()).await?;
        if !envelope.is_transient() {
            return Ok(envelope);
        }
        if context.is_exhausted() {
            warn!(
                "Giving up after {} resends, server keeps rejecting our nonce",
                context.attempt
            );
            return Ok(envelope);
        }
        context = context.next(envelope.nonce.clone());
        debug!(
            "Resending request (attempt {}/{})",
            context.attempt, context.max_attempts
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_POLL_ATTEMPTS,
            interval: POLL_INTERVAL,
        }
    }
}

/// Waits `policy.interval`, then calls `fetch`, until `done` accepts the envelope, a request
/// fails, or `policy.max_attempts` fetches were made.
///
/// Always fetches at least once. Returns the last envelope observed, which may still be
/// non-terminal when the attempts ran out.
pub async fn poll_until<F, Fut, D>(
    policy: PollPolicy,
    mut fetch: F,
    mut done: D,
) -> ProtocolResult<ResponseEnvelope>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProtocolResult<ResponseEnvelope>>,
    D: FnMut(&ResponseEnvelope) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        tokio::time::sleep(policy.interval).await;
        let envelope = fetch().await?;
        if !envelope.is_success() || done(&envelope) {
            return Ok(envelope);
        }
        if attempt >= policy.max_attempts {
            warn!(
                "Resource still {} after {attempt} polls, giving up",
                envelope.status_field().unwrap_or("unknown")
            );
            return Ok(envelope);
        }
        debug!(
            "Resource is {}, polling again ({attempt}/{})",
            envelope.status_field().unwrap_or("unknown"),
            policy.max_attempts
        );
    }
}
