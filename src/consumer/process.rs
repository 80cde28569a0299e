use std::future::Future;

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::Envelope;

/// Business logic invoked for every decoded envelope.
///
/// Implementations must tolerate being called more than once for the same
/// envelope: delivery is at-least-once, and [`Envelope::id`] is the handle
/// for idempotent side effects. With `prefetch > 1` calls run concurrently.
///
/// Any `Fn(Envelope) -> impl Future<Output = Result<(), ProcessingError>>`
/// closure is a `Process`.
#[async_trait]
pub trait Process: Send + Sync {
    /// Handle one envelope. `Ok` acknowledges the delivery.
    async fn process(&self, envelope: Envelope) -> Result<(), ProcessingError>;
}

#[async_trait]
impl<F, Fut> Process for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessingError>> + Send,
{
    async fn process(&self, envelope: Envelope) -> Result<(), ProcessingError> {
        (self)(envelope).await
    }
}

/// Failure reported by a [`Process`] implementation.
///
/// Failures are transient by default and retried up to the retry ceiling.
/// A [`permanent`](ProcessingError::permanent) failure is dead-lettered
/// straight away.
#[derive(Debug)]
pub struct ProcessingError {
    context: SpanTrace,
    source: tower::BoxError,
    permanent: bool,
}

impl ProcessingError {
    /// Failure worth retrying.
    pub fn transient(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err.into(),
            permanent: false,
        }
    }

    /// Failure that no retry will fix.
    pub fn permanent(err: impl Into<tower::BoxError>) -> Self {
        Self {
            permanent: true,
            ..Self::transient(err)
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.permanent { "Permanent" } else { "Transient" };
        writeln!(f, "{kind} processing error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
