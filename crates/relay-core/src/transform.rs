//! The contract every stage's transform implements.

use async_trait::async_trait;

use crate::envelope::Envelope;
use crate::error::TransformError;

/// A stage's unit of work.
///
/// `apply` may be called more than once for the same envelope when a
/// previous attempt failed, so a failing call must leave the envelope in a
/// state the next attempt can start from (typically: don't replace the
/// payload until the new one is ready).
#[async_trait]
pub trait Transform: Send + Sync {
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError>;
}

/// Adapter that turns a synchronous closure into a [`Transform`].
pub struct FnTransform<F> {
    f: F,
}

/// Wrap a closure as a transform.
///
/// ```rust,ignore
/// let upper = relay_core::transform::from_fn(|env| {
///     if let Payload::Text(t) = env.payload_mut() {
///         *t = t.to_uppercase();
///     }
///     Ok(())
/// });
/// ```
pub fn from_fn<F>(f: F) -> FnTransform<F>
where
    F: Fn(&mut Envelope) -> Result<(), TransformError> + Send + Sync,
{
    FnTransform { f }
}

#[async_trait]
impl<F> Transform for FnTransform<F>
where
    F: Fn(&mut Envelope) -> Result<(), TransformError> + Send + Sync,
{
    async fn apply(&self, envelope: &mut Envelope) -> Result<(), TransformError> {
        (self.f)(envelope)
    }
}
