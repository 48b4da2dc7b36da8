use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

/// A failure carried by a task output.
///
/// Outputs are shared between every consumer of a task, so the error has to
/// be cheap to clone. User errors are kept behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum OutputError {
    /// The run body or a pushed future failed.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// A used dependency was torn down before it emitted anything.
    #[error("Task '{0}' has been torn down before emitting an initial output")]
    Exhausted(Cow<'static, str>),

    /// The run body panicked.
    #[error("Task panicked: {0}")]
    Panicked(Arc<str>),
}

impl OutputError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Attempts to downcast the user error to a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            OutputError::Failed(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for OutputError {
    fn from(e: anyhow::Error) -> Self {
        // An output error that went through `?` in a body keeps its kind.
        match e.downcast::<OutputError>() {
            Ok(err) => err,
            Err(e) => OutputError::Failed(Arc::new(e)),
        }
    }
}

/// A failure raised by a dispose action.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DisposeError(pub(crate) Arc<anyhow::Error>);

impl DisposeError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<anyhow::Error> for DisposeError {
    fn from(e: anyhow::Error) -> Self {
        DisposeError(Arc::new(e))
    }
}

/// Returned when a [`Disposable`](crate::Disposable) is given a second action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("This disposable is already resolved")]
pub struct ResolveError;

#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    #[error("Unable to create an instance of '{0}', the token has no creation recipe")]
    NotInstantiable(&'static str),

    #[error("Instance stored for '{0}' has a different type")]
    TypeMismatch(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(err: OutputError) -> anyhow::Result<()> {
        Err(err)?;
        Ok(())
    }

    #[test]
    fn test_output_error_keeps_kind_through_anyhow() {
        let err = forward(OutputError::Exhausted("source".into())).unwrap_err();
        let err = OutputError::from(err);
        assert!(matches!(err, OutputError::Exhausted(name) if name == "source"));

        let err = forward(OutputError::Panicked("boom".into())).unwrap_err();
        assert!(matches!(OutputError::from(err), OutputError::Panicked(_)));
    }

    #[test]
    fn test_foreign_error_is_failed() {
        let err = OutputError::from(anyhow::anyhow!("boom"));
        assert!(matches!(err, OutputError::Failed(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
