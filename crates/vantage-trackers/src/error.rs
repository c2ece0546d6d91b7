//! Error types for the tracker subsystem.

/// Errors that abort a single `add` call.
///
/// Soft failures never surface here: they are logged and the caller gets a
/// no-op [`Unlisten`](crate::Unlisten) instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    /// The trigger configuration violates a hard requirement.
    #[error("{0}")]
    Assertion(String),

    /// A selector did not resolve to any element.
    #[error("target resolution failed: {0}")]
    Resolve(String),

    /// No tracker is allowed for the requested event type in this root.
    #[error("tracker unavailable: {0}")]
    Unavailable(String),
}

impl TrackerError {
    pub(crate) fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }
}
