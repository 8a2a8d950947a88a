/// Why a token was refused by `Context::reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenRejection {
    /// The token was issued by another context, or by the same context
    /// inside a different `run_with` activation.
    #[error("it was created in a different context")]
    ForeignContext,
    /// The change recorded by the token is no longer the most recent one
    /// for its variable: it was already undone, or a later `set` has not
    /// been reset yet.
    #[error("it does not belong to the most recent change of the variable")]
    Superseded,
}

/// Errors reported by the context engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context variable `{name}` is not bound and has no default")]
    NotBound { name: String },
    #[error("token for context variable `{name}` cannot be used: {reason}")]
    InvalidToken {
        name: String,
        reason: TokenRejection,
    },
    #[error("no context is installed for task {task}")]
    UnknownTask { task: String },
    #[error("task {task} is running and its context is checked out")]
    TaskRunning { task: String },
}
