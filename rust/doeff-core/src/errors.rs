//! Error taxonomy of the effect machine.
//!
//! Every failure a run can surface is an `EffectError`. Most kinds are
//! recoverable through `Safe`/`Recover`; contract violations (a handler
//! breaking the generator protocol, a continuation resumed twice) are
//! fatal for the run and bypass both.

use thiserror::Error;

/// Failure kinds surfaced by the machine and the built-in handlers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EffectError {
    /// No handler on the stack accepted the dispatched effect.
    #[error("no handler accepts {effect}")]
    MissingHandler { effect: String },

    /// `Ask`/`Dep` on a key absent from the environment.
    #[error("missing env key {key:?}")]
    MissingEnvKey { key: String },

    /// A handler broke the dispatch protocol. Fatal for the run.
    #[error("handler contract violated: {message}")]
    HandlerContract { message: String },

    /// The task observed its own cancellation.
    #[error("task {task} was cancelled")]
    TaskCancelled { task: u64 },

    /// `Release` would have pushed `available` past `max_permits`.
    #[error("semaphore released too many times")]
    SemaphoreRelease,

    /// `CreateSemaphore` with a non-positive permit count.
    #[error("semaphore permits must be >= 1, got {permits}")]
    SemaphoreInit { permits: i64 },

    /// `CacheGet` on a key the backend does not hold.
    #[error("cache miss for key {key:?}")]
    CacheMiss { key: String },

    /// The backend holds the key but cannot decode the entry.
    #[error("cache entry for {key:?} is corrupt: {message}")]
    CacheCorrupt { key: String, message: String },

    /// A value had the wrong shape for the operation, or a protocol
    /// object (generator, awaitable) was used after consumption.
    #[error("type error: {message}")]
    Type { message: String },

    /// Programmer-defined failure raised via `Fail`.
    #[error("{message}")]
    Failure {
        message: String,
        #[source]
        cause: Option<Box<EffectError>>,
    },

    /// Every task is parked and no external completion can arrive.
    #[error("deadlock: all tasks are blocked and no external completion is pending")]
    Deadlock,
}

impl EffectError {
    /// Build a programmer-defined failure.
    pub fn failure(message: impl Into<String>) -> Self {
        EffectError::Failure { message: message.into(), cause: None }
    }

    /// Build a programmer-defined failure with a cause link.
    pub fn failure_with_cause(message: impl Into<String>, cause: EffectError) -> Self {
        EffectError::Failure {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        EffectError::Type { message: message.into() }
    }

    pub fn handler_contract(message: impl Into<String>) -> Self {
        EffectError::HandlerContract { message: message.into() }
    }

    /// Fatal errors abort the run and cannot be caught by `Safe`/`Recover`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EffectError::HandlerContract { .. })
    }

    /// Short kind label used by traces and the CLI JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            EffectError::MissingHandler { .. } => "MissingHandlerError",
            EffectError::MissingEnvKey { .. } => "MissingEnvKeyError",
            EffectError::HandlerContract { .. } => "HandlerContractError",
            EffectError::TaskCancelled { .. } => "TaskCancelledError",
            EffectError::SemaphoreRelease => "SemaphoreReleaseError",
            EffectError::SemaphoreInit { .. } => "SemaphoreInitError",
            EffectError::CacheMiss { .. } => "CacheMiss",
            EffectError::CacheCorrupt { .. } => "CacheCorrupt",
            EffectError::Type { .. } => "TypeError",
            EffectError::Failure { .. } => "Failure",
            EffectError::Deadlock => "DeadlockError",
        }
    }

    /// Walk the cause chain, outermost first.
    pub fn chain(&self) -> Vec<&EffectError> {
        let mut out = vec![self];
        let mut cursor = self;
        while let EffectError::Failure { cause: Some(next), .. } = cursor {
            out.push(next);
            cursor = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_contract_errors_are_fatal() {
        assert!(EffectError::handler_contract("x").is_fatal());
        assert!(!EffectError::MissingEnvKey { key: "k".into() }.is_fatal());
        assert!(!EffectError::Deadlock.is_fatal());
    }

    #[test]
    fn cause_chain_walks_outermost_first() {
        let inner = EffectError::failure("inner");
        let outer = EffectError::failure_with_cause("outer", inner);
        let chain = outer.chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].to_string(), "outer");
        assert_eq!(chain[1].to_string(), "inner");
    }
}
