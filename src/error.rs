//! Error types for the execution and sharing core.

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the execution strategies and shared feeds.
///
/// Usage errors (`Configuration`, `AlreadyConsumed`) fail fast at the call
/// site. `TaskPanicked` is deferred: a panic inside a background task is
/// captured and re-surfaces on the first join of that task's handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("async sequence can only be consumed once")]
    AlreadyConsumed,

    #[error("background task panicked: {0}")]
    TaskPanicked(String),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),

    #[error("execution backend has shut down")]
    Shutdown,

    #[error("lazy value is unset")]
    Unset,
}
