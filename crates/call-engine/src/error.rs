use thiserror::Error;

/// Errors surfaced by the call engine core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The process-wide peering mutex could not be acquired within its
    /// bounded timeout. The engine is considered deadlocked and must be
    /// restarted.
    #[error("call endpoint peering deadlock")]
    PeeringDeadlock,

    /// A routing task could not be started for an inbound call.
    #[error("router startup failed: {0}")]
    RouterFailed(String),

    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
