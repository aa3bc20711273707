//! Sandboxed script execution
//! Runs untrusted JavaScript in an isolated context and relays its console output
use thiserror::Error;

mod protocol;
pub use protocol::*;

mod context;
pub use context::*;

mod node;
pub use node::*;

mod executor;
pub use executor::*;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("node not found on PATH; install Node.js or set sandbox.program")]
    RuntimeMissing,

    #[error("failed to start isolated context: {0}")]
    SpawnFailed(String),

    #[error("isolated context closed")]
    ContextClosed,

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
