//! Runtime error types.

use std::path::PathBuf;

use ocvm_engine::{CodeTuple, ExecutionError};
use thiserror::Error;

/// The cache file cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheIntegrityError {
    /// Header magic does not identify this cache layout
    #[error("Bad cache magic {found:#018x} (expected {expected:#018x})")]
    BadMagic {
        /// Magic read from the file
        found: u64,
        /// Magic of the current layout
        expected: u64,
    },

    /// Dirty flag set: a previous process did not close the cache cleanly
    #[error("Cache was not closed cleanly; delete it to rebuild")]
    Dirty,
}

/// Errors from the on-disk code cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// Integrity check failed at open
    #[error("Cache integrity error: {0}")]
    Integrity(#[from] CacheIntegrityError),

    /// File or mapping operation failed
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process holds the cache
    #[error("Cache file {} is locked by another process", path.display())]
    Locked {
        /// Cache file path
        path: PathBuf,
    },

    /// The persisted descriptor index could not be read or written
    #[error("Cache index error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A blob that cannot fit even in an empty cache
    #[error("Code blob of {size} bytes does not fit the {capacity}-byte cache")]
    TooFull {
        /// Blob size
        size: u64,
        /// Arena capacity
        capacity: u64,
    },

    /// The cache was closed
    #[error("Cache is closed")]
    Closed,
}

/// Errors on the worker channel
#[derive(Debug, Error)]
pub enum IpcError {
    /// Socket or file I/O failed
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A system call failed
    #[error("IPC system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// Payload could not be encoded or decoded
    #[error("Malformed IPC message: {0}")]
    Codec(#[from] bincode::Error),

    /// The peer hung up
    #[error("IPC peer closed the channel")]
    Closed,

    /// Frame longer than the channel accepts
    #[error("IPC frame of {len} bytes exceeds the {max}-byte limit")]
    TooLarge {
        /// Announced length
        len: u64,
        /// Accepted maximum
        max: u64,
    },

    /// A message arrived without the file descriptors it needs
    #[error("Expected {expected} file descriptor(s), received {actual}")]
    MissingDescriptor {
        /// Descriptors the message requires
        expected: usize,
        /// Descriptors received
        actual: usize,
    },

    /// A message that makes no sense at this point of the exchange
    #[error("Unexpected IPC message: {0}")]
    Unexpected(String),
}

/// Errors from compile orchestration
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The compile of this tuple failed
    #[error("Compiling {tuple} failed: {message}")]
    CompileFailed {
        /// Code tuple
        tuple: CodeTuple,
        /// What went wrong
        message: String,
    },

    /// An earlier compile of this tuple failed
    #[error("{0} is blacklisted after a failed compile")]
    Blacklisted(CodeTuple),

    /// The compiled code did not fit the cache
    #[error("Compiled code of {0} does not fit in the cache")]
    CacheTooFull(CodeTuple),

    /// Bytecode does not hash to the requested tuple
    #[error("Bytecode does not hash to {0}")]
    HashMismatch(CodeTuple),

    /// A compile worker could not be run
    #[error("Compile worker failed: {0}")]
    Worker(String),

    /// Worker channel failure
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Cache failure
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The orchestrator stopped accepting requests
    #[error("Compile orchestrator is shut down")]
    ShutDown,
}

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors that can occur while running contracts through the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Code cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Compile orchestration error
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    /// The contract failed
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}
