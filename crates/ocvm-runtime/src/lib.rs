//! OCVM Runtime
//!
//! The node-facing half of OCVM:
//! - **Cache**: the crash-safe, mmap-backed store of compiled code (`cache` module)
//! - **IPC**: framed messages with descriptor passing between the node and
//!   compile workers (`ipc` module)
//! - **Orchestrator**: de-duplicated sync and async compile scheduling over
//!   in-process or out-of-process backends (`orchestrator` module)
//! - **Runtime**: one handle tying cache, orchestrator and executors together
//!
//! # Example
//!
//! ```rust,ignore
//! use ocvm_runtime::{ApplyOutcome, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::load(path)?)?;
//! let mut executor = runtime.executor()?;
//! match runtime.apply(&mut executor, hash, 0, &wasm, &mut ctx, &limits)? {
//!     ApplyOutcome::Executed(report) => println!("{}", report.console),
//!     _ => { /* interpret instead */ }
//! }
//! runtime.shutdown()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("ocvm-runtime requires Linux (memfd, SCM_RIGHTS)");

/// Persistent code cache
pub mod cache;

/// Runtime configuration
pub mod config;

/// Error types
pub mod error;

/// Orchestrator/worker channel and message types
pub mod ipc;

/// Compile scheduling
pub mod orchestrator;

/// Node-facing facade
pub mod runtime;

/// Compile worker loop
pub mod worker;

pub use cache::{CodeCache, ExecutableMapping, Inserted};
pub use config::{CacheConfig, CompileConfig, Isolation, RuntimeConfig, WorkerLimits};
pub use error::{
    CacheError, CacheIntegrityError, ConfigError, IpcError, OrchestratorError, RuntimeError,
};
pub use orchestrator::{
    CompileBackend, CompileOrchestrator, InProcessBackend, Lookup, OrchestratorStats, ProcessBackend,
};
pub use runtime::{ApplyOutcome, Runtime};
