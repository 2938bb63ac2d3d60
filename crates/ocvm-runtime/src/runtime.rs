//! Node-facing entry point
//!
//! Ties one code cache, one compile orchestrator and any number of
//! caller-owned executors together.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use ocvm_engine::{
    ApplyContext, CodeTuple, ContentHash, ExecutionLimits, ExecutionReport, Executor,
};
use parking_lot::Mutex;

use crate::cache::{CodeCache, ExecutableMapping};
use crate::config::{Isolation, RuntimeConfig};
use crate::error::RuntimeError;
use crate::ipc::Message;
use crate::orchestrator::{
    CompileBackend, CompileOrchestrator, InProcessBackend, Lookup, OrchestratorStats, ProcessBackend,
};

/// Result of `Runtime::apply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Ran natively
    Executed(ExecutionReport),
    /// Still compiling; the caller should use its fallback path
    NotReady,
    /// Compilation failed earlier; the caller should use its fallback path
    Unavailable,
}

/// Cache, orchestrator and configuration for one node process
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    cache: Arc<Mutex<CodeCache>>,
    executable: Arc<ExecutableMapping>,
    orchestrator: CompileOrchestrator,
}

impl Runtime {
    /// Open the cache and start the orchestrator with the configured backend
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let backend: Arc<dyn CompileBackend> = match config.compile.isolation {
            Isolation::Process => Arc::new(ProcessBackend::new(
                config.worker_executable()?,
                config.compile.worker_limits.clone(),
            )),
            Isolation::Thread => Arc::new(InProcessBackend),
        };
        Self::with_backend(config, backend)
    }

    /// Like `new`, with an explicit compile backend
    pub fn with_backend(config: RuntimeConfig, backend: Arc<dyn CompileBackend>) -> Result<Self, RuntimeError> {
        config.validate()?;
        let cache = CodeCache::open(&config.cache)?;
        let executable = cache.executable();
        let cache = Arc::new(Mutex::new(cache));
        let orchestrator = CompileOrchestrator::new(
            Arc::clone(&cache),
            backend,
            config.compile.workers,
            config.wasm.clone(),
        )?;
        Ok(Runtime { config, cache, executable, orchestrator })
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Shared code cache
    pub fn cache(&self) -> &Arc<Mutex<CodeCache>> {
        &self.cache
    }

    /// The orchestrator, for direct descriptor requests
    pub fn orchestrator(&self) -> &CompileOrchestrator {
        &self.orchestrator
    }

    /// An executor sized for the configured wasm limits
    pub fn executor(&self) -> Result<Executor, RuntimeError> {
        Ok(Executor::new(&self.config.wasm)?)
    }

    /// Run `apply` natively if the code is compiled, otherwise start
    /// compiling it and return without running
    pub fn apply(
        &self,
        executor: &mut Executor,
        code_hash: ContentHash,
        vm_version: u8,
        bytecode: &[u8],
        ctx: &mut dyn ApplyContext,
        limits: &ExecutionLimits,
    ) -> Result<ApplyOutcome, RuntimeError> {
        let tuple = CodeTuple::new(code_hash, vm_version);
        match self.orchestrator.get_descriptor_for_code(tuple, bytecode)? {
            Lookup::Ready(descriptor) => {
                let report = executor.execute(&descriptor, self.executable.as_ref(), ctx, limits)?;
                Ok(ApplyOutcome::Executed(report))
            }
            Lookup::NotReady => Ok(ApplyOutcome::NotReady),
            Lookup::Unavailable => Ok(ApplyOutcome::Unavailable),
        }
    }

    /// Run `apply` natively, compiling first if needed
    pub fn apply_sync(
        &self,
        executor: &mut Executor,
        code_hash: ContentHash,
        vm_version: u8,
        bytecode: &[u8],
        ctx: &mut dyn ApplyContext,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionReport, RuntimeError> {
        let tuple = CodeTuple::new(code_hash, vm_version);
        let descriptor = self.orchestrator.get_descriptor_for_code_sync(tuple, bytecode)?;
        Ok(executor.execute(&descriptor, self.executable.as_ref(), ctx, limits)?)
    }

    /// See `CompileOrchestrator::free_code`
    pub fn free_code(&self, code_hash: ContentHash, vm_version: u8) -> bool {
        self.orchestrator.free_code(&CodeTuple::new(code_hash, vm_version))
    }

    /// See `CompileOrchestrator::subscribe`
    pub fn subscribe(&self) -> Receiver<Message> {
        self.orchestrator.subscribe()
    }

    /// See `CompileOrchestrator::stats`
    pub fn stats(&self) -> OrchestratorStats {
        self.orchestrator.stats()
    }

    /// Stop compiling and close the cache cleanly
    pub fn shutdown(mut self) -> Result<(), RuntimeError> {
        self.orchestrator.shutdown();
        self.cache.lock().close()?;
        Ok(())
    }
}
