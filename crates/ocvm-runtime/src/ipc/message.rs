//! Messages exchanged between the orchestrator and compile workers

use ocvm_engine::{CodeDescriptor, CodeTuple, ModuleMeta, WasmLimits};
use serde::{Deserialize, Serialize};

/// Compile this bytecode; the bytecode itself rides along as a memfd
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    /// What is being compiled
    pub tuple: CodeTuple,
    /// Constraints the bytecode must satisfy
    pub limits: WasmLimits,
}

/// A worker's successful output; the code blob rides along as a memfd
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCode {
    /// What was compiled
    pub tuple: CodeTuple,
    /// Layout metadata of the blob
    pub meta: ModuleMeta,
    /// Blob length in bytes
    pub code_size: u64,
}

/// Final state of one compile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompileOutcome {
    /// Compiled and resident in the cache
    Ready(CodeDescriptor),
    /// Compilation failed; the tuple is blacklisted
    UnknownFailure,
    /// Compiled, but the cache had no room for it
    CacheTooFull,
}

/// Result of a compile, as broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    /// What was compiled
    pub tuple: CodeTuple,
    /// How it ended
    pub result: CompileOutcome,
    /// Unallocated cache bytes after the result was applied
    pub cache_free_bytes: u64,
}

/// Entries that left the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionNotice {
    /// Evicted tuples
    pub tuples: Vec<CodeTuple>,
}

/// Every frame on a worker channel carries one of these
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Orchestrator to worker
    CompileRequest(CompileRequest),
    /// Worker to orchestrator, on success
    CompiledCode(CompiledCode),
    /// Worker to orchestrator on failure; orchestrator to subscribers
    CompileResult(CompileResult),
    /// Orchestrator to subscribers
    EvictionNotice(EvictionNotice),
}

impl Message {
    /// Variant name, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CompileRequest(_) => "CompileRequest",
            Message::CompiledCode(_) => "CompiledCode",
            Message::CompileResult(_) => "CompileResult",
            Message::EvictionNotice(_) => "EvictionNotice",
        }
    }
}
