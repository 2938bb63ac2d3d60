//! OCVM Engine
//!
//! Sandboxed WebAssembly execution for deterministic contract code:
//! - **Wasm**: module IR, the closed opcode set, validation and metering
//!   injection (`wasm` module)
//! - **Compiler**: Cranelift translation of validated modules into a
//!   position-independent code blob (`compiler` module)
//! - **Intrinsics**: the ordinal-indexed host function table (`intrinsics` module)
//! - **Executor**: linear memory, control block and the apply entry
//!   protocol (`exec` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use ocvm_engine::{compile_bytecode, WasmLimits};
//!
//! let compiled = compile_bytecode(&wasm_bytes, &WasmLimits::default())?;
//! println!("{} bytes of native code", compiled.code.len());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::too_many_arguments)]

#[cfg(not(unix))]
compile_error!("ocvm-engine requires a Unix target");

// ============================================================================
// Core Modules
// ============================================================================

/// Wasm module IR, opcode set, validation and injection
pub mod wasm;

/// Cranelift-based native code generation
pub mod compiler;

/// Host intrinsic table definition
pub mod intrinsics;

/// Sandboxed execution of compiled code
pub mod exec;

/// Compiled-artifact metadata shared with the code cache
pub mod descriptor;

/// Static and per-call resource ceilings
pub mod limits;

// ============================================================================
// Re-exports
// ============================================================================

pub use compiler::{compile_bytecode, compile_module, CompileError, CODEGEN_VERSION};
pub use descriptor::{
    CodeDescriptor, CodeTuple, CompiledModule, ContentHash, InitData, ModuleMeta, StartFunction,
};
pub use exec::{
    ApplyContext, ExecutableBuffer, ExecutableCode, ExecutionError, ExecutionReport, Executor,
    HostError, InMemoryContext, MemoryRegion, TrapCode,
};
pub use intrinsics::{Intrinsic, INTRINSIC_TABLE_VERSION};
pub use limits::{ExecutionLimits, WasmLimits};
pub use wasm::{ValidationError, WASM_PAGE_SIZE};
