//! Native code generation
//!
//! Compiles every defined function of a validated, metered module
//! independently via Cranelift and concatenates the results into one
//! position-independent blob. Direct calls, indirect calls and intrinsic
//! calls all go through tables reached from `vmctx` or the blob header, so
//! no relocations are needed.
//!
//! Pipeline per function:
//! 1. `translate::translate_function` → Cranelift IR
//! 2. `ctx.compile(isa)` → machine code bytes
//! 3. `layout::assemble` → blob with offset and indirect tables

mod abi;
mod isa;
mod layout;
mod translate;

pub use isa::create_native_isa;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::Context;
use cranelift_frontend::FunctionBuilderContext;
use thiserror::Error;

use crate::descriptor::CompiledModule;
use crate::intrinsics::INTRINSIC_TABLE_VERSION;
use crate::limits::WasmLimits;
use crate::wasm::{self, Module, ValidationError};

use translate::ModuleEnv;

/// Revision of the vmctx layout and calling convention
const ABI_REVISION: u8 = 1;

/// Version of the generated-code ABI recorded in every descriptor
///
/// Cached code with a different version is discarded at cache open.
pub const CODEGEN_VERSION: u8 = (ABI_REVISION << 4) | INTRINSIC_TABLE_VERSION;

/// Errors that can occur during compilation
#[derive(Debug, Error)]
pub enum CompileError {
    /// The bytecode was rejected before code generation
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Cranelift failed or produced unusable output
    #[error("Code generation failed: {0}")]
    Codegen(String),
}

/// Validate, inject and compile raw bytecode
pub fn compile_bytecode(bytes: &[u8], limits: &WasmLimits) -> Result<CompiledModule, CompileError> {
    let module = wasm::prepare(bytes, limits)?;
    compile_module(&module, limits)
}

/// Compile a module that has already been validated and metered
pub fn compile_module(module: &Module, limits: &WasmLimits) -> Result<CompiledModule, CompileError> {
    let isa = create_native_isa()?;
    let env = ModuleEnv::new(module, isa.default_call_conv(), isa.pointer_type())?;

    let mut bodies = Vec::with_capacity(module.bodies.len());
    let mut func_builder_ctx = FunctionBuilderContext::new();
    let mut codegen_ctx = Context::new();

    for def_index in 0..module.bodies.len() as u32 {
        codegen_ctx.clear();
        translate::translate_function(&env, def_index, &mut codegen_ctx.func, &mut func_builder_ctx)?;

        let mut ctrl_plane = ControlPlane::default();
        let compiled = codegen_ctx.compile(&*isa, &mut ctrl_plane).map_err(|e| {
            CompileError::Codegen(format!("Failed to compile function {}: {:?}", def_index, e.inner))
        })?;

        if let Some(reloc) = compiled.buffer.relocs().first() {
            return Err(CompileError::Codegen(format!(
                "Function {} needs a relocation at offset {}",
                def_index, reloc.offset
            )));
        }
        bodies.push(compiled.code_buffer().to_vec());
    }

    let compiled = layout::assemble(&env, limits, &bodies)?;
    log::debug!(
        "Compiled {} functions into {} bytes (table of {})",
        bodies.len(),
        compiled.code.len(),
        compiled.meta.table_len
    );
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codegen_version_tracks_intrinsic_table() {
        assert_eq!(CODEGEN_VERSION & 0x0f, INTRINSIC_TABLE_VERSION);
        assert_ne!(CODEGEN_VERSION, 0);
    }

    #[test]
    fn test_invalid_bytecode_is_a_validation_error() {
        let result = compile_bytecode(b"not wasm", &WasmLimits::default());
        assert!(matches!(result, Err(CompileError::Validation(ValidationError::Parse(_)))));
    }
}
