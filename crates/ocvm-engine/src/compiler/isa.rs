//! Host target selection

use std::sync::Arc;

use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use target_lexicon::Architecture;

use super::CompileError;

/// Create the native code ISA for the current platform
///
/// Generated code must be position independent, must produce canonical
/// NaNs, and must not emit stack probes (the call-depth check bounds stack
/// use instead).
pub fn create_native_isa() -> Result<Arc<dyn TargetIsa>, CompileError> {
    let mut flag_builder = settings::builder();
    for (name, value) in [
        ("opt_level", "speed"),
        ("is_pic", "true"),
        ("enable_nan_canonicalization", "true"),
        ("enable_probestack", "false"),
    ] {
        flag_builder
            .set(name, value)
            .map_err(|e| CompileError::Codegen(format!("Failed to set {}: {}", name, e)))?;
    }
    let flags = settings::Flags::new(flag_builder);

    let isa = cranelift_native::builder()
        .map_err(|e| CompileError::Codegen(format!("Failed to create native ISA: {}", e)))?
        .finish(flags)
        .map_err(|e| CompileError::Codegen(format!("Failed to finish ISA: {}", e)))?;

    let supported = matches!(
        isa.triple().architecture,
        Architecture::X86_64 | Architecture::Aarch64(_)
    ) && isa.pointer_bytes() == 8;
    if !supported {
        return Err(CompileError::Codegen(format!("Unsupported target {}", isa.triple())));
    }
    Ok(isa)
}
