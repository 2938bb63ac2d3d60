//! Calling convention of generated code
//!
//! Every function, compiled or intrinsic, takes `vmctx` as its first
//! argument followed by its wasm parameters, and returns at most one value.

use cranelift_codegen::ir::{types, AbiParam, Signature, Type};
use cranelift_codegen::isa::CallConv;

use crate::exec::context::offsets;
use crate::intrinsics::Intrinsic;
use crate::wasm::{FuncType, ValType};

pub(crate) use offsets::*;

/// Native type of a wasm value
pub(crate) fn clif_type(ty: ValType) -> Type {
    match ty {
        ValType::I32 => types::I32,
        ValType::I64 => types::I64,
        ValType::F32 => types::F32,
        ValType::F64 => types::F64,
    }
}

/// Signature of a function with wasm type `ty`
pub(crate) fn wasm_signature(ty: &FuncType, call_conv: CallConv, pointer: Type) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(pointer));
    sig.params.extend(ty.params.iter().map(|&p| AbiParam::new(clif_type(p))));
    sig.returns.extend(ty.results.iter().map(|&r| AbiParam::new(clif_type(r))));
    sig
}

/// Signature of an intrinsic
pub(crate) fn intrinsic_signature(intrinsic: Intrinsic, call_conv: CallConv, pointer: Type) -> Signature {
    wasm_signature(&intrinsic.signature(), call_conv, pointer)
}

/// Offset of an intrinsic's table slot from `vmctx`
pub(crate) fn intrinsic_offset(intrinsic: Intrinsic) -> i32 {
    INTRINSICS + intrinsic.ordinal() as i32 * 8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_has_leading_vmctx() {
        let ty = FuncType::new(&[ValType::I32, ValType::F64], &[ValType::I64]);
        let sig = wasm_signature(&ty, CallConv::SystemV, types::I64);
        assert_eq!(sig.params.len(), 3);
        assert_eq!(sig.params[0].value_type, types::I64);
        assert_eq!(sig.params[2].value_type, types::F64);
        assert_eq!(sig.returns.len(), 1);
    }

    #[test]
    fn test_intrinsic_slots_are_consecutive() {
        let a = intrinsic_offset(Intrinsic::TrapUnreachable);
        let b = intrinsic_offset(Intrinsic::TrapInteger);
        assert_eq!(b - a, 8);
        assert_eq!(a, INTRINSICS);
    }
}
