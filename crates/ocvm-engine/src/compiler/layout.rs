//! Code blob assembly
//!
//! ```text
//! +--------------------------------------+ 0
//! | function offset table   u64 * n      |
//! +--------------------------------------+ table_offset = 8 * n
//! | indirect table  {tag u64, target u64} * table_len
//! +--------------------------------------+ 16-byte aligned
//! | function bodies, each 16-byte aligned |
//! +--------------------------------------+
//! ```
//!
//! All offsets are relative to the blob start, so the blob can be copied
//! anywhere. Empty indirect slots carry `NULL_TAG`, which no canonical
//! type index can equal.

use crate::descriptor::{CompiledModule, InitData, ModuleMeta, StartFunction};
use crate::limits::WasmLimits;
use crate::wasm::ENTRY_POINT;

use super::translate::ModuleEnv;
use super::{CompileError, CODEGEN_VERSION};

/// Alignment of each function body in the blob
const FUNC_ALIGN: usize = 16;

/// Type tag of an empty indirect-table slot
pub(crate) const NULL_TAG: u64 = u64::MAX;

fn align(len: usize) -> usize {
    (len + FUNC_ALIGN - 1) & !(FUNC_ALIGN - 1)
}

/// Lay out compiled function bodies and derive the module metadata
pub(super) fn assemble(
    env: &ModuleEnv<'_>,
    limits: &WasmLimits,
    bodies: &[Vec<u8>],
) -> Result<CompiledModule, CompileError> {
    let module = env.module;
    let imported = module.num_imported_functions();
    let table_len = env.table_len as usize;

    let header = env.table_offset as usize + table_len * 16;
    let mut code = vec![0u8; align(header)];
    let mut function_offsets = Vec::with_capacity(bodies.len());
    for body in bodies {
        code.resize(align(code.len()), 0);
        function_offsets.push(code.len() as u64);
        code.extend_from_slice(body);
    }

    for (i, offset) in function_offsets.iter().enumerate() {
        code[i * 8..i * 8 + 8].copy_from_slice(&offset.to_le_bytes());
    }

    let defined_offset = |func_index: u32| -> Result<u64, CompileError> {
        func_index
            .checked_sub(imported)
            .and_then(|def| function_offsets.get(def as usize).copied())
            .ok_or_else(|| {
                CompileError::Codegen(format!("Function {} is not a defined function", func_index))
            })
    };

    let mut slots = vec![(NULL_TAG, 0u64); table_len];
    for segment in &module.elements {
        for (i, &func_index) in segment.functions.iter().enumerate() {
            let type_index = module.func_type_index(func_index).ok_or_else(|| {
                CompileError::Codegen(format!("Function {} has no type", func_index))
            })?;
            let slot = slots.get_mut(segment.offset as usize + i).ok_or_else(|| {
                CompileError::Codegen("Element segment outside the table".to_string())
            })?;
            *slot = (u64::from(module.canonical_type(type_index)), defined_offset(func_index)?);
        }
    }
    for (i, (tag, target)) in slots.iter().enumerate() {
        let at = env.table_offset as usize + i * 16;
        code[at..at + 8].copy_from_slice(&tag.to_le_bytes());
        code[at + 8..at + 16].copy_from_slice(&target.to_le_bytes());
    }

    let apply = module
        .exported_function(ENTRY_POINT)
        .ok_or_else(|| CompileError::Codegen("No apply export".to_string()))?;
    let apply_offset = defined_offset(apply)?;

    let start = match module.start {
        None => StartFunction::None,
        Some(index) if index < imported => {
            StartFunction::Intrinsic(env.imports[index as usize].ordinal())
        }
        Some(index) => StartFunction::CodeOffset(defined_offset(index)?),
    };

    let ceiling = limits.max_pages();
    let starting_memory_pages = module.memory.map(|m| m.initial).unwrap_or(0);
    let max_memory_pages = module
        .memory
        .and_then(|m| m.maximum)
        .unwrap_or(ceiling)
        .min(ceiling)
        .max(starting_memory_pages);

    let init_data = InitData {
        globals: module
            .globals
            .iter()
            .filter(|g| g.mutable)
            .map(|g| g.init.bits())
            .collect(),
        segments: module
            .data
            .iter()
            .map(|segment| (segment.offset, segment.data.clone()))
            .collect(),
    };

    Ok(CompiledModule {
        code,
        meta: ModuleMeta {
            codegen_version: CODEGEN_VERSION,
            apply_offset,
            start,
            starting_memory_pages,
            max_memory_pages,
            table_offset: env.table_offset,
            table_len: env.table_len,
            function_offsets,
            init_data,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::{
        ElementSegment, Export, ExportKind, FuncType, FunctionBody, Global, ConstValue, Memory,
        Module, Table, ValType,
    };
    use cranelift_codegen::ir::types;
    use cranelift_codegen::isa::CallConv;

    fn module() -> Module {
        let mut module = Module::default();
        let apply = module.intern_type(FuncType::new(&[ValType::I64, ValType::I64, ValType::I64], &[]));
        let other = module.intern_type(FuncType::new(&[], &[ValType::I32]));
        module.functions = vec![apply, other, other];
        module.bodies = vec![FunctionBody::default(); 3];
        module.exports.push(Export { name: "apply".into(), kind: ExportKind::Func, index: 0 });
        module.table = Some(Table { initial: 3, maximum: None });
        module.elements.push(ElementSegment { offset: 1, functions: vec![2, 1] });
        module.memory = Some(Memory { initial: 2, maximum: Some(4096) });
        module.globals = vec![
            Global { ty: ValType::I32, mutable: false, init: ConstValue::I32(1) },
            Global { ty: ValType::I64, mutable: true, init: ConstValue::I64(-2) },
        ];
        module
    }

    fn read_u64(code: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(code[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn test_blob_tables() {
        let module = module();
        let env = ModuleEnv::new(&module, CallConv::SystemV, types::I64).unwrap();
        let bodies = vec![vec![0xc3; 5], vec![0xc3; 17], vec![0xc3; 1]];
        let compiled = assemble(&env, &WasmLimits::default(), &bodies).unwrap();
        let meta = &compiled.meta;

        assert_eq!(meta.table_offset, 24);
        assert_eq!(meta.table_len, 3);
        // header of 24 + 48 bytes rounds up to 80
        assert_eq!(meta.function_offsets, vec![80, 96, 128]);
        assert_eq!(compiled.code.len(), 129);
        for (i, &offset) in meta.function_offsets.iter().enumerate() {
            assert_eq!(read_u64(&compiled.code, i * 8), offset);
        }

        assert_eq!(read_u64(&compiled.code, 24), NULL_TAG);
        assert_eq!(read_u64(&compiled.code, 40), 1);
        assert_eq!(read_u64(&compiled.code, 48), 128);
        assert_eq!(read_u64(&compiled.code, 56), 1);
        assert_eq!(read_u64(&compiled.code, 64), 96);
    }

    #[test]
    fn test_meta() {
        let module = module();
        let env = ModuleEnv::new(&module, CallConv::SystemV, types::I64).unwrap();
        let bodies = vec![vec![0; 4]; 3];
        let meta = assemble(&env, &WasmLimits::default(), &bodies).unwrap().meta;

        assert_eq!(meta.apply_offset, meta.function_offsets[0]);
        assert_eq!(meta.start, StartFunction::None);
        assert_eq!(meta.starting_memory_pages, 2);
        // declared maximum is clamped to the ceiling
        assert_eq!(meta.max_memory_pages, WasmLimits::default().max_pages());
        assert_eq!(meta.init_data.globals, vec![u64::MAX - 1]);
        assert_eq!(meta.codegen_version, CODEGEN_VERSION);
    }
}
