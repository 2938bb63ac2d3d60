//! Static module validation
//!
//! Constraint checks run in a fixed order:
//! 1. initial linear memory within the page ceiling
//! 2. data segments within the initial-memory window
//! 3. table (and its element segments) within the element ceiling
//! 4. mutable-global storage within the byte ceiling
//! 5. every operator on the allow-list
//!
//! followed by the whole-module checks: imports resolve to intrinsics,
//! section sizes, per-function locals, nesting depth, and the `apply`
//! entry point.

use crate::intrinsics::Intrinsic;
use crate::limits::WasmLimits;

use super::error::ValidationError;
use super::module::{Module, ValType, WASM_PAGE_SIZE};
use super::op::{walk, Op, OpVisitor};
use super::parse::RawModule;

/// Name of the exported entry point
pub const ENTRY_POINT: &str = "apply";

/// Parse `bytes` and check it against `limits`
pub fn validate_bytecode(bytes: &[u8], limits: &WasmLimits) -> Result<Module, ValidationError> {
    if bytes.len() as u64 > limits.max_code_bytes {
        return Err(ValidationError::CodeTooLarge {
            bytes: bytes.len() as u64,
            max: limits.max_code_bytes,
        });
    }

    let raw = RawModule::parse(bytes)?;
    check_sections(&raw.module, limits)?;
    let module = raw.decode_bodies()?;
    check_module(&module, limits)?;
    Ok(module)
}

/// Re-check an already decoded module, e.g. after injection
pub fn validate_module(module: &Module, limits: &WasmLimits) -> Result<(), ValidationError> {
    check_sections(module, limits)?;
    check_module(module, limits)
}

// ============================================================================
// Section constraints (checks 1-4)
// ============================================================================

fn check_sections(module: &Module, limits: &WasmLimits) -> Result<(), ValidationError> {
    let initial_pages = module.memory.map(|m| m.initial).unwrap_or(0);
    if initial_pages > limits.max_pages() {
        return Err(ValidationError::MemoryTooLarge { pages: initial_pages, max: limits.max_pages() });
    }

    let window = limits
        .max_linear_memory_init
        .min(initial_pages as u64 * WASM_PAGE_SIZE);
    for segment in &module.data {
        if segment.offset as u64 + segment.data.len() as u64 > window {
            return Err(ValidationError::DataSegmentOutOfBounds {
                offset: segment.offset,
                len: segment.data.len(),
                window,
            });
        }
    }

    let table_size = module.table.map(|t| t.initial).unwrap_or(0);
    if table_size > limits.max_table_elements {
        return Err(ValidationError::TableTooLarge { elements: table_size, max: limits.max_table_elements });
    }
    for segment in &module.elements {
        if segment.offset as u64 + segment.functions.len() as u64 > table_size as u64 {
            return Err(ValidationError::ElementSegmentOutOfBounds {
                offset: segment.offset,
                len: segment.functions.len(),
                table_size,
            });
        }
    }

    let global_bytes: u32 = module
        .globals
        .iter()
        .filter(|g| g.mutable)
        .map(|g| g.ty.byte_width())
        .sum();
    if global_bytes > limits.max_mutable_global_bytes {
        return Err(ValidationError::MutableGlobalsTooLarge {
            bytes: global_bytes,
            max: limits.max_mutable_global_bytes,
        });
    }

    Ok(())
}

// ============================================================================
// Whole-module constraints
// ============================================================================

fn check_module(module: &Module, limits: &WasmLimits) -> Result<(), ValidationError> {
    let max = limits.max_section_elements;
    let sections: [(&'static str, usize); 7] = [
        ("type", module.types.len()),
        ("import", module.imports.len()),
        ("function", module.functions.len()),
        ("global", module.globals.len()),
        ("export", module.exports.len()),
        ("element", module.elements.iter().map(|e| e.functions.len()).sum()),
        ("data", module.data.len()),
    ];
    for (section, count) in sections {
        if count > max as usize {
            return Err(ValidationError::SectionTooLarge { section, count, max });
        }
    }

    if module.types.iter().any(|t| t.results.len() > 1) {
        return Err(ValidationError::unsupported("multi-value results"));
    }

    for import in &module.imports {
        let resolved = module
            .types
            .get(import.type_index as usize)
            .and_then(|ty| Intrinsic::resolve_import(&import.module, &import.name, ty));
        if resolved.is_none() {
            return Err(ValidationError::UnresolvableImport {
                module: import.module.clone(),
                name: import.name.clone(),
            });
        }
    }

    // Table slots hold compiled code offsets, which intrinsics do not have
    let imported = module.num_imported_functions();
    if module.elements.iter().flat_map(|e| &e.functions).any(|&f| f < imported) {
        return Err(ValidationError::unsupported("imported function in table"));
    }

    for (i, body) in module.bodies.iter().enumerate() {
        let func_index = i as u32;
        let params = module
            .types
            .get(module.functions[i] as usize)
            .map(|t| t.params.iter().map(|p| p.byte_width() as u64).sum::<u64>())
            .unwrap_or(0);
        let locals: u64 = body
            .locals
            .iter()
            .map(|&(count, ty)| count as u64 * ty.byte_width() as u64)
            .sum();
        if params + locals > limits.max_func_local_bytes as u64 {
            return Err(ValidationError::FunctionLocalsTooLarge {
                func_index,
                bytes: params + locals,
                max: limits.max_func_local_bytes,
            });
        }

        let mut filter = OpcodeFilter::new(func_index, limits);
        walk(&body.ops, &mut filter)?;
    }

    let entry_ok = module.exported_function(ENTRY_POINT).is_some_and(|index| {
        index >= module.num_imported_functions()
            && module.func_type(index).is_some_and(|ty| {
                ty.params == [ValType::I64, ValType::I64, ValType::I64] && ty.results.is_empty()
            })
    });
    if !entry_ok {
        return Err(ValidationError::MissingEntryPoint);
    }

    Ok(())
}

/// Per-operator structural limits
struct OpcodeFilter {
    func_index: u32,
    depth: u32,
    max_depth: u32,
    max_targets: u32,
}

impl OpcodeFilter {
    fn new(func_index: u32, limits: &WasmLimits) -> Self {
        OpcodeFilter {
            func_index,
            depth: 0,
            max_depth: limits.max_nesting_depth,
            max_targets: limits.max_section_elements,
        }
    }
}

impl OpVisitor for OpcodeFilter {
    type Error = ValidationError;

    fn visit(&mut self, op: &Op) -> Result<(), ValidationError> {
        match op {
            op if op.opens_frame() => {
                self.depth += 1;
                if self.depth > self.max_depth {
                    return Err(ValidationError::NestingTooDeep {
                        func_index: self.func_index,
                        depth: self.depth,
                        max: self.max_depth,
                    });
                }
            }
            Op::End => self.depth = self.depth.saturating_sub(1),
            Op::BrTable { targets, .. } if targets.len() > self.max_targets as usize => {
                return Err(ValidationError::SectionTooLarge {
                    section: "br_table",
                    count: targets.len(),
                    max: self.max_targets,
                });
            }
            _ => {}
        }
        Ok(())
    }
}
