//! Wasm front end
//!
//! Bytecode enters here and leaves as a validated, metered `Module` ready
//! for the compiler:
//!
//! ```text
//! bytes -> parse -> section checks -> decode (allow-list) -> module checks -> inject
//! ```

mod encode;
mod error;
mod inject;
mod module;
mod op;
mod parse;
mod validate;

pub use encode::encode_module;
pub use error::ValidationError;
pub use inject::inject_metering;
pub use module::{
    ConstValue, DataSegment, ElementSegment, Export, ExportKind, FuncType, FunctionBody, Global,
    Import, Memory, Module, Table, ValType, WASM_PAGE_SIZE,
};
pub use op::{
    walk, Access, BlockType, Conversion, FloatBinary, FloatCompare, FloatUnary, FloatWidth,
    IntBinary, IntCompare, IntUnary, IntWidth, MemArg, Op, OpVisitor,
};
pub use parse::parse_module;
pub use validate::{validate_bytecode, validate_module, ENTRY_POINT};

use crate::limits::WasmLimits;

/// Validate `bytes` and inject metering, producing a module ready to compile
pub fn prepare(bytes: &[u8], limits: &WasmLimits) -> Result<Module, ValidationError> {
    let mut module = validate_bytecode(bytes, limits)?;
    inject_metering(&mut module);
    log::debug!(
        "Prepared module: {} functions, {} imports, {} types",
        module.functions.len(),
        module.imports.len(),
        module.types.len()
    );
    Ok(module)
}
