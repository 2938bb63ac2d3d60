//! Owned module IR
//!
//! Only the MVP shapes the runtime accepts are representable: one optional
//! memory, one optional funcref table, function imports, constant-offset
//! active segments.

use super::op::Op;

/// Size of one linear-memory page
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit IEEE float
    F32,
    /// 64-bit IEEE float
    F64,
}

impl ValType {
    /// Storage width in bytes
    pub fn byte_width(self) -> u32 {
        match self {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
        }
    }
}

/// Function signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    /// Parameter types
    pub params: Vec<ValType>,
    /// Result types (at most one)
    pub results: Vec<ValType>,
}

impl FuncType {
    /// Build a signature
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        FuncType { params: params.to_vec(), results: results.to_vec() }
    }
}

/// A function import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Import module name
    pub module: String,
    /// Import field name
    pub name: String,
    /// Index into `Module::types`
    pub type_index: u32,
}

/// The indirect-call table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    /// Initial element count
    pub initial: u32,
    /// Declared maximum
    pub maximum: Option<u32>,
}

/// The linear memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    /// Initial pages
    pub initial: u32,
    /// Declared maximum pages
    pub maximum: Option<u32>,
}

/// A constant initializer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstValue {
    /// `i32.const`
    I32(i32),
    /// `i64.const`
    I64(i64),
    /// `f32.const`, raw bits
    F32(u32),
    /// `f64.const`, raw bits
    F64(u64),
}

impl ConstValue {
    /// Type of the constant
    pub fn ty(self) -> ValType {
        match self {
            ConstValue::I32(_) => ValType::I32,
            ConstValue::I64(_) => ValType::I64,
            ConstValue::F32(_) => ValType::F32,
            ConstValue::F64(_) => ValType::F64,
        }
    }

    /// Bits as stored in an 8-byte global slot
    pub fn bits(self) -> u64 {
        match self {
            ConstValue::I32(v) => v as u32 as u64,
            ConstValue::I64(v) => v as u64,
            ConstValue::F32(v) => v as u64,
            ConstValue::F64(v) => v,
        }
    }
}

/// A module-defined global
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global {
    /// Value type
    pub ty: ValType,
    /// Whether `global.set` may target it
    pub mutable: bool,
    /// Initial value
    pub init: ConstValue,
}

/// Export kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Function export
    Func,
    /// Table export
    Table,
    /// Memory export
    Memory,
    /// Global export
    Global,
}

/// An export entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Export name
    pub name: String,
    /// What is exported
    pub kind: ExportKind,
    /// Index in the corresponding index space
    pub index: u32,
}

/// Active element segment for table 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSegment {
    /// First table slot written
    pub offset: u32,
    /// Function indices placed in consecutive slots
    pub functions: Vec<u32>,
}

/// Active data segment for memory 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    /// Byte offset in linear memory
    pub offset: u32,
    /// Bytes written
    pub data: Vec<u8>,
}

/// A defined function's code
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionBody {
    /// Local declarations as `(count, type)` runs
    pub locals: Vec<(u32, ValType)>,
    /// Operators, including the final `end`
    pub ops: Vec<Op>,
}

impl FunctionBody {
    /// Iterate declared locals one by one
    pub fn local_types(&self) -> impl Iterator<Item = ValType> + '_ {
        self.locals
            .iter()
            .flat_map(|&(count, ty)| std::iter::repeat(ty).take(count as usize))
    }
}

/// A parsed module
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    /// Type section
    pub types: Vec<FuncType>,
    /// Function imports
    pub imports: Vec<Import>,
    /// Type index of each defined function
    pub functions: Vec<u32>,
    /// Optional table
    pub table: Option<Table>,
    /// Optional memory
    pub memory: Option<Memory>,
    /// Defined globals
    pub globals: Vec<Global>,
    /// Exports
    pub exports: Vec<Export>,
    /// Start function index
    pub start: Option<u32>,
    /// Element segments
    pub elements: Vec<ElementSegment>,
    /// Data segments
    pub data: Vec<DataSegment>,
    /// Bodies of defined functions, parallel to `functions`
    pub bodies: Vec<FunctionBody>,
}

impl Module {
    /// Number of imported functions; defined functions are indexed after them
    pub fn num_imported_functions(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Total function index space
    pub fn num_functions(&self) -> u32 {
        self.num_imported_functions() + self.functions.len() as u32
    }

    /// Type index of any function in the index space
    pub fn func_type_index(&self, func_index: u32) -> Option<u32> {
        let imported = self.num_imported_functions();
        if func_index < imported {
            self.imports.get(func_index as usize).map(|i| i.type_index)
        } else {
            self.functions.get((func_index - imported) as usize).copied()
        }
    }

    /// Signature of any function in the index space
    pub fn func_type(&self, func_index: u32) -> Option<&FuncType> {
        self.func_type_index(func_index)
            .and_then(|t| self.types.get(t as usize))
    }

    /// Index of an exported function by name
    pub fn exported_function(&self, name: &str) -> Option<u32> {
        self.exports
            .iter()
            .find(|e| e.kind == ExportKind::Func && e.name == name)
            .map(|e| e.index)
    }

    /// First type index structurally equal to `type_index`
    ///
    /// Indirect calls compare these canonical indices, so two identical
    /// signatures declared twice still match.
    pub fn canonical_type(&self, type_index: u32) -> u32 {
        let Some(ty) = self.types.get(type_index as usize) else {
            return type_index;
        };
        self.types
            .iter()
            .position(|t| t == ty)
            .map(|p| p as u32)
            .unwrap_or(type_index)
    }

    /// Index of `ty` in the type section, appending it if absent
    pub fn intern_type(&mut self, ty: FuncType) -> u32 {
        if let Some(pos) = self.types.iter().position(|t| *t == ty) {
            return pos as u32;
        }
        self.types.push(ty);
        (self.types.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_index_space() {
        let mut module = Module::default();
        let sig = module.intern_type(FuncType::new(&[ValType::I32], &[]));
        let other = module.intern_type(FuncType::new(&[], &[ValType::I64]));
        module.imports.push(Import { module: "env".into(), name: "f".into(), type_index: sig });
        module.functions.push(other);

        assert_eq!(module.num_functions(), 2);
        assert_eq!(module.func_type(0).map(|t| t.params.len()), Some(1));
        assert_eq!(module.func_type(1).map(|t| t.results.clone()), Some(vec![ValType::I64]));
        assert!(module.func_type(2).is_none());
    }

    #[test]
    fn test_canonical_type_merges_duplicates() {
        let mut module = Module::default();
        module.types.push(FuncType::new(&[ValType::I32], &[]));
        module.types.push(FuncType::new(&[], &[]));
        module.types.push(FuncType::new(&[ValType::I32], &[]));
        assert_eq!(module.canonical_type(2), 0);
        assert_eq!(module.canonical_type(1), 1);
    }

    #[test]
    fn test_const_bits() {
        assert_eq!(ConstValue::I32(-1).bits(), 0xffff_ffff);
        assert_eq!(ConstValue::I64(-1).bits(), u64::MAX);
        assert_eq!(ConstValue::F32(1.0f32.to_bits()).bits(), 0x3f80_0000);
    }
}
