//! Shared fixtures for engine integration tests
//!
//! `ContractBuilder` assembles small wasm modules with `wasm-encoder`;
//! `run` compiles one and executes its `apply` export.

#![allow(dead_code)]

use std::borrow::Cow;

use ocvm_engine::{
    compile_bytecode, ApplyContext, ContentHash, ExecutableBuffer, ExecutionError, ExecutionLimits,
    ExecutionReport, Executor, InMemoryContext, WasmLimits,
};
use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, ElementSection, Elements, EntityType, ExportKind,
    ExportSection, Function, FunctionSection, GlobalSection, GlobalType, ImportSection,
    Instruction, MemorySection, MemoryType, Module, RefType, StartSection, TableSection,
    TableType, TypeSection, ValType,
};

pub use wasm_encoder::{BlockType, Instruction as I, MemArg, ValType as V};

pub const RECEIVER: u64 = 0x5530_ea03_3482_a600;
pub const ACTION: u64 = 0x3232_eda8_0000_0000;

struct Func {
    ty: u32,
    locals: Vec<(u32, ValType)>,
    body: Vec<Instruction<'static>>,
}

/// Incremental wasm module builder
///
/// Imports must be added before functions so indices come out in order.
#[derive(Default)]
pub struct ContractBuilder {
    types: Vec<(Vec<ValType>, Vec<ValType>)>,
    imports: Vec<(String, String, u32)>,
    functions: Vec<Func>,
    memory: Option<(u64, Option<u64>)>,
    table: Option<u64>,
    elements: Vec<(i32, Vec<u32>)>,
    globals: Vec<(ValType, bool, ConstExpr)>,
    data: Vec<(i32, Vec<u8>)>,
    exports: Vec<(String, u32)>,
    start: Option<u32>,
}

impl ContractBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ty(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        let key = (params.to_vec(), results.to_vec());
        if let Some(i) = self.types.iter().position(|t| *t == key) {
            return i as u32;
        }
        self.types.push(key);
        (self.types.len() - 1) as u32
    }

    /// Import `env.<name>` and return its function index
    pub fn import(&mut self, name: &str, params: &[ValType], results: &[ValType]) -> u32 {
        self.import_from("env", name, params, results)
    }

    pub fn import_from(&mut self, module: &str, name: &str, params: &[ValType], results: &[ValType]) -> u32 {
        assert!(self.functions.is_empty(), "imports must precede functions");
        let ty = self.ty(params, results);
        self.imports.push((module.to_string(), name.to_string(), ty));
        (self.imports.len() - 1) as u32
    }

    /// Define a function; the body must end with `End`
    pub fn function(
        &mut self,
        params: &[ValType],
        results: &[ValType],
        locals: &[(u32, ValType)],
        body: Vec<Instruction<'static>>,
    ) -> u32 {
        let ty = self.ty(params, results);
        self.functions.push(Func { ty, locals: locals.to_vec(), body });
        (self.imports.len() + self.functions.len() - 1) as u32
    }

    /// Define and export `apply(receiver, account, action)`
    pub fn apply(&mut self, locals: &[(u32, ValType)], body: Vec<Instruction<'static>>) -> u32 {
        let index = self.function(&[ValType::I64; 3], &[], locals, body);
        self.export("apply", index);
        index
    }

    pub fn export(&mut self, name: &str, index: u32) -> &mut Self {
        self.exports.push((name.to_string(), index));
        self
    }

    pub fn memory(&mut self, minimum: u64, maximum: Option<u64>) -> &mut Self {
        self.memory = Some((minimum, maximum));
        self
    }

    pub fn table(&mut self, size: u64) -> &mut Self {
        self.table = Some(size);
        self
    }

    pub fn elements(&mut self, offset: i32, functions: &[u32]) -> &mut Self {
        self.elements.push((offset, functions.to_vec()));
        self
    }

    pub fn global_i32(&mut self, mutable: bool, init: i32) -> u32 {
        self.globals.push((ValType::I32, mutable, ConstExpr::i32_const(init)));
        (self.globals.len() - 1) as u32
    }

    pub fn global_i64(&mut self, mutable: bool, init: i64) -> u32 {
        self.globals.push((ValType::I64, mutable, ConstExpr::i64_const(init)));
        (self.globals.len() - 1) as u32
    }

    pub fn data(&mut self, offset: i32, bytes: &[u8]) -> &mut Self {
        self.data.push((offset, bytes.to_vec()));
        self
    }

    pub fn start(&mut self, index: u32) -> &mut Self {
        self.start = Some(index);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut module = Module::new();

        let mut types = TypeSection::new();
        for (params, results) in &self.types {
            types.ty().function(params.iter().copied(), results.iter().copied());
        }
        module.section(&types);

        if !self.imports.is_empty() {
            let mut imports = ImportSection::new();
            for (m, name, ty) in &self.imports {
                imports.import(m, name, EntityType::Function(*ty));
            }
            module.section(&imports);
        }

        let mut functions = FunctionSection::new();
        for func in &self.functions {
            functions.function(func.ty);
        }
        module.section(&functions);

        if let Some(size) = self.table {
            let mut tables = TableSection::new();
            tables.table(TableType {
                element_type: RefType::FUNCREF,
                table64: false,
                minimum: size,
                maximum: Some(size),
                shared: false,
            });
            module.section(&tables);
        }

        if let Some((minimum, maximum)) = self.memory {
            let mut memories = MemorySection::new();
            memories.memory(MemoryType {
                minimum,
                maximum,
                memory64: false,
                shared: false,
                page_size_log2: None,
            });
            module.section(&memories);
        }

        if !self.globals.is_empty() {
            let mut globals = GlobalSection::new();
            for (val_type, mutable, init) in &self.globals {
                globals.global(GlobalType { val_type: *val_type, mutable: *mutable, shared: false }, init);
            }
            module.section(&globals);
        }

        let mut exports = ExportSection::new();
        for (name, index) in &self.exports {
            exports.export(name, ExportKind::Func, *index);
        }
        module.section(&exports);

        if let Some(function_index) = self.start {
            module.section(&StartSection { function_index });
        }

        if !self.elements.is_empty() {
            let mut elements = ElementSection::new();
            for (offset, functions) in &self.elements {
                elements.active(
                    None,
                    &ConstExpr::i32_const(*offset),
                    Elements::Functions(Cow::Borrowed(&functions[..])),
                );
            }
            module.section(&elements);
        }

        let mut code = CodeSection::new();
        for func in &self.functions {
            let mut f = Function::new(func.locals.iter().copied());
            for instruction in &func.body {
                f.instruction(instruction);
            }
            code.function(&f);
        }
        module.section(&code);

        if !self.data.is_empty() {
            let mut data = DataSection::new();
            for (offset, bytes) in &self.data {
                data.active(0, &ConstExpr::i32_const(*offset), bytes.iter().copied());
            }
            module.section(&data);
        }

        module.finish()
    }
}

pub fn mem(offset: u64) -> MemArg {
    MemArg { offset, align: 0, memory_index: 0 }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Apply context addressed to `RECEIVER` with the given payload
pub fn context(data: &[u8]) -> InMemoryContext {
    InMemoryContext::new(RECEIVER, RECEIVER, ACTION, data.to_vec())
}

/// Compile `bytes` and run its `apply` once on a fresh executor
pub fn run(
    bytes: &[u8],
    ctx: &mut dyn ApplyContext,
    limits: &ExecutionLimits,
) -> Result<ExecutionReport, ExecutionError> {
    let mut executor = Executor::new(&WasmLimits::default()).unwrap();
    run_on(&mut executor, bytes, ctx, limits)
}

/// Compile `bytes` and run its `apply` on `executor`
pub fn run_on(
    executor: &mut Executor,
    bytes: &[u8],
    ctx: &mut dyn ApplyContext,
    limits: &ExecutionLimits,
) -> Result<ExecutionReport, ExecutionError> {
    init_logging();
    let compiled = compile_bytecode(bytes, &WasmLimits::default()).unwrap();
    let code = ExecutableBuffer::new(&compiled.code).unwrap();
    let descriptor = compiled.descriptor_at(ContentHash::of(bytes), 0, 0);
    executor.execute(&descriptor, &code, ctx, limits)
}
