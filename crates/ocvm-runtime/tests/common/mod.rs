//! Shared fixtures for runtime integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ocvm_engine::{
    CodeTuple, CompiledModule, ContentHash, InMemoryContext, InitData, ModuleMeta, StartFunction, WasmLimits,
    CODEGEN_VERSION,
};
use ocvm_runtime::{CacheConfig, CompileBackend, Isolation, OrchestratorError, RuntimeConfig};
use tempfile::TempDir;
use wasm_encoder::{
    CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, ImportSection, Instruction,
    Module, TypeSection, ValType,
};

pub const RECEIVER: u64 = 0x5530_ea03_3482_a600;
pub const ACTION: u64 = 0x3232_eda8_0000_0000;

/// Arena size used by most cache tests
pub const SMALL_ARENA: u64 = 64 * 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scratch directory on the target filesystem
///
/// The cache maps its file executable, which a `noexec` `/tmp` would refuse.
pub fn scratch_dir() -> TempDir {
    init_logging();
    tempfile::Builder::new()
        .prefix("ocvm-")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .unwrap()
}

pub fn cache_config(dir: &Path, arena: u64) -> CacheConfig {
    CacheConfig {
        path: dir.join("code_cache.bin"),
        size: ocvm_runtime::cache::ARENA_START + arena,
        eviction_watermark: 0.10,
        eviction_batch: 2,
    }
}

pub fn runtime_config(dir: &Path, isolation: Isolation) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.cache = cache_config(dir, 16 * 1024 * 1024);
    config.compile.workers = 2;
    config.compile.isolation = isolation;
    config.compile.worker_executable = Some(PathBuf::from(env!("CARGO_BIN_EXE_ocvm-compile-worker")));
    config
}

pub fn tuple_of(bytecode: &[u8]) -> CodeTuple {
    CodeTuple::new(ContentHash::of(bytecode), 0)
}

pub fn meta() -> ModuleMeta {
    ModuleMeta {
        codegen_version: CODEGEN_VERSION,
        apply_offset: 0,
        start: StartFunction::None,
        starting_memory_pages: 0,
        max_memory_pages: 0,
        table_offset: 0,
        table_len: 0,
        function_offsets: Vec::new(),
        init_data: InitData::default(),
    }
}

/// A non-executable blob of `size` copies of `fill`
pub fn blob(fill: u8, size: usize) -> CompiledModule {
    CompiledModule { code: vec![fill; size], meta: meta() }
}

pub fn key(n: u8) -> CodeTuple {
    CodeTuple::new(ContentHash([n; 32]), 0)
}

/// A contract whose `apply` prints `value`
pub fn printing_contract(value: i64) -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I64], []);
    types.ty().function([ValType::I64; 3], []);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("env", "printi", EntityType::Function(0));
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(1);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("apply", ExportKind::Func, 1);
    module.section(&exports);

    let mut code = CodeSection::new();
    let mut apply = Function::new([]);
    apply.instruction(&Instruction::I64Const(value));
    apply.instruction(&Instruction::Call(0));
    apply.instruction(&Instruction::End);
    code.function(&apply);
    module.section(&code);

    module.finish()
}

/// A well-formed module with no `apply` export
pub fn contract_without_apply() -> Vec<u8> {
    Module::new().finish()
}

pub fn context() -> InMemoryContext {
    InMemoryContext::new(RECEIVER, RECEIVER, ACTION, Vec::new())
}

/// Poll `condition` until it holds, failing the test after ten seconds
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Backend that fabricates code blobs without compiling
///
/// Bytecode starting with `bad` fails. A gated backend holds every compile
/// until `release` lets it through.
pub struct FakeBackend {
    compiles: AtomicUsize,
    code_size: usize,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl FakeBackend {
    pub fn new(code_size: usize) -> Arc<Self> {
        Arc::new(FakeBackend { compiles: AtomicUsize::new(0), code_size, gate: None })
    }

    pub fn gated(code_size: usize) -> Arc<Self> {
        Arc::new(FakeBackend { compiles: AtomicUsize::new(0), code_size, gate: Some(unbounded()) })
    }

    /// Let `count` held compiles finish
    pub fn release(&self, count: usize) {
        if let Some((sender, _)) = &self.gate {
            for _ in 0..count {
                sender.send(()).unwrap();
            }
        }
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl CompileBackend for FakeBackend {
    fn compile(&self, tuple: CodeTuple, bytecode: &[u8], _limits: &WasmLimits) -> Result<CompiledModule, OrchestratorError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some((_, receiver)) = &self.gate {
            receiver.recv().unwrap();
        }
        if bytecode.starts_with(b"bad") {
            return Err(OrchestratorError::CompileFailed { tuple, message: "rejected by fake backend".to_string() });
        }
        Ok(blob(tuple.code_hash.0[0], self.code_size))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
