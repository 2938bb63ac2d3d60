//! Sandboxed execution of compiled code
//!
//! An `Executor` owns one linear-memory reservation, one `VmContext` and one
//! deadline watchdog, and runs one `apply` at a time on the calling thread.
//! Per call it:
//!
//! 1. checks the descriptor against the code region and its own limits
//! 2. zeroes the memory the previous call used and copies in `InitData`
//! 3. fills the control block (depth budget, memory size, code base,
//!    stack limit, deadline flag, host state)
//! 4. runs the start function, then `apply(receiver, account, action)`
//! 5. translates the trap slot into a result
//!
//! Generated code never unwinds: traps are written to the control block's
//! trap slot and each frame returns in turn.

mod apply;
mod code;
pub(crate) mod context;
mod error;
mod float;
mod host;
mod memory;
mod watchdog;

pub use apply::{ApplyContext, HostError, InMemoryContext};
pub use code::{ExecutableBuffer, ExecutableCode};
pub use error::{ExecutionError, TrapCode};
pub use memory::MemoryRegion;

use std::time::Instant;

use crate::compiler::CODEGEN_VERSION;
use crate::descriptor::{CodeDescriptor, ModuleMeta, StartFunction};
use crate::intrinsics::Intrinsic;
use crate::limits::{ExecutionLimits, WasmLimits};
use crate::wasm::WASM_PAGE_SIZE;

use context::{VmContext, SLOT_CLEAR, SLOT_EXIT, SLOT_HOST_ERROR, SLOT_PANIC};
use host::HostState;
use memory::LinearMemory;
use watchdog::Watchdog;

/// Signature of compiled `() -> ()` functions and void intrinsics
type StartFn = unsafe extern "C" fn(*mut u8);

/// Signature of the compiled `apply(i64, i64, i64)` export
type ApplyFn = unsafe extern "C" fn(*mut u8, i64, i64, i64);

/// Outcome of a successful `apply`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Metered instructions consumed
    pub instructions_used: u64,
    /// Text the contract printed
    pub console: String,
    /// Code passed to `exit`, if the contract called it
    pub exit_code: Option<i32>,
    /// Linear-memory size at return, in pages
    pub memory_pages: u32,
}

/// Runs compiled contracts on the calling thread
pub struct Executor {
    memory: LinearMemory,
    globals: Vec<u64>,
    ctx: Box<VmContext>,
    watchdog: Watchdog,
}

// Safety: every pointer inside refers to memory the executor owns, and
// `execute` takes `&mut self`.
unsafe impl Send for Executor {}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("reserved", &self.memory.reserved())
            .field("globals", &self.globals.len())
            .finish()
    }
}

impl Executor {
    /// Reserve memory for the largest module `limits` admits
    pub fn new(limits: &WasmLimits) -> Result<Self, ExecutionError> {
        let memory = LinearMemory::reserve(limits.max_pages() as u64 * WASM_PAGE_SIZE)?;
        Ok(Executor {
            memory,
            globals: Vec::new(),
            ctx: VmContext::new(host::table()),
            watchdog: Watchdog::new(),
        })
    }

    /// Linear memory as the last call left it
    pub fn memory(&mut self) -> MemoryRegion<'_> {
        MemoryRegion::of(&self.ctx)
    }

    /// Run the `apply` entry point of a compiled module
    ///
    /// `code` must be the region `descriptor.code_begin` is relative to.
    pub fn execute(
        &mut self,
        descriptor: &CodeDescriptor,
        code: &dyn ExecutableCode,
        apply: &mut dyn ApplyContext,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionReport, ExecutionError> {
        self.check_descriptor(descriptor, code)?;
        let meta = &descriptor.meta;
        let code_base = unsafe { code.base().add(descriptor.code_begin as usize) };

        self.prepare_memory(meta)?;

        let (receiver, account, action) = (apply.receiver(), apply.account(), apply.action());
        let mut host = HostState::new(apply);

        let stack_marker = 0u8;
        let stack_top = &stack_marker as *const u8 as usize;

        let control = &mut self.ctx.control;
        control.depth_remaining = limits.call_depth;
        control.current_pages = meta.starting_memory_pages;
        control.max_pages = meta.max_memory_pages;
        control.trap = SLOT_CLEAR;
        control.instructions_remaining = limits.instruction_budget;
        control.deadline = self.watchdog.flag();
        control.code_base = code_base;
        control.stack_limit = stack_top.saturating_sub(limits.native_stack_bytes as usize);
        control.host = &mut host as *mut HostState<'_> as *mut std::ffi::c_void;

        if let Some(deadline) = limits.deadline {
            if let Err(e) = self.watchdog.arm(Instant::now() + deadline) {
                self.ctx.control.host = std::ptr::null_mut();
                return Err(e);
            }
        }

        let vmctx = self.ctx.vmctx();
        unsafe {
            match meta.start {
                StartFunction::None => {}
                StartFunction::Intrinsic(ordinal) => {
                    let start: StartFn = std::mem::transmute(self.ctx.intrinsics[ordinal as usize]);
                    start(vmctx);
                }
                StartFunction::CodeOffset(offset) => {
                    let start: StartFn = std::mem::transmute(code_base.add(offset as usize));
                    start(vmctx);
                }
            }
            if self.ctx.control.trap == SLOT_CLEAR {
                let entry: ApplyFn = std::mem::transmute(code_base.add(meta.apply_offset as usize));
                entry(vmctx, receiver as i64, account as i64, action as i64);
            }
        }

        if limits.deadline.is_some() {
            if self.watchdog.is_raised() {
                log::debug!("{} ran past its deadline", descriptor.tuple());
            }
            self.watchdog.disarm();
        }
        self.memory.mark_used(self.ctx.memory_size);

        let control = &mut self.ctx.control;
        control.host = std::ptr::null_mut();
        let slot = control.trap;
        let report = ExecutionReport {
            instructions_used: limits.instruction_budget.saturating_sub(control.instructions_remaining),
            console: std::mem::take(&mut host.console),
            exit_code: host.exit_code,
            memory_pages: control.current_pages,
        };

        match slot {
            SLOT_CLEAR | SLOT_EXIT => Ok(report),
            SLOT_HOST_ERROR => Err(ExecutionError::Host(
                host.error
                    .take()
                    .unwrap_or_else(|| HostError::Other("unreported host failure".to_string())),
            )),
            SLOT_PANIC => Err(ExecutionError::Panic(host.panic.take().unwrap_or_default())),
            other => match TrapCode::from_slot(other) {
                Some(code) => {
                    log::debug!("{} trapped: {}", descriptor.tuple(), code);
                    Err(ExecutionError::Trap(code))
                }
                None => Err(ExecutionError::Panic(format!("Unknown trap slot {:#x}", other))),
            },
        }
    }

    fn check_descriptor(&self, descriptor: &CodeDescriptor, code: &dyn ExecutableCode) -> Result<(), ExecutionError> {
        let invalid = |msg: String| -> Result<(), ExecutionError> { Err(ExecutionError::InvalidDescriptor(msg)) };
        let meta = &descriptor.meta;

        if meta.codegen_version != CODEGEN_VERSION {
            return invalid(format!(
                "Code generated for ABI {:#x}, executor expects {:#x}",
                meta.codegen_version, CODEGEN_VERSION
            ));
        }
        let end = descriptor.code_begin.checked_add(descriptor.code_size);
        if end.is_none_or(|end| end > code.len() as u64) || code.base().is_null() {
            return invalid(format!(
                "Blob at {}+{} is outside the {}-byte code region",
                descriptor.code_begin,
                descriptor.code_size,
                code.len()
            ));
        }

        let size = descriptor.code_size;
        let table_end = meta.table_offset.saturating_add(16 * meta.table_len as u64);
        if meta.apply_offset >= size
            || table_end > size
            || meta.function_offsets.iter().any(|&offset| offset >= size)
        {
            return invalid("Offsets exceed the code blob".to_string());
        }
        match meta.start {
            StartFunction::None => {}
            StartFunction::CodeOffset(offset) if offset < size => {}
            StartFunction::Intrinsic(ordinal)
                if Intrinsic::from_ordinal(ordinal).is_some_and(|i| i.signature().params.is_empty()) => {}
            start => return invalid(format!("Unusable start function {:?}", start)),
        }

        let reserved_pages = (self.memory.reserved() as u64 / WASM_PAGE_SIZE) as u32;
        if meta.starting_memory_pages > meta.max_memory_pages || meta.max_memory_pages > reserved_pages {
            return invalid(format!(
                "Memory of {}..{} pages exceeds the {} reserved",
                meta.starting_memory_pages, meta.max_memory_pages, reserved_pages
            ));
        }
        Ok(())
    }

    fn prepare_memory(&mut self, meta: &ModuleMeta) -> Result<(), ExecutionError> {
        self.memory.reset();
        let starting_bytes = meta.starting_memory_pages as u64 * WASM_PAGE_SIZE;
        for (offset, data) in &meta.init_data.segments {
            self.memory.initialize(*offset, data, starting_bytes)?;
        }

        self.globals.clear();
        self.globals.extend_from_slice(&meta.init_data.globals);

        self.ctx.memory_base = self.memory.base();
        self.ctx.memory_size = starting_bytes;
        self.ctx.globals = self.globals.as_mut_ptr();
        Ok(())
    }
}
