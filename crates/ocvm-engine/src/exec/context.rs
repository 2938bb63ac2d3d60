//! Execution context shared with generated code
//!
//! Generated functions receive `vmctx`, a pointer to the `memory_base`
//! field of a `VmContext`. Everything the code touches is at a fixed offset
//! from it: the intrinsic table and the control block below, memory size
//! and the globals pointer above.
//!
//! ```text
//!            +----------------------+
//!            | intrinsics[0..N]     |  negative offsets
//!            | ControlBlock         |
//!  vmctx --> | memory_base          |  offset 0
//!            | memory_size          |
//!            | globals              |
//!            +----------------------+
//! ```

use std::ffi::c_void;
use std::mem::offset_of;
use std::ptr;
use std::sync::atomic::AtomicU32;

use crate::intrinsics::INTRINSIC_COUNT;

/// Trap slot value while execution proceeds normally
pub(crate) const SLOT_CLEAR: u32 = 0;
/// Trap slot value after the contract called `exit`
pub(crate) const SLOT_EXIT: u32 = 0x100;
/// Trap slot value after a host function failed; the error is in `HostState`
pub(crate) const SLOT_HOST_ERROR: u32 = 0x101;
/// Trap slot value after an intrinsic panicked
pub(crate) const SLOT_PANIC: u32 = 0x102;

/// Per-execution state read and written by generated code
#[repr(C)]
#[derive(Debug)]
pub struct ControlBlock {
    /// Calls still allowed before the call-depth trap
    pub depth_remaining: u32,
    /// Current linear-memory size in pages
    pub current_pages: u32,
    /// Pages `grow_memory` may reach
    pub max_pages: u32,
    /// Nonzero once execution must unwind
    pub trap: u32,
    /// Metering budget
    pub instructions_remaining: u64,
    /// Raised by the deadline watchdog
    pub deadline: *const AtomicU32,
    /// Start of the running code blob
    pub code_base: *const u8,
    /// Lowest native stack address generated code may reach
    pub stack_limit: usize,
    /// Type-erased `HostState` of the running call
    pub host: *mut c_void,
}

impl ControlBlock {
    fn empty() -> Self {
        ControlBlock {
            depth_remaining: 0,
            current_pages: 0,
            max_pages: 0,
            trap: SLOT_CLEAR,
            instructions_remaining: 0,
            deadline: ptr::null(),
            code_base: ptr::null(),
            stack_limit: 0,
            host: ptr::null_mut(),
        }
    }
}

/// The block `vmctx` points into
#[repr(C)]
#[derive(Debug)]
pub struct VmContext {
    /// Intrinsic function addresses by ordinal
    pub intrinsics: [usize; INTRINSIC_COUNT],
    /// Control block of the running call
    pub control: ControlBlock,
    /// Start of linear memory
    pub memory_base: *mut u8,
    /// Current linear-memory size in bytes
    pub memory_size: u64,
    /// Mutable global slots, 8 bytes each
    pub globals: *mut u64,
}

/// Offset of `memory_base` from the start of `VmContext`
pub(crate) const VMCTX_BIAS: usize = offset_of!(VmContext, memory_base);

const fn rel(offset: usize) -> i32 {
    offset as i32 - VMCTX_BIAS as i32
}

const CONTROL: usize = offset_of!(VmContext, control);

/// Field offsets relative to `vmctx`
pub(crate) mod offsets {
    use super::*;

    pub const INTRINSICS: i32 = rel(offset_of!(VmContext, intrinsics));
    pub const DEPTH_REMAINING: i32 = rel(CONTROL + offset_of!(ControlBlock, depth_remaining));
    pub const CURRENT_PAGES: i32 = rel(CONTROL + offset_of!(ControlBlock, current_pages));
    pub const TRAP: i32 = rel(CONTROL + offset_of!(ControlBlock, trap));
    pub const INSTRUCTIONS_REMAINING: i32 =
        rel(CONTROL + offset_of!(ControlBlock, instructions_remaining));
    pub const DEADLINE: i32 = rel(CONTROL + offset_of!(ControlBlock, deadline));
    pub const CODE_BASE: i32 = rel(CONTROL + offset_of!(ControlBlock, code_base));
    pub const STACK_LIMIT: i32 = rel(CONTROL + offset_of!(ControlBlock, stack_limit));
    pub const MEMORY_BASE: i32 = 0;
    pub const MEMORY_SIZE: i32 = rel(offset_of!(VmContext, memory_size));
    pub const GLOBALS: i32 = rel(offset_of!(VmContext, globals));
}

impl VmContext {
    pub(crate) fn new(intrinsics: [usize; INTRINSIC_COUNT]) -> Box<Self> {
        Box::new(VmContext {
            intrinsics,
            control: ControlBlock::empty(),
            memory_base: ptr::null_mut(),
            memory_size: 0,
            globals: ptr::null_mut(),
        })
    }

    /// The pointer handed to generated code
    pub(crate) fn vmctx(&mut self) -> *mut u8 {
        ptr::addr_of_mut!(self.memory_base) as *mut u8
    }

    /// Recover the context from a `vmctx` pointer
    ///
    /// # Safety
    ///
    /// `vmctx` must come from `VmContext::vmctx` on a context that outlives
    /// `'a` and is not otherwise borrowed.
    pub(crate) unsafe fn from_vmctx<'a>(vmctx: *mut u8) -> &'a mut VmContext {
        &mut *(vmctx.sub(VMCTX_BIAS) as *mut VmContext)
    }
}
