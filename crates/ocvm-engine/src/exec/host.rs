//! Intrinsic implementations
//!
//! These are the `unsafe extern "C"` functions generated code calls through
//! the intrinsic table. Each receives `vmctx` first. Failures never unwind
//! into generated code: they are written to the control block's trap slot
//! and the generated caller returns. Panics are caught at this boundary.

use std::any::Any;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use sha2::{Digest, Sha256};

use crate::intrinsics::{Intrinsic, INTRINSIC_COUNT};
use crate::wasm::WASM_PAGE_SIZE;

use super::apply::{ApplyContext, HostError};
use super::context::{VmContext, SLOT_EXIT, SLOT_HOST_ERROR, SLOT_PANIC};
use super::error::TrapCode;
use super::float::{self, Rounding};
use super::memory::MemoryRegion;

/// Host-side state of the running call, reached through `ControlBlock::host`
pub(crate) struct HostState<'a> {
    pub apply: &'a mut dyn ApplyContext,
    pub console: String,
    pub error: Option<HostError>,
    pub exit_code: Option<i32>,
    pub panic: Option<String>,
}

impl<'a> HostState<'a> {
    pub(crate) fn new(apply: &'a mut dyn ApplyContext) -> Self {
        HostState { apply, console: String::new(), error: None, exit_code: None, panic: None }
    }
}

/// Ways an intrinsic stops the contract
enum Fault {
    Trap(TrapCode),
    Host(HostError),
    Exit(i32),
}

impl From<TrapCode> for Fault {
    fn from(code: TrapCode) -> Self {
        Fault::Trap(code)
    }
}

impl From<HostError> for Fault {
    fn from(e: HostError) -> Self {
        Fault::Host(e)
    }
}

type HostResult<T> = Result<T, Fault>;

/// Run `f` with the context of `vmctx`, recording any fault in the trap slot
///
/// # Safety
///
/// `vmctx` must be the pointer the executor handed to generated code, with
/// `control.host` pointing at a live `HostState`.
unsafe fn with_host<R: Default>(
    vmctx: *mut u8,
    f: impl FnOnce(&mut VmContext, &mut HostState<'_>) -> HostResult<R>,
) -> R {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let ctx = VmContext::from_vmctx(vmctx);
        let host = &mut *(ctx.control.host as *mut HostState<'_>);
        f(ctx, host)
    }));

    let ctx = VmContext::from_vmctx(vmctx);
    let host = &mut *(ctx.control.host as *mut HostState<'_>);
    match outcome {
        Ok(Ok(value)) => return value,
        Ok(Err(Fault::Trap(code))) => ctx.control.trap = code.slot(),
        Ok(Err(Fault::Host(e))) => {
            host.error = Some(e);
            ctx.control.trap = SLOT_HOST_ERROR;
        }
        Ok(Err(Fault::Exit(code))) => {
            host.exit_code = Some(code);
            ctx.control.trap = SLOT_EXIT;
        }
        Err(payload) => {
            host.panic = Some(panic_message(payload.as_ref()));
            ctx.control.trap = SLOT_PANIC;
        }
    }
    R::default()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a context-only computation, recording a trap on failure
///
/// # Safety
///
/// `vmctx` must be the pointer the executor handed to generated code.
unsafe fn with_ctx<R: Default>(vmctx: *mut u8, f: impl FnOnce(&mut VmContext) -> Result<R, TrapCode>) -> R {
    let ctx = VmContext::from_vmctx(vmctx);
    match f(ctx) {
        Ok(value) => value,
        Err(code) => {
            ctx.control.trap = code.slot();
            R::default()
        }
    }
}

// =============================================================================
// Traps
// =============================================================================

unsafe fn set_trap(vmctx: *mut u8, code: TrapCode) {
    VmContext::from_vmctx(vmctx).control.trap = code.slot();
}

unsafe extern "C" fn trap_unreachable(vmctx: *mut u8) {
    set_trap(vmctx, TrapCode::Unreachable);
}

unsafe extern "C" fn trap_integer(vmctx: *mut u8) {
    set_trap(vmctx, TrapCode::Arithmetic);
}

unsafe extern "C" fn trap_indirect_mismatch(vmctx: *mut u8) {
    set_trap(vmctx, TrapCode::IndirectCallMismatch);
}

unsafe extern "C" fn trap_indirect_out_of_bounds(vmctx: *mut u8) {
    set_trap(vmctx, TrapCode::IndirectCallOutOfBounds);
}

unsafe extern "C" fn trap_call_depth(vmctx: *mut u8) {
    set_trap(vmctx, TrapCode::CallDepthExceeded);
}

unsafe extern "C" fn trap_memory_out_of_bounds(vmctx: *mut u8) {
    set_trap(vmctx, TrapCode::MemoryOutOfBounds);
}

// =============================================================================
// Metering and memory growth
// =============================================================================

/// Slow path of the inline metering sequence
unsafe extern "C" fn checktime(vmctx: *mut u8, cost: i32) {
    with_ctx(vmctx, |ctx| {
        let control = &mut ctx.control;
        if !control.deadline.is_null() && (*control.deadline).load(Ordering::Acquire) != 0 {
            return Err(TrapCode::DeadlineExceeded);
        }
        let cost = cost as u32 as u64;
        if cost > control.instructions_remaining {
            control.instructions_remaining = 0;
            return Err(TrapCode::Metering);
        }
        control.instructions_remaining -= cost;
        Ok(())
    })
}

/// `memory.grow`: previous page count, or -1 past the maximum
unsafe extern "C" fn grow_memory(vmctx: *mut u8, delta: i32) -> i32 {
    let ctx = VmContext::from_vmctx(vmctx);
    let control = &mut ctx.control;
    let previous = control.current_pages;
    let Some(pages) = previous.checked_add(delta as u32) else {
        return -1;
    };
    if pages > control.max_pages {
        return -1;
    }
    control.current_pages = pages;
    ctx.memory_size = pages as u64 * WASM_PAGE_SIZE;
    previous as i32
}

// =============================================================================
// Float helpers
// =============================================================================

unsafe extern "C" fn i32_trunc_f32_s(vmctx: *mut u8, v: f32) -> i32 {
    with_ctx(vmctx, |_| float::trunc_i32_s(v as f64))
}

unsafe extern "C" fn i32_trunc_f32_u(vmctx: *mut u8, v: f32) -> i32 {
    with_ctx(vmctx, |_| float::trunc_i32_u(v as f64))
}

unsafe extern "C" fn i32_trunc_f64_s(vmctx: *mut u8, v: f64) -> i32 {
    with_ctx(vmctx, |_| float::trunc_i32_s(v))
}

unsafe extern "C" fn i32_trunc_f64_u(vmctx: *mut u8, v: f64) -> i32 {
    with_ctx(vmctx, |_| float::trunc_i32_u(v))
}

unsafe extern "C" fn i64_trunc_f32_s(vmctx: *mut u8, v: f32) -> i64 {
    with_ctx(vmctx, |_| float::trunc_i64_s(v as f64))
}

unsafe extern "C" fn i64_trunc_f32_u(vmctx: *mut u8, v: f32) -> i64 {
    with_ctx(vmctx, |_| float::trunc_i64_u(v as f64))
}

unsafe extern "C" fn i64_trunc_f64_s(vmctx: *mut u8, v: f64) -> i64 {
    with_ctx(vmctx, |_| float::trunc_i64_s(v))
}

unsafe extern "C" fn i64_trunc_f64_u(vmctx: *mut u8, v: f64) -> i64 {
    with_ctx(vmctx, |_| float::trunc_i64_u(v))
}

extern "C" fn f32_ceil(_vmctx: *mut u8, v: f32) -> f32 {
    float::round_f32(v, Rounding::Ceil)
}

extern "C" fn f32_floor(_vmctx: *mut u8, v: f32) -> f32 {
    float::round_f32(v, Rounding::Floor)
}

extern "C" fn f32_trunc(_vmctx: *mut u8, v: f32) -> f32 {
    float::round_f32(v, Rounding::Trunc)
}

extern "C" fn f32_nearest(_vmctx: *mut u8, v: f32) -> f32 {
    float::round_f32(v, Rounding::Nearest)
}

extern "C" fn f64_ceil(_vmctx: *mut u8, v: f64) -> f64 {
    float::round_f64(v, Rounding::Ceil)
}

extern "C" fn f64_floor(_vmctx: *mut u8, v: f64) -> f64 {
    float::round_f64(v, Rounding::Floor)
}

extern "C" fn f64_trunc(_vmctx: *mut u8, v: f64) -> f64 {
    float::round_f64(v, Rounding::Trunc)
}

extern "C" fn f64_nearest(_vmctx: *mut u8, v: f64) -> f64 {
    float::round_f64(v, Rounding::Nearest)
}

// =============================================================================
// Action and authorization
// =============================================================================

unsafe extern "C" fn action_data_size(vmctx: *mut u8) -> i32 {
    with_host(vmctx, |_, host| Ok(host.apply.action_data().len() as i32))
}

/// Copy up to `len` bytes of action data; `len == 0` queries the size
unsafe extern "C" fn read_action_data(vmctx: *mut u8, ptr: i32, len: i32) -> i32 {
    with_host(vmctx, |ctx, host| {
        let data = host.apply.action_data();
        if len == 0 {
            return Ok(data.len() as i32);
        }
        let copied = data.len().min(len as u32 as usize);
        MemoryRegion::of(ctx).write(ptr as u32, &data[..copied])?;
        Ok(copied as i32)
    })
}

unsafe extern "C" fn current_receiver(vmctx: *mut u8) -> i64 {
    with_host(vmctx, |_, host| Ok(host.apply.receiver() as i64))
}

unsafe extern "C" fn require_auth(vmctx: *mut u8, account: i64) {
    with_host(vmctx, |_, host| Ok(host.apply.require_authorization(account as u64)?))
}

unsafe extern "C" fn has_auth(vmctx: *mut u8, account: i64) -> i32 {
    with_host(vmctx, |_, host| Ok(host.apply.has_authorization(account as u64) as i32))
}

unsafe extern "C" fn is_account(vmctx: *mut u8, account: i64) -> i32 {
    with_host(vmctx, |_, host| Ok(host.apply.is_account(account as u64) as i32))
}

unsafe extern "C" fn current_time(vmctx: *mut u8) -> i64 {
    with_host(vmctx, |_, host| Ok(host.apply.current_time_us() as i64))
}

// =============================================================================
// Table store
// =============================================================================

unsafe extern "C" fn db_store_i64(
    vmctx: *mut u8,
    scope: i64,
    table: i64,
    payer: i64,
    id: i64,
    ptr: i32,
    len: i32,
) -> i32 {
    with_host(vmctx, |ctx, host| {
        let region = MemoryRegion::of(ctx);
        let value = region.read(ptr as u32, len as u32)?;
        Ok(host
            .apply
            .db_store_i64(scope as u64, table as u64, payer as u64, id as u64, value)?)
    })
}

unsafe extern "C" fn db_find_i64(vmctx: *mut u8, code: i64, scope: i64, table: i64, id: i64) -> i32 {
    with_host(vmctx, |_, host| {
        Ok(host
            .apply
            .db_find_i64(code as u64, scope as u64, table as u64, id as u64)?)
    })
}

/// Copy up to `len` bytes of a row; `len == 0` queries the row size
unsafe extern "C" fn db_get_i64(vmctx: *mut u8, iterator: i32, ptr: i32, len: i32) -> i32 {
    with_host(vmctx, |ctx, host| {
        let value = host.apply.db_get_i64(iterator)?;
        if len == 0 {
            return Ok(value.len() as i32);
        }
        let copied = value.len().min(len as u32 as usize);
        MemoryRegion::of(ctx).write(ptr as u32, &value[..copied])?;
        Ok(copied as i32)
    })
}

unsafe extern "C" fn db_update_i64(vmctx: *mut u8, iterator: i32, payer: i64, ptr: i32, len: i32) {
    with_host(vmctx, |ctx, host| {
        let region = MemoryRegion::of(ctx);
        let value = region.read(ptr as u32, len as u32)?;
        Ok(host.apply.db_update_i64(iterator, payer as u64, value)?)
    })
}

unsafe extern "C" fn db_remove_i64(vmctx: *mut u8, iterator: i32) {
    with_host(vmctx, |_, host| Ok(host.apply.db_remove_i64(iterator)?))
}

// =============================================================================
// Hashing
// =============================================================================

unsafe extern "C" fn sha256(vmctx: *mut u8, ptr: i32, len: i32, hash: i32) {
    with_host(vmctx, |ctx, _| {
        let mut region = MemoryRegion::of(ctx);
        let digest = Sha256::digest(region.read(ptr as u32, len as u32)?);
        region.write(hash as u32, &digest)?;
        Ok(())
    })
}

unsafe extern "C" fn assert_sha256(vmctx: *mut u8, ptr: i32, len: i32, hash: i32) {
    with_host(vmctx, |ctx, _| {
        let region = MemoryRegion::of(ctx);
        let digest = Sha256::digest(region.read(ptr as u32, len as u32)?);
        if region.read(hash as u32, 32)? != digest.as_slice() {
            return Err(HostError::AssertionFailure { message: "hash mismatch".to_string() }.into());
        }
        Ok(())
    })
}

// =============================================================================
// Console
// =============================================================================

unsafe extern "C" fn prints(vmctx: *mut u8, ptr: i32) {
    with_host(vmctx, |ctx, host| {
        let region = MemoryRegion::of(ctx);
        let text = region.read_cstr(ptr as u32)?;
        host.console.push_str(&String::from_utf8_lossy(text));
        Ok(())
    })
}

unsafe extern "C" fn prints_l(vmctx: *mut u8, ptr: i32, len: i32) {
    with_host(vmctx, |ctx, host| {
        let region = MemoryRegion::of(ctx);
        let text = region.read(ptr as u32, len as u32)?;
        host.console.push_str(&String::from_utf8_lossy(text));
        Ok(())
    })
}

unsafe extern "C" fn printi(vmctx: *mut u8, value: i64) {
    with_host(vmctx, |_, host| {
        let _ = write!(host.console, "{}", value);
        Ok(())
    })
}

unsafe extern "C" fn printui(vmctx: *mut u8, value: i64) {
    with_host(vmctx, |_, host| {
        let _ = write!(host.console, "{}", value as u64);
        Ok(())
    })
}

unsafe extern "C" fn printhex(vmctx: *mut u8, ptr: i32, len: i32) {
    with_host(vmctx, |ctx, host| {
        let region = MemoryRegion::of(ctx);
        let bytes = region.read(ptr as u32, len as u32)?;
        host.console.push_str(&hex::encode(bytes));
        Ok(())
    })
}

// =============================================================================
// Assertions and termination
// =============================================================================

unsafe extern "C" fn check(vmctx: *mut u8, test: i32, msg: i32) {
    with_host(vmctx, |ctx, _| {
        if test != 0 {
            return Ok(());
        }
        let region = MemoryRegion::of(ctx);
        let message = region.read_cstr(msg as u32)?;
        Err(HostError::AssertionFailure { message: String::from_utf8_lossy(message).into_owned() }.into())
    })
}

unsafe extern "C" fn check_message(vmctx: *mut u8, test: i32, msg: i32, len: i32) {
    with_host(vmctx, |ctx, _| {
        if test != 0 {
            return Ok(());
        }
        let region = MemoryRegion::of(ctx);
        let message = region.read(msg as u32, len as u32)?;
        Err(HostError::AssertionFailure { message: String::from_utf8_lossy(message).into_owned() }.into())
    })
}

unsafe extern "C" fn abort(vmctx: *mut u8) {
    with_host(vmctx, |_, _| -> HostResult<()> { Err(HostError::Abort.into()) })
}

unsafe extern "C" fn exit(vmctx: *mut u8, code: i32) {
    with_host(vmctx, |_, _| -> HostResult<()> { Err(Fault::Exit(code)) })
}

// =============================================================================
// Memory operations
// =============================================================================

unsafe extern "C" fn memcpy(vmctx: *mut u8, dest: i32, src: i32, len: i32) -> i32 {
    with_host(vmctx, |ctx, _| {
        let (d, s, n) = (dest as u32 as u64, src as u32 as u64, len as u32 as u64);
        if d < s + n && s < d + n && n > 0 {
            return Err(HostError::Other("memcpy with overlapping memory".to_string()).into());
        }
        MemoryRegion::of(ctx).copy_within(dest as u32, src as u32, len as u32)?;
        Ok(dest)
    })
}

unsafe extern "C" fn memmove(vmctx: *mut u8, dest: i32, src: i32, len: i32) -> i32 {
    with_host(vmctx, |ctx, _| {
        MemoryRegion::of(ctx).copy_within(dest as u32, src as u32, len as u32)?;
        Ok(dest)
    })
}

unsafe extern "C" fn memset(vmctx: *mut u8, dest: i32, value: i32, len: i32) -> i32 {
    with_host(vmctx, |ctx, _| {
        MemoryRegion::of(ctx).slice_mut(dest as u32, len as u32)?.fill(value as u8);
        Ok(dest)
    })
}

unsafe extern "C" fn memcmp(vmctx: *mut u8, a: i32, b: i32, len: i32) -> i32 {
    with_host(vmctx, |ctx, _| {
        let region = MemoryRegion::of(ctx);
        let ordering = region.read(a as u32, len as u32)?.cmp(region.read(b as u32, len as u32)?);
        Ok(ordering as i32)
    })
}

// =============================================================================
// Table construction
// =============================================================================

fn address(intrinsic: Intrinsic) -> usize {
    use Intrinsic::*;
    match intrinsic {
        TrapUnreachable => trap_unreachable as *const () as usize,
        TrapInteger => trap_integer as *const () as usize,
        TrapIndirectMismatch => trap_indirect_mismatch as *const () as usize,
        TrapIndirectOutOfBounds => trap_indirect_out_of_bounds as *const () as usize,
        TrapCallDepth => trap_call_depth as *const () as usize,
        TrapMemoryOutOfBounds => trap_memory_out_of_bounds as *const () as usize,
        Checktime => checktime as *const () as usize,
        GrowMemory => grow_memory as *const () as usize,
        I32TruncF32S => i32_trunc_f32_s as *const () as usize,
        I32TruncF32U => i32_trunc_f32_u as *const () as usize,
        I32TruncF64S => i32_trunc_f64_s as *const () as usize,
        I32TruncF64U => i32_trunc_f64_u as *const () as usize,
        I64TruncF32S => i64_trunc_f32_s as *const () as usize,
        I64TruncF32U => i64_trunc_f32_u as *const () as usize,
        I64TruncF64S => i64_trunc_f64_s as *const () as usize,
        I64TruncF64U => i64_trunc_f64_u as *const () as usize,
        F32Ceil => f32_ceil as *const () as usize,
        F32Floor => f32_floor as *const () as usize,
        F32Trunc => f32_trunc as *const () as usize,
        F32Nearest => f32_nearest as *const () as usize,
        F64Ceil => f64_ceil as *const () as usize,
        F64Floor => f64_floor as *const () as usize,
        F64Trunc => f64_trunc as *const () as usize,
        F64Nearest => f64_nearest as *const () as usize,
        ActionDataSize => action_data_size as *const () as usize,
        ReadActionData => read_action_data as *const () as usize,
        CurrentReceiver => current_receiver as *const () as usize,
        RequireAuth => require_auth as *const () as usize,
        HasAuth => has_auth as *const () as usize,
        IsAccount => is_account as *const () as usize,
        CurrentTime => current_time as *const () as usize,
        DbStoreI64 => db_store_i64 as *const () as usize,
        DbFindI64 => db_find_i64 as *const () as usize,
        DbGetI64 => db_get_i64 as *const () as usize,
        DbUpdateI64 => db_update_i64 as *const () as usize,
        DbRemoveI64 => db_remove_i64 as *const () as usize,
        Sha256 => sha256 as *const () as usize,
        AssertSha256 => assert_sha256 as *const () as usize,
        Prints => prints as *const () as usize,
        PrintsL => prints_l as *const () as usize,
        Printi => printi as *const () as usize,
        Printui => printui as *const () as usize,
        Printhex => printhex as *const () as usize,
        Check => check as *const () as usize,
        CheckMessage => check_message as *const () as usize,
        Abort => abort as *const () as usize,
        Exit => exit as *const () as usize,
        Memcpy => memcpy as *const () as usize,
        Memmove => memmove as *const () as usize,
        Memset => memset as *const () as usize,
        Memcmp => memcmp as *const () as usize,
    }
}

/// Function addresses by ordinal, as stored in `VmContext::intrinsics`
pub(crate) fn table() -> [usize; INTRINSIC_COUNT] {
    Intrinsic::ALL.map(address)
}
