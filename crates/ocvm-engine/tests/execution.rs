//! Compile-and-run tests of the executor
//!
//! These jump into generated machine code, so they only build on the
//! targets the compiler supports.

#![cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]

mod common;

use std::time::Duration;

use common::{context, mem, run, run_on, BlockType, ContractBuilder, ACTION, I, RECEIVER, V};
use ocvm_engine::{
    compile_bytecode, ApplyContext, ContentHash, ExecutableBuffer, ExecutionError,
    ExecutionLimits, Executor, HostError, InMemoryContext, TrapCode, WasmLimits,
};

fn limits() -> ExecutionLimits {
    ExecutionLimits::default()
}

fn trap_of(result: Result<ocvm_engine::ExecutionReport, ExecutionError>) -> TrapCode {
    match result {
        Err(ExecutionError::Trap(code)) => code,
        other => panic!("expected a trap, got {:?}", other),
    }
}

// =============================================================================
// Host functions
// =============================================================================

#[test]
fn test_store_row_and_print() {
    let mut builder = ContractBuilder::new();
    let prints_l = builder.import("prints_l", &[V::I32, V::I32], &[]);
    let store = builder.import(
        "db_store_i64",
        &[V::I64, V::I64, V::I64, V::I64, V::I32, V::I32],
        &[V::I32],
    );
    builder.apply(
        &[],
        vec![
            I::LocalGet(0),
            I::LocalGet(2),
            I::LocalGet(0),
            I::I64Const(1),
            I::I32Const(0),
            I::I32Const(5),
            I::Call(store),
            I::Drop,
            I::I32Const(0),
            I::I32Const(5),
            I::Call(prints_l),
            I::End,
        ],
    );
    builder.memory(1, None).data(0, b"hello");

    let mut ctx = context(&[]);
    let report = run(&builder.build(), &mut ctx, &limits()).unwrap();
    assert_eq!(report.console, "hello");
    assert_eq!(report.exit_code, None);
    assert!(report.instructions_used > 0);
    assert_eq!(ctx.row(RECEIVER, RECEIVER, ACTION, 1), Some(&b"hello"[..]));
}

#[test]
fn test_read_action_data() {
    let mut builder = ContractBuilder::new();
    let read = builder.import("read_action_data", &[V::I32, V::I32], &[V::I32]);
    let printhex = builder.import("printhex", &[V::I32, V::I32], &[]);
    let printi = builder.import("printi", &[V::I64], &[]);
    builder.apply(
        &[(1, V::I32)],
        vec![
            I::I32Const(100),
            I::I32Const(0),
            I::Call(read),
            I::LocalSet(3),
            I::I32Const(100),
            I::LocalGet(3),
            I::Call(read),
            I::Drop,
            I::I32Const(100),
            I::LocalGet(3),
            I::Call(printhex),
            I::LocalGet(3),
            I::I64ExtendI32U,
            I::Call(printi),
            I::End,
        ],
    );
    builder.memory(1, None);

    let mut ctx = context(&[0x01, 0xab, 0xff]);
    let report = run(&builder.build(), &mut ctx, &limits()).unwrap();
    assert_eq!(report.console, "01abff3");
}

#[test]
fn test_find_and_get_existing_row() {
    let mut builder = ContractBuilder::new();
    let find = builder.import("db_find_i64", &[V::I64, V::I64, V::I64, V::I64], &[V::I32]);
    let get = builder.import("db_get_i64", &[V::I32, V::I32, V::I32], &[V::I32]);
    let prints_l = builder.import("prints_l", &[V::I32, V::I32], &[]);
    let printi = builder.import("printi", &[V::I64], &[]);
    builder.apply(
        &[(1, V::I32)],
        vec![
            I::LocalGet(0),
            I::I64Const(1),
            I::I64Const(2),
            I::I64Const(3),
            I::Call(find),
            I::LocalSet(3),
            // size query
            I::LocalGet(3),
            I::I32Const(0),
            I::I32Const(0),
            I::Call(get),
            I::I64ExtendI32U,
            I::Call(printi),
            // copy into memory
            I::LocalGet(3),
            I::I32Const(50),
            I::I32Const(100),
            I::Call(get),
            I::Drop,
            I::I32Const(50),
            I::I32Const(6),
            I::Call(prints_l),
            // a missing row
            I::LocalGet(0),
            I::I64Const(1),
            I::I64Const(2),
            I::I64Const(4),
            I::Call(find),
            I::I64ExtendI32S,
            I::Call(printi),
            I::End,
        ],
    );
    builder.memory(1, None);

    let mut ctx = context(&[]);
    ctx.rows.insert((RECEIVER, 1, 2, 3), (RECEIVER, b"stored".to_vec()));
    let report = run(&builder.build(), &mut ctx, &limits()).unwrap();
    assert_eq!(report.console, "6stored-1");
}

#[test]
fn test_sha256_intrinsics() {
    let mut builder = ContractBuilder::new();
    let sha256 = builder.import("sha256", &[V::I32, V::I32, V::I32], &[]);
    let assert_sha256 = builder.import("assert_sha256", &[V::I32, V::I32, V::I32], &[]);
    let printhex = builder.import("printhex", &[V::I32, V::I32], &[]);
    builder.apply(
        &[],
        vec![
            I::I32Const(0),
            I::I32Const(3),
            I::I32Const(32),
            I::Call(sha256),
            I::I32Const(32),
            I::I32Const(32),
            I::Call(printhex),
            I::I32Const(0),
            I::I32Const(3),
            I::I32Const(32),
            I::Call(assert_sha256),
            // the digest of "ab" is not the digest of "abc"
            I::I32Const(0),
            I::I32Const(2),
            I::I32Const(32),
            I::Call(assert_sha256),
            I::End,
        ],
    );
    builder.memory(1, None).data(0, b"abc");

    let result = run(&builder.build(), &mut context(&[]), &limits());
    assert!(matches!(
        result,
        Err(ExecutionError::Host(HostError::AssertionFailure { .. }))
    ));
}

#[test]
fn test_sha256_digest_written_to_memory() {
    let mut builder = ContractBuilder::new();
    let sha256 = builder.import("sha256", &[V::I32, V::I32, V::I32], &[]);
    let printhex = builder.import("printhex", &[V::I32, V::I32], &[]);
    builder.apply(
        &[],
        vec![
            I::I32Const(0),
            I::I32Const(3),
            I::I32Const(32),
            I::Call(sha256),
            I::I32Const(32),
            I::I32Const(32),
            I::Call(printhex),
            I::End,
        ],
    );
    builder.memory(1, None).data(0, b"abc");

    let report = run(&builder.build(), &mut context(&[]), &limits()).unwrap();
    assert_eq!(
        report.console,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn test_check_failure_is_host_error() {
    let mut builder = ContractBuilder::new();
    let check = builder.import("check", &[V::I32, V::I32], &[]);
    builder.apply(
        &[],
        vec![
            I::I32Const(1),
            I::I32Const(0),
            I::Call(check),
            I::I32Const(0),
            I::I32Const(0),
            I::Call(check),
            I::End,
        ],
    );
    builder.memory(1, None).data(0, b"nope\0");

    let result = run(&builder.build(), &mut context(&[]), &limits());
    assert_eq!(
        result,
        Err(ExecutionError::Host(HostError::AssertionFailure { message: "nope".to_string() }))
    );
}

#[test]
fn test_require_auth() {
    let mut builder = ContractBuilder::new();
    let require_auth = builder.import("require_auth", &[V::I64], &[]);
    builder.apply(&[], vec![I::I64Const(42), I::Call(require_auth), I::End]);
    let bytes = builder.build();

    let result = run(&bytes, &mut context(&[]), &limits());
    assert_eq!(
        result,
        Err(ExecutionError::Host(HostError::MissingAuthorization { account: 42 }))
    );

    let mut ctx = context(&[]);
    ctx.authorizations.insert(42);
    assert!(run(&bytes, &mut ctx, &limits()).is_ok());
}

#[test]
fn test_exit_unwinds_nested_calls() {
    let mut builder = ContractBuilder::new();
    let exit = builder.import("exit", &[V::I32], &[]);
    let printi = builder.import("printi", &[V::I64], &[]);
    let helper = builder.function(&[], &[], &[], vec![I::I32Const(3), I::Call(exit), I::Unreachable, I::End]);
    builder.apply(
        &[],
        vec![I::Call(helper), I::I64Const(9), I::Call(printi), I::End],
    );

    let report = run(&builder.build(), &mut context(&[]), &limits()).unwrap();
    assert_eq!(report.exit_code, Some(3));
    assert_eq!(report.console, "");
}

struct PanickingContext(InMemoryContext);

impl ApplyContext for PanickingContext {
    fn receiver(&self) -> u64 {
        self.0.receiver()
    }
    fn account(&self) -> u64 {
        self.0.account()
    }
    fn action(&self) -> u64 {
        self.0.action()
    }
    fn action_data(&self) -> &[u8] {
        self.0.action_data()
    }
    fn require_authorization(&mut self, account: u64) -> Result<(), HostError> {
        self.0.require_authorization(account)
    }
    fn has_authorization(&self, account: u64) -> bool {
        self.0.has_authorization(account)
    }
    fn is_account(&self, account: u64) -> bool {
        self.0.is_account(account)
    }
    fn current_time_us(&self) -> u64 {
        panic!("clock unavailable")
    }
    fn db_store_i64(&mut self, scope: u64, table: u64, payer: u64, id: u64, value: &[u8]) -> Result<i32, HostError> {
        self.0.db_store_i64(scope, table, payer, id, value)
    }
    fn db_find_i64(&mut self, code: u64, scope: u64, table: u64, id: u64) -> Result<i32, HostError> {
        self.0.db_find_i64(code, scope, table, id)
    }
    fn db_get_i64(&self, iterator: i32) -> Result<&[u8], HostError> {
        self.0.db_get_i64(iterator)
    }
    fn db_update_i64(&mut self, iterator: i32, payer: u64, value: &[u8]) -> Result<(), HostError> {
        self.0.db_update_i64(iterator, payer, value)
    }
    fn db_remove_i64(&mut self, iterator: i32) -> Result<(), HostError> {
        self.0.db_remove_i64(iterator)
    }
}

#[test]
fn test_host_panic_is_contained() {
    let mut builder = ContractBuilder::new();
    let current_time = builder.import("current_time", &[], &[V::I64]);
    builder.apply(&[], vec![I::Call(current_time), I::Drop, I::End]);

    let mut ctx = PanickingContext(context(&[]));
    let result = run(&builder.build(), &mut ctx, &limits());
    assert_eq!(result, Err(ExecutionError::Panic("clock unavailable".to_string())));
}

// =============================================================================
// Traps
// =============================================================================

#[test]
fn test_metering_threshold() {
    let mut body = vec![I::Nop; 20];
    body.push(I::End);
    let mut builder = ContractBuilder::new();
    builder.apply(&[], body);
    let bytes = builder.build();

    // 20 nops plus the final end form one basic block of 21 instructions
    let exact = ExecutionLimits { instruction_budget: 21, ..limits() };
    let report = run(&bytes, &mut context(&[]), &exact).unwrap();
    assert_eq!(report.instructions_used, 21);

    let short = ExecutionLimits { instruction_budget: 20, ..limits() };
    assert_eq!(trap_of(run(&bytes, &mut context(&[]), &short)), TrapCode::Metering);
}

#[test]
fn test_loop_metering_exhausts_budget() {
    let mut builder = ContractBuilder::new();
    builder.apply(&[], vec![I::Loop(BlockType::Empty), I::Br(0), I::End, I::End]);
    let budget = ExecutionLimits { instruction_budget: 10_000, ..limits() };
    assert_eq!(trap_of(run(&builder.build(), &mut context(&[]), &budget)), TrapCode::Metering);
}

/// `apply` calls `recurse(depth)`, which calls itself until its argument is 0
fn recursion(depth: i32) -> Vec<u8> {
    let mut builder = ContractBuilder::new();
    let recurse = builder.function(
        &[V::I32],
        &[],
        &[],
        vec![
            I::LocalGet(0),
            I::I32Eqz,
            I::If(BlockType::Empty),
            I::Return,
            I::End,
            I::LocalGet(0),
            I::I32Const(1),
            I::I32Sub,
            I::Call(0),
            I::End,
        ],
    );
    builder.apply(&[], vec![I::I32Const(depth), I::Call(recurse), I::End]);
    builder.build()
}

#[test]
fn test_call_depth_limit() {
    let depth = ExecutionLimits { call_depth: 10, ..limits() };
    // apply plus recurse(8)..recurse(0) is exactly 10 frames
    assert!(run(&recursion(8), &mut context(&[]), &depth).is_ok());
    assert_eq!(
        trap_of(run(&recursion(9), &mut context(&[]), &depth)),
        TrapCode::CallDepthExceeded
    );
}

#[test]
fn test_default_call_depth() {
    assert!(run(&recursion(200), &mut context(&[]), &limits()).is_ok());
    assert_eq!(
        trap_of(run(&recursion(1000), &mut context(&[]), &limits())),
        TrapCode::CallDepthExceeded
    );
}

#[test]
fn test_native_stack_guard() {
    let mut builder = ContractBuilder::new();
    let forever = builder.function(&[], &[], &[], vec![I::Call(0), I::End]);
    builder.apply(&[], vec![I::Call(forever), I::End]);

    let deep = ExecutionLimits {
        call_depth: u32::MAX,
        native_stack_bytes: 256 * 1024,
        ..limits()
    };
    assert_eq!(
        trap_of(run(&builder.build(), &mut context(&[]), &deep)),
        TrapCode::CallDepthExceeded
    );
}

/// Table holds `() -> i32`, `(i32) -> i32` and `(i64, i64) -> ()`
fn indirect_call(params: &[V], results: &[V], slot: i32) -> Vec<u8> {
    let mut builder = ContractBuilder::new();
    let f0 = builder.function(&[], &[V::I32], &[], vec![I::I32Const(7), I::End]);
    let f1 = builder.function(&[V::I32], &[V::I32], &[], vec![I::LocalGet(0), I::End]);
    let f2 = builder.function(&[V::I64, V::I64], &[], &[], vec![I::End]);
    let type_index = builder.ty(params, results);

    let mut body = Vec::new();
    for param in params {
        body.push(match param {
            V::I64 => I::I64Const(1),
            _ => I::I32Const(1),
        });
    }
    body.push(I::I32Const(slot));
    body.push(I::CallIndirect { type_index, table_index: 0 });
    body.extend(results.iter().map(|_| I::Drop));
    body.push(I::End);
    builder.apply(&[], body);
    builder.table(3).elements(0, &[f0, f1, f2]);
    builder.build()
}

#[test]
fn test_indirect_call_type_checks() {
    let cases: [(&[V], &[V]); 3] = [(&[], &[V::I32]), (&[V::I32], &[V::I32]), (&[V::I64, V::I64], &[])];
    for (slot, (params, results)) in cases.iter().enumerate() {
        for target in 0..3 {
            let result = run(&indirect_call(params, results, target), &mut context(&[]), &limits());
            if target as usize == slot {
                assert!(result.is_ok(), "slot {} called as its own type: {:?}", slot, result);
            } else {
                assert_eq!(trap_of(result), TrapCode::IndirectCallMismatch);
            }
        }
    }
}

#[test]
fn test_indirect_call_out_of_bounds() {
    let result = run(&indirect_call(&[], &[V::I32], 3), &mut context(&[]), &limits());
    assert_eq!(trap_of(result), TrapCode::IndirectCallOutOfBounds);
    let result = run(&indirect_call(&[], &[V::I32], -1), &mut context(&[]), &limits());
    assert_eq!(trap_of(result), TrapCode::IndirectCallOutOfBounds);
}

#[test]
fn test_null_table_slot_mismatches() {
    let mut builder = ContractBuilder::new();
    let f0 = builder.function(&[], &[], &[], vec![I::End]);
    let ty = builder.ty(&[], &[]);
    builder.apply(
        &[],
        vec![I::I32Const(1), I::CallIndirect { type_index: ty, table_index: 0 }, I::End],
    );
    builder.table(2).elements(0, &[f0]);
    let result = run(&builder.build(), &mut context(&[]), &limits());
    assert_eq!(trap_of(result), TrapCode::IndirectCallMismatch);
}

fn single(body: Vec<I<'static>>) -> Vec<u8> {
    let mut builder = ContractBuilder::new();
    let printi = builder.import("printi", &[V::I64], &[]);
    let mut full = body;
    if !matches!(full.last(), Some(I::End)) {
        full.push(I::Call(printi));
        full.push(I::End);
    }
    builder.apply(&[], full);
    builder.memory(1, None);
    builder.build()
}

#[test]
fn test_integer_traps() {
    let div_zero = single(vec![I::I32Const(1), I::I32Const(0), I::I32DivU, I::Drop, I::End]);
    assert_eq!(trap_of(run(&div_zero, &mut context(&[]), &limits())), TrapCode::Arithmetic);

    let rem_zero = single(vec![I::I64Const(1), I::I64Const(0), I::I64RemS, I::Drop, I::End]);
    assert_eq!(trap_of(run(&rem_zero, &mut context(&[]), &limits())), TrapCode::Arithmetic);

    let overflow = single(vec![I::I32Const(i32::MIN), I::I32Const(-1), I::I32DivS, I::Drop, I::End]);
    assert_eq!(trap_of(run(&overflow, &mut context(&[]), &limits())), TrapCode::Arithmetic);

    let overflow = single(vec![I::I64Const(i64::MIN), I::I64Const(-1), I::I64DivS, I::Drop, I::End]);
    assert_eq!(trap_of(run(&overflow, &mut context(&[]), &limits())), TrapCode::Arithmetic);
}

#[test]
fn test_rem_s_of_min_by_minus_one_is_zero() {
    let bytes = single(vec![I::I64Const(i64::MIN), I::I64Const(-1), I::I64RemS]);
    let report = run(&bytes, &mut context(&[]), &limits()).unwrap();
    assert_eq!(report.console, "0");
}

#[test]
fn test_float_conversions() {
    let nan = single(vec![I::F64Const(f64::NAN), I::I32TruncF64S, I::Drop, I::End]);
    assert_eq!(trap_of(run(&nan, &mut context(&[]), &limits())), TrapCode::InvalidConversion);

    let big = single(vec![I::F32Const(3.0e10), I::I32TruncF32U, I::Drop, I::End]);
    assert_eq!(trap_of(run(&big, &mut context(&[]), &limits())), TrapCode::InvalidConversion);

    let truncated = single(vec![I::F64Const(-3.9), I::I64TruncF64S]);
    assert_eq!(run(&truncated, &mut context(&[]), &limits()).unwrap().console, "-3");

    let nearest = single(vec![I::F64Const(2.5), I::F64Nearest, I::I64TruncF64S]);
    assert_eq!(run(&nearest, &mut context(&[]), &limits()).unwrap().console, "2");

    let floor = single(vec![I::F32Const(-0.5), I::F32Floor, I::I64TruncF32S]);
    assert_eq!(run(&floor, &mut context(&[]), &limits()).unwrap().console, "-1");
}

#[test]
fn test_unreachable() {
    let bytes = single(vec![I::Unreachable, I::End]);
    assert_eq!(trap_of(run(&bytes, &mut context(&[]), &limits())), TrapCode::Unreachable);
}

#[test]
fn test_memory_bounds() {
    let last_word = single(vec![I::I32Const(65532), I::I32Load(mem(0)), I::I64ExtendI32U]);
    assert_eq!(run(&last_word, &mut context(&[]), &limits()).unwrap().console, "0");

    let straddling = single(vec![I::I32Const(65533), I::I32Load(mem(0)), I::Drop, I::End]);
    assert_eq!(trap_of(run(&straddling, &mut context(&[]), &limits())), TrapCode::MemoryOutOfBounds);

    let by_offset = single(vec![I::I32Const(0), I::I32Load8U(mem(65536)), I::Drop, I::End]);
    assert_eq!(trap_of(run(&by_offset, &mut context(&[]), &limits())), TrapCode::MemoryOutOfBounds);

    let store = single(vec![I::I32Const(-1), I::I64Const(5), I::I64Store(mem(0)), I::End]);
    assert_eq!(trap_of(run(&store, &mut context(&[]), &limits())), TrapCode::MemoryOutOfBounds);
}

#[test]
fn test_host_function_bounds() {
    let mut builder = ContractBuilder::new();
    let prints = builder.import("prints", &[V::I32], &[]);
    // no terminator anywhere in memory
    builder.apply(&[], vec![I::I32Const(65535), I::Call(prints), I::End]);
    builder.memory(1, None).data(65535, b"x");
    let result = run(&builder.build(), &mut context(&[]), &limits());
    assert_eq!(trap_of(result), TrapCode::MemoryOutOfBounds);
}

#[test]
fn test_deadline() {
    let mut builder = ContractBuilder::new();
    builder.apply(&[], vec![I::Loop(BlockType::Empty), I::Br(0), I::End, I::End]);
    let timed = ExecutionLimits {
        instruction_budget: u64::MAX / 2,
        deadline: Some(Duration::from_millis(50)),
        ..limits()
    };
    assert_eq!(
        trap_of(run(&builder.build(), &mut context(&[]), &timed)),
        TrapCode::DeadlineExceeded
    );
}

// =============================================================================
// Memory growth and executor state
// =============================================================================

#[test]
fn test_grow_memory_past_maximum() {
    let mut builder = ContractBuilder::new();
    let printi = builder.import("printi", &[V::I64], &[]);
    builder.apply(
        &[],
        vec![
            I::I32Const(1),
            I::MemoryGrow(0),
            I::I64ExtendI32S,
            I::Call(printi),
            I::I32Const(1),
            I::MemoryGrow(0),
            I::I64ExtendI32S,
            I::Call(printi),
            I::MemorySize(0),
            I::I64ExtendI32U,
            I::Call(printi),
            // fresh page reads as zero
            I::I32Const(65536 + 8),
            I::I32Load(mem(0)),
            I::I64ExtendI32U,
            I::Call(printi),
            I::End,
        ],
    );
    builder.memory(1, Some(2));

    let report = run(&builder.build(), &mut context(&[]), &limits()).unwrap();
    assert_eq!(report.console, "1-120");
    assert_eq!(report.memory_pages, 2);
}

#[test]
fn test_executor_resets_state_between_calls() {
    let mut builder = ContractBuilder::new();
    let printi = builder.import("printi", &[V::I64], &[]);
    builder.global_i32(true, 5);
    builder.apply(
        &[],
        vec![
            I::I32Const(100),
            I::I32Load(mem(0)),
            I::I64ExtendI32U,
            I::Call(printi),
            I::I32Const(100),
            I::I32Const(77),
            I::I32Store(mem(0)),
            I::GlobalGet(0),
            I::I64ExtendI32U,
            I::Call(printi),
            I::GlobalGet(0),
            I::I32Const(1),
            I::I32Add,
            I::GlobalSet(0),
            I::I32Const(1),
            I::MemoryGrow(0),
            I::Drop,
            I::I32Const(70000),
            I::I32Const(9),
            I::I32Store(mem(0)),
            I::End,
        ],
    );
    builder.memory(1, None);
    let bytes = builder.build();

    let mut executor = Executor::new(&WasmLimits::default()).unwrap();
    for _ in 0..3 {
        let report = run_on(&mut executor, &bytes, &mut context(&[]), &limits()).unwrap();
        assert_eq!(report.console, "05");
        assert_eq!(report.memory_pages, 2);
    }
    assert_eq!(executor.memory().read(100, 4).unwrap(), &77u32.to_le_bytes());
}

#[test]
fn test_start_function_runs_first() {
    let mut builder = ContractBuilder::new();
    let printi = builder.import("printi", &[V::I64], &[]);
    let global = builder.global_i64(true, 0);
    let init = builder.function(&[], &[], &[], vec![I::I64Const(42), I::GlobalSet(global), I::End]);
    builder.apply(&[], vec![I::GlobalGet(global), I::Call(printi), I::End]);
    builder.start(init);

    let report = run(&builder.build(), &mut context(&[]), &limits()).unwrap();
    assert_eq!(report.console, "42");
}

#[test]
fn test_immutable_global_is_folded() {
    let bytes = {
        let mut builder = ContractBuilder::new();
        let printi = builder.import("printi", &[V::I64], &[]);
        let global = builder.global_i64(false, -7);
        builder.apply(&[], vec![I::GlobalGet(global), I::Call(printi), I::End]);
        builder.build()
    };
    let report = run(&bytes, &mut context(&[]), &limits()).unwrap();
    assert_eq!(report.console, "-7");
}

#[test]
fn test_descriptor_checks() {
    let mut builder = ContractBuilder::new();
    builder.apply(&[], vec![I::End]);
    let bytes = builder.build();
    let compiled = compile_bytecode(&bytes, &WasmLimits::default()).unwrap();
    let code = ExecutableBuffer::new(&compiled.code).unwrap();
    let mut executor = Executor::new(&WasmLimits::default()).unwrap();

    let mut stale = compiled.descriptor_at(ContentHash::of(&bytes), 0, 0);
    stale.meta.codegen_version ^= 0xff;
    let result = executor.execute(&stale, &code, &mut context(&[]), &limits());
    assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));

    let misplaced = compiled.descriptor_at(ContentHash::of(&bytes), 0, 16);
    let result = executor.execute(&misplaced, &code, &mut context(&[]), &limits());
    assert!(matches!(result, Err(ExecutionError::InvalidDescriptor(_))));

    let good = compiled.descriptor_at(ContentHash::of(&bytes), 0, 0);
    assert!(executor.execute(&good, &code, &mut context(&[]), &limits()).is_ok());
}
