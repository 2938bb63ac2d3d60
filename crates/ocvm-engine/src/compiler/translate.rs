//! Wasm to Cranelift IR lowering
//!
//! One `FuncTranslator` per defined function walks the operator list and
//! keeps the wasm operand stack as a `Vec<Value>`. Control frames carry the
//! Cranelift block a branch lands on; locals are frontend `Variable`s so SSA
//! construction is left to `cranelift-frontend`.
//!
//! Traps never unwind natively. A trap intrinsic records the trap code in
//! the control block and the function jumps to its `trap_exit` block,
//! which returns zeros. Every call that can trap is followed by a check of
//! the trap slot, so the whole call chain returns to the executor.

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::{Ieee32, Ieee64};
use cranelift_codegen::ir::{
    self, types, Block, BlockArg, InstBuilder, JumpTableData, MemFlags, SigRef, Value,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use rustc_hash::FxHashMap;

use crate::intrinsics::Intrinsic;
use crate::wasm::{
    walk, Access, BlockType, ConstValue, Conversion, FloatBinary, FloatCompare, FloatUnary,
    FloatWidth, FuncType, IntBinary, IntCompare, IntUnary, IntWidth, MemArg, Module, Op,
    OpVisitor, ValType,
};

use super::abi::{self, clif_type};
use super::CompileError;

// =============================================================================
// Module environment
// =============================================================================

/// How `global.get` reads a global
#[derive(Debug, Clone, Copy)]
pub(super) enum GlobalRef {
    /// Immutable, folded into the code
    Const(ConstValue),
    /// Mutable, stored in this 8-byte slot
    Slot(u32),
}

/// Module-wide facts shared by every function translation
pub(super) struct ModuleEnv<'m> {
    pub module: &'m Module,
    pub call_conv: CallConv,
    pub pointer: ir::Type,
    /// Intrinsic behind each imported function
    pub imports: Vec<Intrinsic>,
    pub globals: Vec<GlobalRef>,
    /// Blob offset of the indirect-call table
    pub table_offset: u64,
    pub table_len: u32,
}

impl<'m> ModuleEnv<'m> {
    pub fn new(module: &'m Module, call_conv: CallConv, pointer: ir::Type) -> Result<Self, CompileError> {
        let imports = module
            .imports
            .iter()
            .map(|import| {
                module
                    .types
                    .get(import.type_index as usize)
                    .and_then(|ty| Intrinsic::resolve_import(&import.module, &import.name, ty))
                    .ok_or_else(|| {
                        CompileError::Codegen(format!(
                            "Unresolved import {}.{}",
                            import.module, import.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut next_slot = 0;
        let globals = module
            .globals
            .iter()
            .map(|global| {
                if global.mutable {
                    next_slot += 1;
                    GlobalRef::Slot(next_slot - 1)
                } else {
                    GlobalRef::Const(global.init)
                }
            })
            .collect();

        Ok(ModuleEnv {
            module,
            call_conv,
            pointer,
            imports,
            globals,
            table_offset: module.bodies.len() as u64 * 8,
            table_len: module.table.map(|t| t.initial).unwrap_or(0),
        })
    }

    fn func_type(&self, func_index: u32) -> Result<&'m FuncType, CompileError> {
        self.module
            .func_type(func_index)
            .ok_or_else(|| CompileError::Codegen(format!("Function {} has no type", func_index)))
    }
}

// =============================================================================
// Entry point
// =============================================================================

/// Lower defined function `def_index` into `func`
pub(super) fn translate_function(
    env: &ModuleEnv<'_>,
    def_index: u32,
    func: &mut ir::Function,
    func_builder_ctx: &mut FunctionBuilderContext,
) -> Result<(), CompileError> {
    let func_index = env.module.num_imported_functions() + def_index;
    let ty = env.func_type(func_index)?;
    let body = env
        .module
        .bodies
        .get(def_index as usize)
        .ok_or_else(|| CompileError::Codegen(format!("Function {} has no body", def_index)))?;

    func.signature = abi::wasm_signature(ty, env.call_conv, env.pointer);
    func.name = ir::UserFuncName::user(0, def_index);

    let builder = FunctionBuilder::new(func, func_builder_ctx);
    let mut translator = FuncTranslator::new(env, builder, ty, body.local_types())?;
    walk(&body.ops, &mut translator)?;
    translator.finish();
    Ok(())
}

// =============================================================================
// Control frames
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Function,
    Block,
    Loop { header: Block },
    If { else_block: Block, else_seen: bool },
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    /// Block after the construct; its params are the construct's results
    next: Block,
    arity: usize,
    /// Operand stack height at entry
    height: usize,
    /// Whether any branch targets `next`
    branched: bool,
}

// =============================================================================
// Translator
// =============================================================================

struct FuncTranslator<'a, 'f> {
    env: &'a ModuleEnv<'a>,
    builder: FunctionBuilder<'f>,
    vmctx: Value,
    memory_base: Value,
    locals: Vec<Variable>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    reachable: bool,
    /// Frames opened while unreachable, skipped without translation
    dead_depth: u32,
    results: Vec<ir::Type>,
    trap_exit: Block,
    trap_used: bool,
    intrinsic_sigs: FxHashMap<u32, SigRef>,
    wasm_sigs: FxHashMap<u32, SigRef>,
}

impl<'a, 'f> FuncTranslator<'a, 'f> {
    fn new(
        env: &'a ModuleEnv<'a>,
        mut builder: FunctionBuilder<'f>,
        ty: &FuncType,
        local_types: impl Iterator<Item = ValType>,
    ) -> Result<Self, CompileError> {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let params = builder.block_params(entry).to_vec();
        let (&vmctx, wasm_params) = params
            .split_first()
            .ok_or_else(|| CompileError::Codegen("Signature lacks vmctx".to_string()))?;

        let mut locals = Vec::with_capacity(ty.params.len());
        for (&param_ty, &value) in ty.params.iter().zip(wasm_params) {
            let var = builder.declare_var(clif_type(param_ty));
            builder.def_var(var, value);
            locals.push(var);
        }
        for local_ty in local_types {
            let var = builder.declare_var(clif_type(local_ty));
            let zero = zero_value(&mut builder, local_ty);
            builder.def_var(var, zero);
            locals.push(var);
        }

        let memory_base = builder
            .ins()
            .load(env.pointer, MemFlags::trusted(), vmctx, abi::MEMORY_BASE);

        let results: Vec<ir::Type> = ty.results.iter().map(|&r| clif_type(r)).collect();
        let return_block = builder.create_block();
        for &result in &results {
            builder.append_block_param(return_block, result);
        }
        let trap_exit = builder.create_block();

        let mut translator = FuncTranslator {
            env,
            builder,
            vmctx,
            memory_base,
            locals,
            stack: Vec::new(),
            frames: vec![Frame {
                kind: FrameKind::Function,
                next: return_block,
                arity: results.len(),
                height: 0,
                branched: false,
            }],
            reachable: true,
            dead_depth: 0,
            results,
            trap_exit,
            trap_used: false,
            intrinsic_sigs: FxHashMap::default(),
            wasm_sigs: FxHashMap::default(),
        };
        translator.prologue();
        Ok(translator)
    }

    /// Fill the trap exit and hand the function back to Cranelift
    fn finish(mut self) {
        if self.trap_used {
            self.builder.switch_to_block(self.trap_exit);
            let zeros: Vec<Value> = self
                .results
                .clone()
                .into_iter()
                .map(|ty| clif_zero(&mut self.builder, ty))
                .collect();
            self.builder.ins().return_(&zeros);
        }
        self.builder.seal_all_blocks();
        self.builder.finalize();
    }

    // -------------------------------------------------------------------------
    // Control block access
    // -------------------------------------------------------------------------

    fn load_ctx(&mut self, ty: ir::Type, offset: i32) -> Value {
        self.builder.ins().load(ty, MemFlags::trusted(), self.vmctx, offset)
    }

    fn store_ctx(&mut self, value: Value, offset: i32) {
        self.builder.ins().store(MemFlags::trusted(), value, self.vmctx, offset);
    }

    /// Take one unit of call depth, trapping when none is left or the
    /// native stack is below the executor's limit
    fn prologue(&mut self) {
        let depth = self.load_ctx(types::I32, abi::DEPTH_REMAINING);
        let sp = self.builder.ins().get_stack_pointer(self.env.pointer);
        let limit = self.load_ctx(self.env.pointer, abi::STACK_LIMIT);
        let exhausted = self.builder.ins().icmp_imm(IntCC::Equal, depth, 0);
        let low = self.builder.ins().icmp(IntCC::UnsignedLessThan, sp, limit);
        let overflow = self.builder.ins().bor(exhausted, low);
        self.trap_if(overflow, Intrinsic::TrapCallDepth);

        let one = self.builder.ins().iconst(types::I32, 1);
        let depth = self.builder.ins().isub(depth, one);
        self.store_ctx(depth, abi::DEPTH_REMAINING);
    }

    /// Give the call depth back on the normal return path
    fn epilogue(&mut self) {
        let depth = self.load_ctx(types::I32, abi::DEPTH_REMAINING);
        let one = self.builder.ins().iconst(types::I32, 1);
        let depth = self.builder.ins().iadd(depth, one);
        self.store_ctx(depth, abi::DEPTH_REMAINING);
    }

    // -------------------------------------------------------------------------
    // Traps and intrinsic calls
    // -------------------------------------------------------------------------

    fn emit_trap(&mut self, trap: Intrinsic) {
        self.call_intrinsic_raw(trap, &[]);
        self.trap_used = true;
        self.builder.ins().jump(self.trap_exit, &[]);
    }

    fn trap_if(&mut self, cond: Value, trap: Intrinsic) {
        let trap_block = self.builder.create_block();
        let cont = self.builder.create_block();
        self.builder.ins().brif(cond, trap_block, &[], cont, &[]);

        self.builder.switch_to_block(trap_block);
        self.builder.seal_block(trap_block);
        self.emit_trap(trap);

        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
    }

    /// Leave through `trap_exit` if the trap slot is set
    fn check_trap(&mut self) {
        let slot = self.load_ctx(types::I32, abi::TRAP);
        let cont = self.builder.create_block();
        self.trap_used = true;
        self.builder.ins().brif(slot, self.trap_exit, &[], cont, &[]);
        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
    }

    fn call_intrinsic_raw(&mut self, intrinsic: Intrinsic, args: &[Value]) -> Vec<Value> {
        let builder = &mut self.builder;
        let (call_conv, pointer) = (self.env.call_conv, self.env.pointer);
        let sig = *self
            .intrinsic_sigs
            .entry(intrinsic.ordinal())
            .or_insert_with(|| {
                builder.import_signature(abi::intrinsic_signature(intrinsic, call_conv, pointer))
            });

        let callee = self.load_ctx(pointer, abi::intrinsic_offset(intrinsic));
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(self.vmctx);
        call_args.extend_from_slice(args);
        let inst = self.builder.ins().call_indirect(sig, callee, &call_args);
        self.builder.inst_results(inst).to_vec()
    }

    fn call_intrinsic(&mut self, intrinsic: Intrinsic, args: &[Value]) -> Vec<Value> {
        let results = self.call_intrinsic_raw(intrinsic, args);
        if intrinsic.may_trap() {
            self.check_trap();
        }
        results
    }

    /// Inline metering: subtract `cost` from the budget, or call
    /// `checktime` when the budget is short or the deadline flag is raised
    fn meter(&mut self, cost: Value) {
        let remaining = self.load_ctx(types::I64, abi::INSTRUCTIONS_REMAINING);
        let cost64 = self.builder.ins().uextend(types::I64, cost);
        let flag_ptr = self.load_ctx(self.env.pointer, abi::DEADLINE);
        let flag = self.builder.ins().load(types::I32, MemFlags::trusted(), flag_ptr, 0);

        let over = self.builder.ins().icmp(IntCC::UnsignedGreaterThan, cost64, remaining);
        let late = self.builder.ins().icmp_imm(IntCC::NotEqual, flag, 0);
        let slow = self.builder.ins().bor(over, late);

        let slow_block = self.builder.create_block();
        let fast_block = self.builder.create_block();
        let cont = self.builder.create_block();
        self.builder.ins().brif(slow, slow_block, &[], fast_block, &[]);

        self.builder.switch_to_block(fast_block);
        self.builder.seal_block(fast_block);
        let left = self.builder.ins().isub(remaining, cost64);
        self.store_ctx(left, abi::INSTRUCTIONS_REMAINING);
        self.builder.ins().jump(cont, &[]);

        self.builder.switch_to_block(slow_block);
        self.builder.seal_block(slow_block);
        self.call_intrinsic(Intrinsic::Checktime, &[cost]);
        self.builder.ins().jump(cont, &[]);

        self.builder.switch_to_block(cont);
        self.builder.seal_block(cont);
    }

    // -------------------------------------------------------------------------
    // Operand stack
    // -------------------------------------------------------------------------

    fn pop(&mut self) -> Result<Value, CompileError> {
        self.stack
            .pop()
            .ok_or_else(|| CompileError::Codegen("Operand stack underflow".to_string()))
    }

    fn pop2(&mut self) -> Result<(Value, Value), CompileError> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, CompileError> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| CompileError::Codegen("Operand stack underflow".to_string()))?;
        Ok(self.stack.split_off(at))
    }

    /// Top `n` values as block arguments, left on the stack
    fn peek_args(&self, n: usize) -> Result<Vec<BlockArg>, CompileError> {
        let at = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| CompileError::Codegen("Operand stack underflow".to_string()))?;
        Ok(self.stack[at..].iter().map(|&v| BlockArg::from(v)).collect())
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn local(&self, index: u32) -> Result<Variable, CompileError> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| CompileError::Codegen(format!("Local {} out of range", index)))
    }

    fn int_const(&mut self, width: IntWidth, value: i64) -> Value {
        match width {
            IntWidth::I32 => self.builder.ins().iconst(types::I32, i64::from(value as i32 as u32)),
            IntWidth::I64 => self.builder.ins().iconst(types::I64, value),
        }
    }

    // -------------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------------

    fn push_frame(&mut self, kind: FrameKind, next: Block, block_type: BlockType) {
        let arity = match block_type.result() {
            Some(ty) => {
                self.builder.append_block_param(next, clif_type(ty));
                1
            }
            None => 0,
        };
        self.frames.push(Frame { kind, next, arity, height: self.stack.len(), branched: false });
    }

    /// Branch destination and argument count for relative depth `depth`
    fn target(&mut self, depth: u32) -> Result<(Block, usize), CompileError> {
        let index = self
            .frames
            .len()
            .checked_sub(depth as usize + 1)
            .ok_or_else(|| CompileError::Codegen(format!("Branch depth {} out of range", depth)))?;
        let frame = &mut self.frames[index];
        match frame.kind {
            FrameKind::Loop { header } => Ok((header, 0)),
            _ => {
                frame.branched = true;
                Ok((frame.next, frame.arity))
            }
        }
    }

    fn translate_else(&mut self) -> Result<(), CompileError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| CompileError::Codegen("Else without frame".to_string()))?;
        let FrameKind::If { else_block, else_seen: false } = frame.kind else {
            return Err(CompileError::Codegen("Else without if".to_string()));
        };
        frame.kind = FrameKind::If { else_block, else_seen: true };
        let (next, arity, height) = (frame.next, frame.arity, frame.height);

        if self.reachable {
            let args = self.peek_args(arity)?;
            if let Some(frame) = self.frames.last_mut() {
                frame.branched = true;
            }
            self.builder.ins().jump(next, &args);
        }
        self.stack.truncate(height);
        self.builder.switch_to_block(else_block);
        self.reachable = true;
        Ok(())
    }

    fn translate_end(&mut self) -> Result<(), CompileError> {
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| CompileError::Codegen("End without frame".to_string()))?;

        if self.reachable {
            let args = self.peek_args(frame.arity)?;
            self.builder.ins().jump(frame.next, &args);
            frame.branched = true;
        }
        self.stack.truncate(frame.height);

        match frame.kind {
            FrameKind::Loop { header } => self.builder.seal_block(header),
            FrameKind::If { else_block, else_seen: false } => {
                // The implicit else passes straight through
                self.builder.switch_to_block(else_block);
                self.builder.ins().jump(frame.next, &[]);
                frame.branched = true;
            }
            _ => {}
        }

        if !frame.branched {
            self.reachable = false;
            return Ok(());
        }

        self.builder.switch_to_block(frame.next);
        self.builder.seal_block(frame.next);
        let results = self.builder.block_params(frame.next).to_vec();

        if let FrameKind::Function = frame.kind {
            self.epilogue();
            self.builder.ins().return_(&results);
            self.reachable = false;
        } else {
            self.stack.extend(results);
            self.reachable = true;
        }
        Ok(())
    }

    fn translate_br_table(&mut self, targets: &[u32], default: u32) -> Result<(), CompileError> {
        let index = self.pop()?;
        let (_, arity) = self.target(default)?;

        let jump_table = if arity == 0 {
            let mut data = Vec::with_capacity(targets.len());
            for &depth in targets {
                let (block, _) = self.target(depth)?;
                data.push(self.builder.func.dfg.block_call(block, &[]));
            }
            let (block, _) = self.target(default)?;
            let default_call = self.builder.func.dfg.block_call(block, &[]);
            JumpTableData::new(default_call, &data)
        } else {
            // Jump tables carry no arguments: route each distinct depth
            // through an edge block that forwards the operands
            let mut edges: FxHashMap<u32, Block> = FxHashMap::default();
            let mut order = Vec::new();
            let mut edge_for = |builder: &mut FunctionBuilder<'f>, depth: u32| {
                *edges.entry(depth).or_insert_with(|| {
                    let block = builder.create_block();
                    order.push((depth, block));
                    block
                })
            };

            let mut data = Vec::with_capacity(targets.len());
            for &depth in targets {
                let edge = edge_for(&mut self.builder, depth);
                data.push(self.builder.func.dfg.block_call(edge, &[]));
            }
            let default_edge = edge_for(&mut self.builder, default);
            let default_call = self.builder.func.dfg.block_call(default_edge, &[]);
            let jump_table = JumpTableData::new(default_call, &data);

            let jt = self.builder.create_jump_table(jump_table);
            self.builder.ins().br_table(index, jt);

            let args = self.peek_args(arity)?;
            for (depth, edge) in order {
                let (block, _) = self.target(depth)?;
                self.builder.switch_to_block(edge);
                self.builder.seal_block(edge);
                self.builder.ins().jump(block, &args);
            }
            self.reachable = false;
            return Ok(());
        };

        let jt = self.builder.create_jump_table(jump_table);
        self.builder.ins().br_table(index, jt);
        self.reachable = false;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    fn wasm_sig(&mut self, type_index: u32) -> Result<SigRef, CompileError> {
        if let Some(&sig) = self.wasm_sigs.get(&type_index) {
            return Ok(sig);
        }
        let ty = self
            .env
            .module
            .types
            .get(type_index as usize)
            .ok_or_else(|| CompileError::Codegen(format!("Type {} out of range", type_index)))?;
        let sig = self
            .builder
            .import_signature(abi::wasm_signature(ty, self.env.call_conv, self.env.pointer));
        self.wasm_sigs.insert(type_index, sig);
        Ok(sig)
    }

    /// Call compiled code at `code_base + offset`
    fn call_code(&mut self, sig: SigRef, code_base: Value, offset: Value, args: Vec<Value>) {
        let target = self.builder.ins().iadd(code_base, offset);
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(self.vmctx);
        call_args.extend(args);
        let inst = self.builder.ins().call_indirect(sig, target, &call_args);
        let results = self.builder.inst_results(inst).to_vec();
        self.check_trap();
        self.stack.extend(results);
    }

    fn translate_call(&mut self, func_index: u32) -> Result<(), CompileError> {
        let ty = self.env.func_type(func_index)?;
        let args = self.pop_n(ty.params.len())?;
        let imported = self.env.module.num_imported_functions();

        if func_index < imported {
            let intrinsic = self.env.imports[func_index as usize];
            if intrinsic == Intrinsic::Checktime {
                self.meter(args[0]);
            } else {
                let results = self.call_intrinsic(intrinsic, &args);
                self.stack.extend(results);
            }
            return Ok(());
        }

        let type_index = self
            .env
            .module
            .func_type_index(func_index)
            .ok_or_else(|| CompileError::Codegen(format!("Function {} has no type", func_index)))?;
        let sig = self.wasm_sig(type_index)?;
        let slot = i32::try_from((func_index - imported) as u64 * 8)
            .map_err(|_| CompileError::Codegen("Function offset table too large".to_string()))?;

        let code_base = self.load_ctx(self.env.pointer, abi::CODE_BASE);
        let offset = self.builder.ins().load(types::I64, MemFlags::trusted(), code_base, slot);
        self.call_code(sig, code_base, offset, args);
        Ok(())
    }

    fn translate_call_indirect(&mut self, type_index: u32) -> Result<(), CompileError> {
        let index = self.pop()?;
        let ty = self
            .env
            .module
            .types
            .get(type_index as usize)
            .ok_or_else(|| CompileError::Codegen(format!("Type {} out of range", type_index)))?;
        let args = self.pop_n(ty.params.len())?;
        let sig = self.wasm_sig(type_index)?;
        let table_offset = i32::try_from(self.env.table_offset)
            .map_err(|_| CompileError::Codegen("Indirect table offset too large".to_string()))?;

        let oob = self.builder.ins().icmp_imm(
            IntCC::UnsignedGreaterThanOrEqual,
            index,
            i64::from(self.env.table_len),
        );
        self.trap_if(oob, Intrinsic::TrapIndirectOutOfBounds);

        let code_base = self.load_ctx(self.env.pointer, abi::CODE_BASE);
        let index64 = self.builder.ins().uextend(types::I64, index);
        let scaled = self.builder.ins().ishl_imm(index64, 4);
        let entry = self.builder.ins().iadd(code_base, scaled);

        let tag = self.builder.ins().load(types::I64, MemFlags::trusted(), entry, table_offset);
        let expected = i64::from(self.env.module.canonical_type(type_index));
        let mismatch = self.builder.ins().icmp_imm(IntCC::NotEqual, tag, expected);
        self.trap_if(mismatch, Intrinsic::TrapIndirectMismatch);

        let offset = self
            .builder
            .ins()
            .load(types::I64, MemFlags::trusted(), entry, table_offset + 8);
        self.call_code(sig, code_base, offset, args);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    /// Bounds-checked native address of a `bytes`-wide access
    fn address(&mut self, addr: Value, memarg: MemArg, bytes: u8) -> Value {
        let addr = self.builder.ins().uextend(types::I64, addr);
        let end = self
            .builder
            .ins()
            .iadd_imm(addr, i64::from(memarg.offset) + i64::from(bytes));
        let size = self.load_ctx(types::I64, abi::MEMORY_SIZE);
        let oob = self.builder.ins().icmp(IntCC::UnsignedGreaterThan, end, size);
        self.trap_if(oob, Intrinsic::TrapMemoryOutOfBounds);

        let base = self.builder.ins().iadd(self.memory_base, addr);
        self.builder.ins().iadd_imm(base, i64::from(memarg.offset))
    }

    fn translate_load(&mut self, access: Access, memarg: MemArg) -> Result<(), CompileError> {
        let addr = self.pop()?;
        let ptr = self.address(addr, memarg, access.bytes);
        let flags = heap_flags();
        let ty = clif_type(access.ty);
        let ins = self.builder.ins();
        let value = match (access.bytes, access.signed) {
            (bytes, _) if u32::from(bytes) == access.ty.byte_width() => ins.load(ty, flags, ptr, 0),
            (1, false) => ins.uload8(ty, flags, ptr, 0),
            (1, true) => ins.sload8(ty, flags, ptr, 0),
            (2, false) => ins.uload16(ty, flags, ptr, 0),
            (2, true) => ins.sload16(ty, flags, ptr, 0),
            (_, false) => ins.uload32(flags, ptr, 0),
            (_, true) => ins.sload32(flags, ptr, 0),
        };
        self.push(value);
        Ok(())
    }

    fn translate_store(&mut self, access: Access, memarg: MemArg) -> Result<(), CompileError> {
        let value = self.pop()?;
        let addr = self.pop()?;
        let ptr = self.address(addr, memarg, access.bytes);
        let flags = heap_flags();
        let ins = self.builder.ins();
        match access.bytes {
            bytes if u32::from(bytes) == access.ty.byte_width() => ins.store(flags, value, ptr, 0),
            1 => ins.istore8(flags, value, ptr, 0),
            2 => ins.istore16(flags, value, ptr, 0),
            _ => ins.istore32(flags, value, ptr, 0),
        };
        Ok(())
    }

    fn global_slot(&self, index: u32) -> Result<GlobalRef, CompileError> {
        self.env
            .globals
            .get(index as usize)
            .copied()
            .ok_or_else(|| CompileError::Codegen(format!("Global {} out of range", index)))
    }

    // -------------------------------------------------------------------------
    // Numeric operators
    // -------------------------------------------------------------------------

    fn translate_int_unary(&mut self, width: IntWidth, op: IntUnary) -> Result<(), CompileError> {
        let value = self.pop()?;
        let ty = clif_type(width.ty());
        let ins = self.builder.ins();
        let result = match op {
            IntUnary::Clz => ins.clz(value),
            IntUnary::Ctz => ins.ctz(value),
            IntUnary::Popcnt => ins.popcnt(value),
            IntUnary::Eqz => {
                let zero = ins.icmp_imm(IntCC::Equal, value, 0);
                self.builder.ins().uextend(types::I32, zero)
            }
            IntUnary::Extend8S => {
                let narrow = ins.ireduce(types::I8, value);
                self.builder.ins().sextend(ty, narrow)
            }
            IntUnary::Extend16S => {
                let narrow = ins.ireduce(types::I16, value);
                self.builder.ins().sextend(ty, narrow)
            }
            IntUnary::Extend32S => {
                let narrow = ins.ireduce(types::I32, value);
                self.builder.ins().sextend(ty, narrow)
            }
        };
        self.push(result);
        Ok(())
    }

    fn translate_int_binary(&mut self, width: IntWidth, op: IntBinary) -> Result<(), CompileError> {
        let (a, b) = self.pop2()?;

        match op {
            IntBinary::DivS | IntBinary::DivU | IntBinary::RemS | IntBinary::RemU => {
                let zero = self.builder.ins().icmp_imm(IntCC::Equal, b, 0);
                self.trap_if(zero, Intrinsic::TrapInteger);
            }
            _ => {}
        }
        if op == IntBinary::DivS {
            let min = match width {
                IntWidth::I32 => i64::from(i32::MIN),
                IntWidth::I64 => i64::MIN,
            };
            let min = self.int_const(width, min);
            let minus_one = self.int_const(width, -1);
            let a_min = self.builder.ins().icmp(IntCC::Equal, a, min);
            let b_neg = self.builder.ins().icmp(IntCC::Equal, b, minus_one);
            let overflow = self.builder.ins().band(a_min, b_neg);
            self.trap_if(overflow, Intrinsic::TrapInteger);
        }

        let ins = self.builder.ins();
        let result = match op {
            IntBinary::Add => ins.iadd(a, b),
            IntBinary::Sub => ins.isub(a, b),
            IntBinary::Mul => ins.imul(a, b),
            IntBinary::DivS => ins.sdiv(a, b),
            IntBinary::DivU => ins.udiv(a, b),
            IntBinary::RemS => ins.srem(a, b),
            IntBinary::RemU => ins.urem(a, b),
            IntBinary::And => ins.band(a, b),
            IntBinary::Or => ins.bor(a, b),
            IntBinary::Xor => ins.bxor(a, b),
            IntBinary::Shl => ins.ishl(a, b),
            IntBinary::ShrS => ins.sshr(a, b),
            IntBinary::ShrU => ins.ushr(a, b),
            IntBinary::Rotl => ins.rotl(a, b),
            IntBinary::Rotr => ins.rotr(a, b),
        };
        self.push(result);
        Ok(())
    }

    fn translate_int_compare(&mut self, op: IntCompare) -> Result<(), CompileError> {
        let (a, b) = self.pop2()?;
        let cc = match op {
            IntCompare::Eq => IntCC::Equal,
            IntCompare::Ne => IntCC::NotEqual,
            IntCompare::LtS => IntCC::SignedLessThan,
            IntCompare::LtU => IntCC::UnsignedLessThan,
            IntCompare::GtS => IntCC::SignedGreaterThan,
            IntCompare::GtU => IntCC::UnsignedGreaterThan,
            IntCompare::LeS => IntCC::SignedLessThanOrEqual,
            IntCompare::LeU => IntCC::UnsignedLessThanOrEqual,
            IntCompare::GeS => IntCC::SignedGreaterThanOrEqual,
            IntCompare::GeU => IntCC::UnsignedGreaterThanOrEqual,
        };
        let flag = self.builder.ins().icmp(cc, a, b);
        let result = self.builder.ins().uextend(types::I32, flag);
        self.push(result);
        Ok(())
    }

    fn translate_float_unary(&mut self, width: FloatWidth, op: FloatUnary) -> Result<(), CompileError> {
        let value = self.pop()?;
        let rounding = |f32_op, f64_op| match width {
            FloatWidth::F32 => f32_op,
            FloatWidth::F64 => f64_op,
        };
        let result = match op {
            FloatUnary::Abs => self.builder.ins().fabs(value),
            FloatUnary::Neg => self.builder.ins().fneg(value),
            FloatUnary::Sqrt => self.builder.ins().sqrt(value),
            FloatUnary::Ceil => self.call_unary(rounding(Intrinsic::F32Ceil, Intrinsic::F64Ceil), value)?,
            FloatUnary::Floor => {
                self.call_unary(rounding(Intrinsic::F32Floor, Intrinsic::F64Floor), value)?
            }
            FloatUnary::Trunc => {
                self.call_unary(rounding(Intrinsic::F32Trunc, Intrinsic::F64Trunc), value)?
            }
            FloatUnary::Nearest => {
                self.call_unary(rounding(Intrinsic::F32Nearest, Intrinsic::F64Nearest), value)?
            }
        };
        self.push(result);
        Ok(())
    }

    fn call_unary(&mut self, intrinsic: Intrinsic, value: Value) -> Result<Value, CompileError> {
        self.call_intrinsic(intrinsic, &[value])
            .first()
            .copied()
            .ok_or_else(|| CompileError::Codegen(format!("{} returned nothing", intrinsic.name())))
    }

    fn translate_float_binary(&mut self, op: FloatBinary) -> Result<(), CompileError> {
        let (a, b) = self.pop2()?;
        let ins = self.builder.ins();
        let result = match op {
            FloatBinary::Add => ins.fadd(a, b),
            FloatBinary::Sub => ins.fsub(a, b),
            FloatBinary::Mul => ins.fmul(a, b),
            FloatBinary::Div => ins.fdiv(a, b),
            FloatBinary::Min => ins.fmin(a, b),
            FloatBinary::Max => ins.fmax(a, b),
            FloatBinary::Copysign => ins.fcopysign(a, b),
        };
        self.push(result);
        Ok(())
    }

    fn translate_float_compare(&mut self, op: FloatCompare) -> Result<(), CompileError> {
        let (a, b) = self.pop2()?;
        let cc = match op {
            FloatCompare::Eq => FloatCC::Equal,
            FloatCompare::Ne => FloatCC::NotEqual,
            FloatCompare::Lt => FloatCC::LessThan,
            FloatCompare::Gt => FloatCC::GreaterThan,
            FloatCompare::Le => FloatCC::LessThanOrEqual,
            FloatCompare::Ge => FloatCC::GreaterThanOrEqual,
        };
        let flag = self.builder.ins().fcmp(cc, a, b);
        let result = self.builder.ins().uextend(types::I32, flag);
        self.push(result);
        Ok(())
    }

    fn translate_conversion(&mut self, conversion: Conversion) -> Result<(), CompileError> {
        let value = self.pop()?;
        let (_, to) = conversion.types();
        let to = clif_type(to);
        let result = match conversion {
            Conversion::I32WrapI64 => self.builder.ins().ireduce(types::I32, value),
            Conversion::I64ExtendI32S => self.builder.ins().sextend(types::I64, value),
            Conversion::I64ExtendI32U => self.builder.ins().uextend(types::I64, value),
            Conversion::Trunc { to: int, from, signed } => {
                let intrinsic = truncation_intrinsic(int, from, signed);
                self.call_intrinsic(intrinsic, &[value]).first().copied().ok_or_else(|| {
                    CompileError::Codegen(format!("{} returned nothing", intrinsic.name()))
                })?
            }
            Conversion::Convert { signed: true, .. } => self.builder.ins().fcvt_from_sint(to, value),
            Conversion::Convert { signed: false, .. } => self.builder.ins().fcvt_from_uint(to, value),
            Conversion::F32DemoteF64 => self.builder.ins().fdemote(types::F32, value),
            Conversion::F64PromoteF32 => self.builder.ins().fpromote(types::F64, value),
            Conversion::I32ReinterpretF32
            | Conversion::I64ReinterpretF64
            | Conversion::F32ReinterpretI32
            | Conversion::F64ReinterpretI64 => self.builder.ins().bitcast(to, MemFlags::new(), value),
        };
        self.push(result);
        Ok(())
    }
}

impl OpVisitor for FuncTranslator<'_, '_> {
    type Error = CompileError;

    fn visit(&mut self, op: &Op) -> Result<(), CompileError> {
        if !self.reachable {
            match op {
                op if op.opens_frame() => {
                    self.dead_depth += 1;
                    return Ok(());
                }
                Op::End if self.dead_depth > 0 => {
                    self.dead_depth -= 1;
                    return Ok(());
                }
                Op::Else if self.dead_depth > 0 => return Ok(()),
                Op::Else | Op::End => {}
                _ => return Ok(()),
            }
        }

        match op {
            Op::Unreachable => {
                self.emit_trap(Intrinsic::TrapUnreachable);
                self.reachable = false;
            }
            Op::Nop => {}
            Op::Block(block_type) => {
                let next = self.builder.create_block();
                self.push_frame(FrameKind::Block, next, *block_type);
            }
            Op::Loop(block_type) => {
                let header = self.builder.create_block();
                let next = self.builder.create_block();
                self.builder.ins().jump(header, &[]);
                self.builder.switch_to_block(header);
                self.push_frame(FrameKind::Loop { header }, next, *block_type);
            }
            Op::If(block_type) => {
                let cond = self.pop()?;
                let then_block = self.builder.create_block();
                let else_block = self.builder.create_block();
                let next = self.builder.create_block();
                self.builder.ins().brif(cond, then_block, &[], else_block, &[]);
                self.builder.seal_block(else_block);
                self.builder.switch_to_block(then_block);
                self.builder.seal_block(then_block);
                self.push_frame(FrameKind::If { else_block, else_seen: false }, next, *block_type);
            }
            Op::Else => self.translate_else()?,
            Op::End => self.translate_end()?,
            Op::Br(depth) => {
                let (block, arity) = self.target(*depth)?;
                let args = self.peek_args(arity)?;
                self.builder.ins().jump(block, &args);
                self.reachable = false;
            }
            Op::BrIf(depth) => {
                let cond = self.pop()?;
                let (block, arity) = self.target(*depth)?;
                let args = self.peek_args(arity)?;
                let cont = self.builder.create_block();
                self.builder.ins().brif(cond, block, &args, cont, &[]);
                self.builder.switch_to_block(cont);
                self.builder.seal_block(cont);
            }
            Op::BrTable { targets, default } => self.translate_br_table(targets, *default)?,
            Op::Return => {
                let depth = self.frames.len() as u32 - 1;
                let (block, arity) = self.target(depth)?;
                let args = self.peek_args(arity)?;
                self.builder.ins().jump(block, &args);
                self.reachable = false;
            }
            Op::Call(func_index) => self.translate_call(*func_index)?,
            Op::CallIndirect(type_index) => self.translate_call_indirect(*type_index)?,
            Op::Drop => {
                self.pop()?;
            }
            Op::Select => {
                let cond = self.pop()?;
                let (a, b) = self.pop2()?;
                let value = self.builder.ins().select(cond, a, b);
                self.push(value);
            }
            Op::LocalGet(index) => {
                let var = self.local(*index)?;
                let value = self.builder.use_var(var);
                self.push(value);
            }
            Op::LocalSet(index) => {
                let var = self.local(*index)?;
                let value = self.pop()?;
                self.builder.def_var(var, value);
            }
            Op::LocalTee(index) => {
                let var = self.local(*index)?;
                let value = *self
                    .stack
                    .last()
                    .ok_or_else(|| CompileError::Codegen("Operand stack underflow".to_string()))?;
                self.builder.def_var(var, value);
            }
            Op::GlobalGet(index) => {
                let value = match self.global_slot(*index)? {
                    GlobalRef::Const(init) => const_value(&mut self.builder, init),
                    GlobalRef::Slot(slot) => {
                        let ty = clif_type(self.env.module.globals[*index as usize].ty);
                        let globals = self.load_ctx(self.env.pointer, abi::GLOBALS);
                        self.builder
                            .ins()
                            .load(ty, MemFlags::trusted(), globals, slot as i32 * 8)
                    }
                };
                self.push(value);
            }
            Op::GlobalSet(index) => {
                let GlobalRef::Slot(slot) = self.global_slot(*index)? else {
                    return Err(CompileError::Codegen(format!("Global {} is immutable", index)));
                };
                let value = self.pop()?;
                let globals = self.load_ctx(self.env.pointer, abi::GLOBALS);
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), value, globals, slot as i32 * 8);
            }
            Op::Load(access, memarg) => self.translate_load(*access, *memarg)?,
            Op::Store(access, memarg) => self.translate_store(*access, *memarg)?,
            Op::MemorySize => {
                let pages = self.load_ctx(types::I32, abi::CURRENT_PAGES);
                self.push(pages);
            }
            Op::MemoryGrow => {
                let delta = self.pop()?;
                let previous = self.call_unary(Intrinsic::GrowMemory, delta)?;
                self.push(previous);
            }
            Op::I32Const(v) => {
                let value = self.int_const(IntWidth::I32, i64::from(*v));
                self.push(value);
            }
            Op::I64Const(v) => {
                let value = self.int_const(IntWidth::I64, *v);
                self.push(value);
            }
            Op::F32Const(bits) => {
                let value = self.builder.ins().f32const(Ieee32::with_bits(*bits));
                self.push(value);
            }
            Op::F64Const(bits) => {
                let value = self.builder.ins().f64const(Ieee64::with_bits(*bits));
                self.push(value);
            }
            Op::IntUnary(width, op) => self.translate_int_unary(*width, *op)?,
            Op::IntBinary(width, op) => self.translate_int_binary(*width, *op)?,
            Op::IntCompare(_, op) => self.translate_int_compare(*op)?,
            Op::FloatUnary(width, op) => self.translate_float_unary(*width, *op)?,
            Op::FloatBinary(_, op) => self.translate_float_binary(*op)?,
            Op::FloatCompare(_, op) => self.translate_float_compare(*op)?,
            Op::Convert(conversion) => self.translate_conversion(*conversion)?,
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Flags for linear-memory accesses; the explicit bounds check precedes them
fn heap_flags() -> MemFlags {
    MemFlags::new().with_notrap()
}

fn zero_value(builder: &mut FunctionBuilder<'_>, ty: ValType) -> Value {
    clif_zero(builder, clif_type(ty))
}

fn clif_zero(builder: &mut FunctionBuilder<'_>, ty: ir::Type) -> Value {
    match ty {
        types::F32 => builder.ins().f32const(Ieee32::with_bits(0)),
        types::F64 => builder.ins().f64const(Ieee64::with_bits(0)),
        _ => builder.ins().iconst(ty, 0),
    }
}

fn const_value(builder: &mut FunctionBuilder<'_>, value: ConstValue) -> Value {
    match value {
        ConstValue::I32(v) => builder.ins().iconst(types::I32, i64::from(v as u32)),
        ConstValue::I64(v) => builder.ins().iconst(types::I64, v),
        ConstValue::F32(bits) => builder.ins().f32const(Ieee32::with_bits(bits)),
        ConstValue::F64(bits) => builder.ins().f64const(Ieee64::with_bits(bits)),
    }
}

fn truncation_intrinsic(to: IntWidth, from: FloatWidth, signed: bool) -> Intrinsic {
    match (to, from, signed) {
        (IntWidth::I32, FloatWidth::F32, true) => Intrinsic::I32TruncF32S,
        (IntWidth::I32, FloatWidth::F32, false) => Intrinsic::I32TruncF32U,
        (IntWidth::I32, FloatWidth::F64, true) => Intrinsic::I32TruncF64S,
        (IntWidth::I32, FloatWidth::F64, false) => Intrinsic::I32TruncF64U,
        (IntWidth::I64, FloatWidth::F32, true) => Intrinsic::I64TruncF32S,
        (IntWidth::I64, FloatWidth::F32, false) => Intrinsic::I64TruncF32U,
        (IntWidth::I64, FloatWidth::F64, true) => Intrinsic::I64TruncF64S,
        (IntWidth::I64, FloatWidth::F64, false) => Intrinsic::I64TruncF64U,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::{Export, ExportKind, FunctionBody, Import};
    use cranelift_codegen::settings;

    fn module_with(ty: FuncType, locals: Vec<(u32, ValType)>, ops: Vec<Op>) -> Module {
        let mut module = Module::default();
        let checktime = module.intern_type(Intrinsic::Checktime.signature());
        module.imports.push(Import {
            module: crate::intrinsics::INJECTION_MODULE.into(),
            name: "checktime".into(),
            type_index: checktime,
        });
        let type_index = module.intern_type(ty);
        module.functions.push(type_index);
        module.bodies.push(FunctionBody { locals, ops });
        module.exports.push(Export { name: "f".into(), kind: ExportKind::Func, index: 1 });
        module
    }

    fn lower(module: &Module) -> ir::Function {
        let env = ModuleEnv::new(module, CallConv::SystemV, types::I64).unwrap();
        let mut func = ir::Function::new();
        let mut ctx = FunctionBuilderContext::new();
        translate_function(&env, 0, &mut func, &mut ctx).unwrap();
        let flags = settings::Flags::new(settings::builder());
        cranelift_codegen::verify_function(&func, &flags).unwrap();
        func
    }

    #[test]
    fn test_lower_arithmetic() {
        let module = module_with(
            FuncType::new(&[ValType::I32, ValType::I32], &[ValType::I32]),
            vec![],
            vec![
                Op::LocalGet(0),
                Op::LocalGet(1),
                Op::IntBinary(IntWidth::I32, IntBinary::DivS),
                Op::End,
            ],
        );
        let func = lower(&module);
        assert_eq!(func.signature.params.len(), 3);
        assert_eq!(func.signature.returns.len(), 1);
    }

    #[test]
    fn test_lower_nested_control() {
        let module = module_with(
            FuncType::new(&[ValType::I32], &[ValType::I64]),
            vec![(1, ValType::I64)],
            vec![
                Op::Block(BlockType::Value(ValType::I64)),
                Op::Loop(BlockType::Empty),
                Op::I32Const(3),
                Op::Call(0),
                Op::LocalGet(0),
                Op::If(BlockType::Empty),
                Op::LocalGet(1),
                Op::I64Const(1),
                Op::IntBinary(IntWidth::I64, IntBinary::Add),
                Op::LocalSet(1),
                Op::Else,
                Op::LocalGet(1),
                Op::Br(2),
                Op::End,
                Op::LocalGet(0),
                Op::I32Const(1),
                Op::IntBinary(IntWidth::I32, IntBinary::Sub),
                Op::LocalTee(0),
                Op::BrIf(0),
                Op::End,
                Op::LocalGet(1),
                Op::End,
                Op::End,
            ],
        );
        lower(&module);
    }

    #[test]
    fn test_lower_br_table_with_value() {
        let module = module_with(
            FuncType::new(&[ValType::I32], &[ValType::I32]),
            vec![],
            vec![
                Op::Block(BlockType::Value(ValType::I32)),
                Op::Block(BlockType::Value(ValType::I32)),
                Op::I32Const(7),
                Op::LocalGet(0),
                Op::BrTable { targets: vec![0, 1, 0].into_boxed_slice(), default: 1 },
                Op::End,
                Op::Drop,
                Op::I32Const(9),
                Op::End,
                Op::End,
            ],
        );
        lower(&module);
    }

    #[test]
    fn test_code_after_unreachable_is_skipped() {
        let module = module_with(
            FuncType::new(&[], &[ValType::I32]),
            vec![],
            vec![
                Op::Unreachable,
                Op::Block(BlockType::Empty),
                Op::Nop,
                Op::End,
                Op::I32Const(1),
                Op::End,
            ],
        );
        lower(&module);
    }

    #[test]
    fn test_lower_memory_and_floats() {
        let mut module = module_with(
            FuncType::new(&[ValType::I32], &[ValType::F64]),
            vec![],
            vec![
                Op::LocalGet(0),
                Op::LocalGet(0),
                Op::Load(Access::narrow(ValType::I32, 2, true), MemArg { align: 1, offset: 4 }),
                Op::Store(Access::full(ValType::I32), MemArg { align: 2, offset: 0 }),
                Op::F64Const(2.5f64.to_bits()),
                Op::FloatUnary(FloatWidth::F64, FloatUnary::Nearest),
                Op::Convert(Conversion::Trunc { to: IntWidth::I64, from: FloatWidth::F64, signed: true }),
                Op::Convert(Conversion::Convert { to: FloatWidth::F64, from: IntWidth::I64, signed: false }),
                Op::End,
            ],
        );
        module.memory = Some(crate::wasm::Memory { initial: 1, maximum: None });
        lower(&module);
    }

    #[test]
    fn test_unresolved_import_is_rejected() {
        let mut module = Module::default();
        let ty = module.intern_type(FuncType::new(&[], &[]));
        module.imports.push(Import { module: "env".into(), name: "nope".into(), type_index: ty });
        let result = ModuleEnv::new(&module, CallConv::SystemV, types::I64);
        assert!(matches!(result, Err(CompileError::Codegen(_))));
    }
}
