//! Metering injection
//!
//! Appends the `checktime` import and prefixes every basic block with
//! `i32.const n; call checktime`, where `n` is the number of original
//! operators in the block including the one that ends it. Appending an
//! import shifts every defined function up by one, so a separate pass
//! rewrites each reference to a defined function.

use std::convert::Infallible;

use crate::intrinsics::{Intrinsic, INJECTION_MODULE};

use super::module::{ExportKind, Import, Module};
use super::op::{walk, Op, OpVisitor};

/// Instrument `module` in place for instruction metering
pub fn inject_metering(module: &mut Module) {
    let type_index = module.intern_type(Intrinsic::Checktime.signature());
    let checktime = module.num_imported_functions();

    shift_function_indices(module, checktime, 1);
    module.imports.push(Import {
        module: INJECTION_MODULE.to_string(),
        name: Intrinsic::Checktime.name().to_string(),
        type_index,
    });

    for body in &mut module.bodies {
        let mut injector = MeteringInjector::new(checktime, body.ops.len());
        let Ok(()) = walk(&body.ops, &mut injector);
        body.ops = injector.finish();
    }

    log::trace!("Injected metering into {} functions", module.bodies.len());
}

/// Add `by` to every function index at or above `first`
fn shift_function_indices(module: &mut Module, first: u32, by: u32) {
    let shift = |index: &mut u32| {
        if *index >= first {
            *index += by;
        }
    };

    for body in &mut module.bodies {
        for op in &mut body.ops {
            if let Op::Call(index) = op {
                shift(index);
            }
        }
    }
    for export in &mut module.exports {
        if export.kind == ExportKind::Func {
            shift(&mut export.index);
        }
    }
    if let Some(start) = &mut module.start {
        shift(start);
    }
    for segment in &mut module.elements {
        segment.functions.iter_mut().for_each(shift);
    }
}

/// Rebuilds one function body with metering calls
struct MeteringInjector {
    checktime: u32,
    out: Vec<Op>,
    /// Index in `out` of the current block's counter constant
    counter: usize,
    count: u32,
    depth: u32,
    done: bool,
}

impl MeteringInjector {
    fn new(checktime: u32, hint: usize) -> Self {
        let mut injector = MeteringInjector {
            checktime,
            out: Vec::with_capacity(hint + hint / 2 + 2),
            counter: 0,
            count: 0,
            depth: 0,
            done: false,
        };
        injector.open_block();
        injector
    }

    fn open_block(&mut self) {
        self.counter = self.out.len();
        self.out.push(Op::I32Const(0));
        self.out.push(Op::Call(self.checktime));
        self.count = 0;
    }

    fn close_block(&mut self) {
        self.out[self.counter] = Op::I32Const(self.count as i32);
    }

    fn finish(mut self) -> Vec<Op> {
        if !self.done {
            self.close_block();
        }
        self.out
    }
}

impl OpVisitor for MeteringInjector {
    type Error = Infallible;

    fn visit(&mut self, op: &Op) -> Result<(), Infallible> {
        self.out.push(op.clone());
        self.count += 1;

        let is_final_end = match op {
            op if op.opens_frame() => {
                self.depth += 1;
                false
            }
            Op::End if self.depth == 0 => true,
            Op::End => {
                self.depth -= 1;
                false
            }
            _ => false,
        };

        if op.ends_basic_block() {
            self.close_block();
            if is_final_end {
                self.done = true;
            } else {
                self.open_block();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::module::{Export, FuncType, FunctionBody, ValType};
    use crate::wasm::op::BlockType;

    fn module_with(ops: Vec<Op>) -> Module {
        let mut module = Module::default();
        let ty = module.intern_type(FuncType::new(&[ValType::I64, ValType::I64, ValType::I64], &[]));
        let host = module.intern_type(FuncType::new(&[], &[]));
        module.imports.push(Import { module: "env".into(), name: "abort".into(), type_index: host });
        module.functions.push(ty);
        module.bodies.push(FunctionBody { locals: vec![], ops });
        module.exports.push(Export { name: "apply".into(), kind: ExportKind::Func, index: 1 });
        module
    }

    #[test]
    fn test_straight_line_body_is_one_block() {
        let mut module = module_with(vec![Op::Nop, Op::Nop, Op::Nop, Op::End]);
        inject_metering(&mut module);
        assert_eq!(
            module.bodies[0].ops,
            vec![Op::I32Const(4), Op::Call(1), Op::Nop, Op::Nop, Op::Nop, Op::End]
        );
    }

    #[test]
    fn test_indices_shift_past_injected_import() {
        let mut module = module_with(vec![Op::Call(0), Op::Call(1), Op::End]);
        module.start = Some(1);
        inject_metering(&mut module);

        assert_eq!(module.imports.len(), 2);
        assert_eq!(module.imports[1].module, INJECTION_MODULE);
        assert_eq!(module.exported_function("apply"), Some(2));
        assert_eq!(module.start, Some(2));
        // Host import keeps its index, the recursive call moves
        assert_eq!(&module.bodies[0].ops[2..4], &[Op::Call(0), Op::Call(2)]);
    }

    #[test]
    fn test_loop_body_is_metered_per_iteration() {
        let mut module = module_with(vec![
            Op::Loop(BlockType::Empty),
            Op::Nop,
            Op::BrIf(0),
            Op::End,
            Op::End,
        ]);
        module.bodies[0].ops.insert(0, Op::I32Const(1));
        inject_metering(&mut module);
        let ops = &module.bodies[0].ops;
        // entry: i32.const 1, loop
        assert_eq!(&ops[0..2], &[Op::I32Const(2), Op::Call(1)]);
        assert_eq!(ops[3], Op::Loop(BlockType::Empty));
        // loop header: nop, br_if
        assert_eq!(&ops[4..6], &[Op::I32Const(2), Op::Call(1)]);
        // fall-through after br_if: end
        assert_eq!(&ops[8..10], &[Op::I32Const(1), Op::Call(1)]);
        // after the loop's end: final end
        assert_eq!(&ops[11..13], &[Op::I32Const(1), Op::Call(1)]);
        assert_eq!(ops.len(), 14);
        assert_eq!(ops.last(), Some(&Op::End));
    }
}
