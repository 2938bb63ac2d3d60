//! Re-encoding the module IR as a wasm binary
//!
//! Used after injection so the instrumented module can be re-validated,
//! hashed or handed to tools that expect a binary.

use std::borrow::Cow;

use wasm_encoder::{
    CodeSection, ConstExpr, DataSection, ElementSection, Elements, EntityType, ExportSection,
    Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction,
    MemorySection, MemoryType, Module as EncModule, RefType, StartSection, TableSection,
    TableType, TypeSection,
};

use super::module::{ConstValue, ExportKind, Module, ValType};
use super::op::*;

/// Encode `module` as a wasm binary
pub fn encode_module(module: &Module) -> Vec<u8> {
    let mut out = EncModule::new();

    let mut types = TypeSection::new();
    for ty in &module.types {
        types.ty().function(
            ty.params.iter().map(|&t| val_type(t)),
            ty.results.iter().map(|&t| val_type(t)),
        );
    }
    out.section(&types);

    if !module.imports.is_empty() {
        let mut imports = ImportSection::new();
        for import in &module.imports {
            imports.import(&import.module, &import.name, EntityType::Function(import.type_index));
        }
        out.section(&imports);
    }

    let mut functions = FunctionSection::new();
    for &type_index in &module.functions {
        functions.function(type_index);
    }
    out.section(&functions);

    if let Some(table) = module.table {
        let mut tables = TableSection::new();
        tables.table(TableType {
            element_type: RefType::FUNCREF,
            table64: false,
            minimum: table.initial as u64,
            maximum: table.maximum.map(u64::from),
            shared: false,
        });
        out.section(&tables);
    }

    if let Some(memory) = module.memory {
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: memory.initial as u64,
            maximum: memory.maximum.map(u64::from),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        out.section(&memories);
    }

    if !module.globals.is_empty() {
        let mut globals = GlobalSection::new();
        for global in &module.globals {
            globals.global(
                GlobalType { val_type: val_type(global.ty), mutable: global.mutable, shared: false },
                &const_expr(global.init),
            );
        }
        out.section(&globals);
    }

    let mut exports = ExportSection::new();
    for export in &module.exports {
        let kind = match export.kind {
            ExportKind::Func => wasm_encoder::ExportKind::Func,
            ExportKind::Table => wasm_encoder::ExportKind::Table,
            ExportKind::Memory => wasm_encoder::ExportKind::Memory,
            ExportKind::Global => wasm_encoder::ExportKind::Global,
        };
        exports.export(&export.name, kind, export.index);
    }
    out.section(&exports);

    if let Some(function_index) = module.start {
        out.section(&StartSection { function_index });
    }

    if !module.elements.is_empty() {
        let mut elements = ElementSection::new();
        for segment in &module.elements {
            elements.active(
                None,
                &ConstExpr::i32_const(segment.offset as i32),
                Elements::Functions(Cow::Borrowed(&segment.functions[..])),
            );
        }
        out.section(&elements);
    }

    let mut code = CodeSection::new();
    for body in &module.bodies {
        let mut function = Function::new(body.locals.iter().map(|&(n, t)| (n, val_type(t))));
        for op in &body.ops {
            function.instruction(&instruction(op));
        }
        code.function(&function);
    }
    out.section(&code);

    if !module.data.is_empty() {
        let mut data = DataSection::new();
        for segment in &module.data {
            data.active(
                0,
                &ConstExpr::i32_const(segment.offset as i32),
                segment.data.iter().copied(),
            );
        }
        out.section(&data);
    }

    out.finish()
}

fn val_type(ty: ValType) -> wasm_encoder::ValType {
    match ty {
        ValType::I32 => wasm_encoder::ValType::I32,
        ValType::I64 => wasm_encoder::ValType::I64,
        ValType::F32 => wasm_encoder::ValType::F32,
        ValType::F64 => wasm_encoder::ValType::F64,
    }
}

fn const_expr(value: ConstValue) -> ConstExpr {
    match value {
        ConstValue::I32(v) => ConstExpr::i32_const(v),
        ConstValue::I64(v) => ConstExpr::i64_const(v),
        ConstValue::F32(bits) => ConstExpr::f32_const(f32::from_bits(bits)),
        ConstValue::F64(bits) => ConstExpr::f64_const(f64::from_bits(bits)),
    }
}

fn block_type(ty: BlockType) -> wasm_encoder::BlockType {
    match ty {
        BlockType::Empty => wasm_encoder::BlockType::Empty,
        BlockType::Value(t) => wasm_encoder::BlockType::Result(val_type(t)),
    }
}

fn mem_arg(arg: MemArg) -> wasm_encoder::MemArg {
    wasm_encoder::MemArg { offset: arg.offset as u64, align: arg.align as u32, memory_index: 0 }
}

fn instruction(op: &Op) -> Instruction<'_> {
    use Instruction as I;
    match op {
        Op::Unreachable => I::Unreachable,
        Op::Nop => I::Nop,
        Op::Block(ty) => I::Block(block_type(*ty)),
        Op::Loop(ty) => I::Loop(block_type(*ty)),
        Op::If(ty) => I::If(block_type(*ty)),
        Op::Else => I::Else,
        Op::End => I::End,
        Op::Br(depth) => I::Br(*depth),
        Op::BrIf(depth) => I::BrIf(*depth),
        Op::BrTable { targets, default } => I::BrTable(Cow::Borrowed(&**targets), *default),
        Op::Return => I::Return,
        Op::Call(index) => I::Call(*index),
        Op::CallIndirect(type_index) => I::CallIndirect { type_index: *type_index, table_index: 0 },
        Op::Drop => I::Drop,
        Op::Select => I::Select,
        Op::LocalGet(i) => I::LocalGet(*i),
        Op::LocalSet(i) => I::LocalSet(*i),
        Op::LocalTee(i) => I::LocalTee(*i),
        Op::GlobalGet(i) => I::GlobalGet(*i),
        Op::GlobalSet(i) => I::GlobalSet(*i),
        Op::Load(access, arg) => load(*access, mem_arg(*arg)),
        Op::Store(access, arg) => store(*access, mem_arg(*arg)),
        Op::MemorySize => I::MemorySize(0),
        Op::MemoryGrow => I::MemoryGrow(0),
        Op::I32Const(v) => I::I32Const(*v),
        Op::I64Const(v) => I::I64Const(*v),
        Op::F32Const(bits) => I::F32Const(f32::from_bits(*bits)),
        Op::F64Const(bits) => I::F64Const(f64::from_bits(*bits)),
        Op::IntUnary(w, u) => int_unary(*w, *u),
        Op::IntBinary(w, b) => int_binary(*w, *b),
        Op::IntCompare(w, c) => int_compare(*w, *c),
        Op::FloatUnary(w, u) => float_unary(*w, *u),
        Op::FloatBinary(w, b) => float_binary(*w, *b),
        Op::FloatCompare(w, c) => float_compare(*w, *c),
        Op::Convert(c) => conversion(*c),
    }
}

fn load(access: Access, m: wasm_encoder::MemArg) -> Instruction<'static> {
    use Instruction as I;
    match (access.ty, access.bytes, access.signed) {
        (ValType::I32, 4, _) => I::I32Load(m),
        (ValType::I64, 8, _) => I::I64Load(m),
        (ValType::F32, _, _) => I::F32Load(m),
        (ValType::F64, _, _) => I::F64Load(m),
        (ValType::I32, 1, true) => I::I32Load8S(m),
        (ValType::I32, 1, false) => I::I32Load8U(m),
        (ValType::I32, _, true) => I::I32Load16S(m),
        (ValType::I32, _, false) => I::I32Load16U(m),
        (ValType::I64, 1, true) => I::I64Load8S(m),
        (ValType::I64, 1, false) => I::I64Load8U(m),
        (ValType::I64, 2, true) => I::I64Load16S(m),
        (ValType::I64, 2, false) => I::I64Load16U(m),
        (ValType::I64, _, true) => I::I64Load32S(m),
        (ValType::I64, _, false) => I::I64Load32U(m),
    }
}

fn store(access: Access, m: wasm_encoder::MemArg) -> Instruction<'static> {
    use Instruction as I;
    match (access.ty, access.bytes) {
        (ValType::I32, 4) => I::I32Store(m),
        (ValType::I64, 8) => I::I64Store(m),
        (ValType::F32, _) => I::F32Store(m),
        (ValType::F64, _) => I::F64Store(m),
        (ValType::I32, 1) => I::I32Store8(m),
        (ValType::I32, _) => I::I32Store16(m),
        (ValType::I64, 1) => I::I64Store8(m),
        (ValType::I64, 2) => I::I64Store16(m),
        (ValType::I64, _) => I::I64Store32(m),
    }
}

fn int_unary(w: IntWidth, op: IntUnary) -> Instruction<'static> {
    use Instruction as I;
    match (w, op) {
        (IntWidth::I32, IntUnary::Clz) => I::I32Clz,
        (IntWidth::I32, IntUnary::Ctz) => I::I32Ctz,
        (IntWidth::I32, IntUnary::Popcnt) => I::I32Popcnt,
        (IntWidth::I32, IntUnary::Eqz) => I::I32Eqz,
        (IntWidth::I32, IntUnary::Extend8S) => I::I32Extend8S,
        (IntWidth::I32, IntUnary::Extend16S | IntUnary::Extend32S) => I::I32Extend16S,
        (IntWidth::I64, IntUnary::Clz) => I::I64Clz,
        (IntWidth::I64, IntUnary::Ctz) => I::I64Ctz,
        (IntWidth::I64, IntUnary::Popcnt) => I::I64Popcnt,
        (IntWidth::I64, IntUnary::Eqz) => I::I64Eqz,
        (IntWidth::I64, IntUnary::Extend8S) => I::I64Extend8S,
        (IntWidth::I64, IntUnary::Extend16S) => I::I64Extend16S,
        (IntWidth::I64, IntUnary::Extend32S) => I::I64Extend32S,
    }
}

fn int_binary(w: IntWidth, op: IntBinary) -> Instruction<'static> {
    use Instruction as I;
    use IntBinary::*;
    match w {
        IntWidth::I32 => match op {
            Add => I::I32Add,
            Sub => I::I32Sub,
            Mul => I::I32Mul,
            DivS => I::I32DivS,
            DivU => I::I32DivU,
            RemS => I::I32RemS,
            RemU => I::I32RemU,
            And => I::I32And,
            Or => I::I32Or,
            Xor => I::I32Xor,
            Shl => I::I32Shl,
            ShrS => I::I32ShrS,
            ShrU => I::I32ShrU,
            Rotl => I::I32Rotl,
            Rotr => I::I32Rotr,
        },
        IntWidth::I64 => match op {
            Add => I::I64Add,
            Sub => I::I64Sub,
            Mul => I::I64Mul,
            DivS => I::I64DivS,
            DivU => I::I64DivU,
            RemS => I::I64RemS,
            RemU => I::I64RemU,
            And => I::I64And,
            Or => I::I64Or,
            Xor => I::I64Xor,
            Shl => I::I64Shl,
            ShrS => I::I64ShrS,
            ShrU => I::I64ShrU,
            Rotl => I::I64Rotl,
            Rotr => I::I64Rotr,
        },
    }
}

fn int_compare(w: IntWidth, op: IntCompare) -> Instruction<'static> {
    use Instruction as I;
    use IntCompare::*;
    match w {
        IntWidth::I32 => match op {
            Eq => I::I32Eq,
            Ne => I::I32Ne,
            LtS => I::I32LtS,
            LtU => I::I32LtU,
            GtS => I::I32GtS,
            GtU => I::I32GtU,
            LeS => I::I32LeS,
            LeU => I::I32LeU,
            GeS => I::I32GeS,
            GeU => I::I32GeU,
        },
        IntWidth::I64 => match op {
            Eq => I::I64Eq,
            Ne => I::I64Ne,
            LtS => I::I64LtS,
            LtU => I::I64LtU,
            GtS => I::I64GtS,
            GtU => I::I64GtU,
            LeS => I::I64LeS,
            LeU => I::I64LeU,
            GeS => I::I64GeS,
            GeU => I::I64GeU,
        },
    }
}

fn float_unary(w: FloatWidth, op: FloatUnary) -> Instruction<'static> {
    use FloatUnary::*;
    use Instruction as I;
    match w {
        FloatWidth::F32 => match op {
            Abs => I::F32Abs,
            Neg => I::F32Neg,
            Ceil => I::F32Ceil,
            Floor => I::F32Floor,
            Trunc => I::F32Trunc,
            Nearest => I::F32Nearest,
            Sqrt => I::F32Sqrt,
        },
        FloatWidth::F64 => match op {
            Abs => I::F64Abs,
            Neg => I::F64Neg,
            Ceil => I::F64Ceil,
            Floor => I::F64Floor,
            Trunc => I::F64Trunc,
            Nearest => I::F64Nearest,
            Sqrt => I::F64Sqrt,
        },
    }
}

fn float_binary(w: FloatWidth, op: FloatBinary) -> Instruction<'static> {
    use FloatBinary::*;
    use Instruction as I;
    match w {
        FloatWidth::F32 => match op {
            Add => I::F32Add,
            Sub => I::F32Sub,
            Mul => I::F32Mul,
            Div => I::F32Div,
            Min => I::F32Min,
            Max => I::F32Max,
            Copysign => I::F32Copysign,
        },
        FloatWidth::F64 => match op {
            Add => I::F64Add,
            Sub => I::F64Sub,
            Mul => I::F64Mul,
            Div => I::F64Div,
            Min => I::F64Min,
            Max => I::F64Max,
            Copysign => I::F64Copysign,
        },
    }
}

fn float_compare(w: FloatWidth, op: FloatCompare) -> Instruction<'static> {
    use FloatCompare::*;
    use Instruction as I;
    match w {
        FloatWidth::F32 => match op {
            Eq => I::F32Eq,
            Ne => I::F32Ne,
            Lt => I::F32Lt,
            Gt => I::F32Gt,
            Le => I::F32Le,
            Ge => I::F32Ge,
        },
        FloatWidth::F64 => match op {
            Eq => I::F64Eq,
            Ne => I::F64Ne,
            Lt => I::F64Lt,
            Gt => I::F64Gt,
            Le => I::F64Le,
            Ge => I::F64Ge,
        },
    }
}

fn conversion(c: Conversion) -> Instruction<'static> {
    use FloatWidth::{F32, F64};
    use Instruction as I;
    use IntWidth::{I32, I64};
    match c {
        Conversion::I32WrapI64 => I::I32WrapI64,
        Conversion::I64ExtendI32S => I::I64ExtendI32S,
        Conversion::I64ExtendI32U => I::I64ExtendI32U,
        Conversion::Trunc { to, from, signed } => match (to, from, signed) {
            (I32, F32, true) => I::I32TruncF32S,
            (I32, F32, false) => I::I32TruncF32U,
            (I32, F64, true) => I::I32TruncF64S,
            (I32, F64, false) => I::I32TruncF64U,
            (I64, F32, true) => I::I64TruncF32S,
            (I64, F32, false) => I::I64TruncF32U,
            (I64, F64, true) => I::I64TruncF64S,
            (I64, F64, false) => I::I64TruncF64U,
        },
        Conversion::Convert { to, from, signed } => match (to, from, signed) {
            (F32, I32, true) => I::F32ConvertI32S,
            (F32, I32, false) => I::F32ConvertI32U,
            (F32, I64, true) => I::F32ConvertI64S,
            (F32, I64, false) => I::F32ConvertI64U,
            (F64, I32, true) => I::F64ConvertI32S,
            (F64, I32, false) => I::F64ConvertI32U,
            (F64, I64, true) => I::F64ConvertI64S,
            (F64, I64, false) => I::F64ConvertI64U,
        },
        Conversion::F32DemoteF64 => I::F32DemoteF64,
        Conversion::F64PromoteF32 => I::F64PromoteF32,
        Conversion::I32ReinterpretF32 => I::I32ReinterpretF32,
        Conversion::I64ReinterpretF64 => I::I64ReinterpretF64,
        Conversion::F32ReinterpretI32 => I::F32ReinterpretI32,
        Conversion::F64ReinterpretI64 => I::F64ReinterpretI64,
    }
}
