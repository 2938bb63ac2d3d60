//! Decoding wasm binaries into the module IR
//!
//! Parsing happens in two steps so that section-level constraints can be
//! checked before any function body is decoded:
//! 1. `RawModule::parse` validates the binary with `wasmparser` and
//!    collects every section except code, keeping bodies undecoded
//! 2. `RawModule::decode_bodies` maps each operator onto `Op`, failing
//!    closed on anything outside the allow-list

use wasmparser::{
    DataKind, ElementItems, ElementKind, ExternalKind, FunctionBody as RawBody, Operator, Parser,
    Payload, TableInit, TypeRef,
};

use super::error::ValidationError;
use super::module::*;
use super::op::*;

/// A module whose function bodies have not been decoded yet
pub(crate) struct RawModule<'a> {
    pub(crate) module: Module,
    bodies: Vec<RawBody<'a>>,
}

/// Parse and fully decode a module
pub fn parse_module(bytes: &[u8]) -> Result<Module, ValidationError> {
    RawModule::parse(bytes)?.decode_bodies()
}

impl<'a> RawModule<'a> {
    pub(crate) fn parse(bytes: &'a [u8]) -> Result<Self, ValidationError> {
        wasmparser::validate(bytes)?;

        let mut module = Module::default();
        let mut bodies = Vec::new();

        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::TypeSection(reader) => {
                    for ty in reader.into_iter_err_on_gc_types() {
                        let ty = ty?;
                        module.types.push(FuncType {
                            params: convert_types(ty.params())?,
                            results: convert_types(ty.results())?,
                        });
                    }
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        match import.ty {
                            TypeRef::Func(type_index) => module.imports.push(Import {
                                module: import.module.to_string(),
                                name: import.name.to_string(),
                                type_index,
                            }),
                            _ => {
                                return Err(ValidationError::UnresolvableImport {
                                    module: import.module.to_string(),
                                    name: import.name.to_string(),
                                })
                            }
                        }
                    }
                }
                Payload::FunctionSection(reader) => {
                    for type_index in reader {
                        module.functions.push(type_index?);
                    }
                }
                Payload::TableSection(reader) => {
                    for table in reader {
                        let table = table?;
                        if module.table.is_some() {
                            return Err(ValidationError::unsupported("multiple tables"));
                        }
                        if table.ty.element_type != wasmparser::RefType::FUNCREF
                            || table.ty.table64
                            || table.ty.shared
                        {
                            return Err(ValidationError::unsupported("non-funcref table"));
                        }
                        if !matches!(table.init, TableInit::RefNull) {
                            return Err(ValidationError::unsupported("table initializer expression"));
                        }
                        module.table = Some(Table {
                            initial: clamp_u32(table.ty.initial),
                            maximum: table.ty.maximum.map(clamp_u32),
                        });
                    }
                }
                Payload::MemorySection(reader) => {
                    for memory in reader {
                        let memory = memory?;
                        if module.memory.is_some() {
                            return Err(ValidationError::unsupported("multiple memories"));
                        }
                        if memory.memory64 || memory.shared || memory.page_size_log2.is_some() {
                            return Err(ValidationError::unsupported("non-MVP memory"));
                        }
                        module.memory = Some(Memory {
                            initial: clamp_u32(memory.initial),
                            maximum: memory.maximum.map(clamp_u32),
                        });
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let global = global?;
                        if global.ty.shared {
                            return Err(ValidationError::unsupported("shared global"));
                        }
                        module.globals.push(Global {
                            ty: convert_type(global.ty.content_type)?,
                            mutable: global.ty.mutable,
                            init: const_value(&global.init_expr)?,
                        });
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        let kind = match export.kind {
                            ExternalKind::Func => ExportKind::Func,
                            ExternalKind::Table => ExportKind::Table,
                            ExternalKind::Memory => ExportKind::Memory,
                            ExternalKind::Global => ExportKind::Global,
                            ExternalKind::Tag => return Err(ValidationError::unsupported("tag export")),
                        };
                        module.exports.push(Export {
                            name: export.name.to_string(),
                            kind,
                            index: export.index,
                        });
                    }
                }
                Payload::StartSection { func, .. } => module.start = Some(func),
                Payload::ElementSection(reader) => {
                    for element in reader {
                        let element = element?;
                        let offset = match element.kind {
                            ElementKind::Active { table_index, offset_expr } => {
                                if table_index.unwrap_or(0) != 0 {
                                    return Err(ValidationError::unsupported("multiple tables"));
                                }
                                const_offset(&offset_expr)?
                            }
                            _ => return Err(ValidationError::unsupported("passive element segment")),
                        };
                        let functions = match element.items {
                            ElementItems::Functions(reader) => {
                                reader.into_iter().collect::<Result<Vec<_>, _>>()?
                            }
                            ElementItems::Expressions(..) => {
                                return Err(ValidationError::unsupported("element expressions"))
                            }
                        };
                        module.elements.push(ElementSegment { offset, functions });
                    }
                }
                Payload::DataSection(reader) => {
                    for data in reader {
                        let data = data?;
                        let offset = match data.kind {
                            DataKind::Active { memory_index: 0, offset_expr } => const_offset(&offset_expr)?,
                            _ => return Err(ValidationError::unsupported("passive data segment")),
                        };
                        module.data.push(DataSegment { offset, data: data.data.to_vec() });
                    }
                }
                Payload::CodeSectionEntry(body) => bodies.push(body),
                Payload::TagSection(_) => return Err(ValidationError::unsupported("exception tags")),
                _ => {}
            }
        }

        Ok(RawModule { module, bodies })
    }

    /// Decode every function body through the allow-list
    pub(crate) fn decode_bodies(self) -> Result<Module, ValidationError> {
        let RawModule { mut module, bodies } = self;
        module.bodies.reserve(bodies.len());
        for (func_index, body) in bodies.iter().enumerate() {
            module.bodies.push(decode_body(func_index as u32, body)?);
        }
        Ok(module)
    }
}

fn decode_body(func_index: u32, body: &RawBody<'_>) -> Result<FunctionBody, ValidationError> {
    let mut locals = Vec::new();
    for local in body.get_locals_reader()? {
        let (count, ty) = local?;
        locals.push((count, convert_type(ty)?));
    }

    let mut ops = Vec::new();
    let mut reader = body.get_operators_reader()?;
    while !reader.eof() {
        let op = reader.read()?;
        ops.push(decode_op(&op).ok_or_else(|| ValidationError::DisallowedOpcode {
            name: operator_name(&op),
            func_index,
        })?);
    }
    Ok(FunctionBody { locals, ops })
}

fn operator_name(op: &Operator<'_>) -> String {
    let debug = format!("{:?}", op);
    debug
        .split(|c: char| c == ' ' || c == '{' || c == '(')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn convert_type(ty: wasmparser::ValType) -> Result<ValType, ValidationError> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        other => Err(ValidationError::unsupported(format!("value type {:?}", other))),
    }
}

fn convert_types(types: &[wasmparser::ValType]) -> Result<Vec<ValType>, ValidationError> {
    types.iter().map(|&t| convert_type(t)).collect()
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn const_value(expr: &wasmparser::ConstExpr<'_>) -> Result<ConstValue, ValidationError> {
    let mut reader = expr.get_operators_reader();
    let value = match reader.read()? {
        Operator::I32Const { value } => ConstValue::I32(value),
        Operator::I64Const { value } => ConstValue::I64(value),
        Operator::F32Const { value } => ConstValue::F32(value.bits()),
        Operator::F64Const { value } => ConstValue::F64(value.bits()),
        other => {
            return Err(ValidationError::unsupported(format!(
                "initializer {}",
                operator_name(&other)
            )))
        }
    };
    match reader.read()? {
        Operator::End => Ok(value),
        _ => Err(ValidationError::unsupported("extended constant expression")),
    }
}

fn const_offset(expr: &wasmparser::ConstExpr<'_>) -> Result<u32, ValidationError> {
    match const_value(expr)? {
        ConstValue::I32(v) => Ok(v as u32),
        _ => Err(ValidationError::Parse("segment offset is not an i32".into())),
    }
}

fn block_type(ty: wasmparser::BlockType) -> Option<BlockType> {
    match ty {
        wasmparser::BlockType::Empty => Some(BlockType::Empty),
        wasmparser::BlockType::Type(t) => convert_type(t).ok().map(BlockType::Value),
        // Multi-value blocks
        wasmparser::BlockType::FuncType(_) => None,
    }
}

fn mem(arg: wasmparser::MemArg) -> Option<MemArg> {
    if arg.memory != 0 {
        return None;
    }
    Some(MemArg { align: arg.align, offset: u32::try_from(arg.offset).ok()? })
}

/// Map one operator onto the allow-list; `None` rejects it
fn decode_op(op: &Operator<'_>) -> Option<Op> {
    use Conversion as C;
    use FloatWidth::{F32, F64};
    use IntWidth::{I32, I64};
    use Operator as O;

    let load = |access: Access, memarg: wasmparser::MemArg| mem(memarg).map(|m| Op::Load(access, m));
    let store = |access: Access, memarg: wasmparser::MemArg| mem(memarg).map(|m| Op::Store(access, m));

    Some(match *op {
        O::Unreachable => Op::Unreachable,
        O::Nop => Op::Nop,
        O::Block { blockty } => Op::Block(block_type(blockty)?),
        O::Loop { blockty } => Op::Loop(block_type(blockty)?),
        O::If { blockty } => Op::If(block_type(blockty)?),
        O::Else => Op::Else,
        O::End => Op::End,
        O::Br { relative_depth } => Op::Br(relative_depth),
        O::BrIf { relative_depth } => Op::BrIf(relative_depth),
        O::BrTable { ref targets } => {
            let list = targets.targets().collect::<Result<Vec<u32>, _>>().ok()?;
            Op::BrTable { targets: list.into_boxed_slice(), default: targets.default() }
        }
        O::Return => Op::Return,
        O::Call { function_index } => Op::Call(function_index),
        O::CallIndirect { type_index, table_index: 0 } => Op::CallIndirect(type_index),
        O::Drop => Op::Drop,
        O::Select => Op::Select,
        O::LocalGet { local_index } => Op::LocalGet(local_index),
        O::LocalSet { local_index } => Op::LocalSet(local_index),
        O::LocalTee { local_index } => Op::LocalTee(local_index),
        O::GlobalGet { global_index } => Op::GlobalGet(global_index),
        O::GlobalSet { global_index } => Op::GlobalSet(global_index),

        O::I32Load { memarg } => load(Access::full(ValType::I32), memarg)?,
        O::I64Load { memarg } => load(Access::full(ValType::I64), memarg)?,
        O::F32Load { memarg } => load(Access::full(ValType::F32), memarg)?,
        O::F64Load { memarg } => load(Access::full(ValType::F64), memarg)?,
        O::I32Load8S { memarg } => load(Access::narrow(ValType::I32, 1, true), memarg)?,
        O::I32Load8U { memarg } => load(Access::narrow(ValType::I32, 1, false), memarg)?,
        O::I32Load16S { memarg } => load(Access::narrow(ValType::I32, 2, true), memarg)?,
        O::I32Load16U { memarg } => load(Access::narrow(ValType::I32, 2, false), memarg)?,
        O::I64Load8S { memarg } => load(Access::narrow(ValType::I64, 1, true), memarg)?,
        O::I64Load8U { memarg } => load(Access::narrow(ValType::I64, 1, false), memarg)?,
        O::I64Load16S { memarg } => load(Access::narrow(ValType::I64, 2, true), memarg)?,
        O::I64Load16U { memarg } => load(Access::narrow(ValType::I64, 2, false), memarg)?,
        O::I64Load32S { memarg } => load(Access::narrow(ValType::I64, 4, true), memarg)?,
        O::I64Load32U { memarg } => load(Access::narrow(ValType::I64, 4, false), memarg)?,
        O::I32Store { memarg } => store(Access::full(ValType::I32), memarg)?,
        O::I64Store { memarg } => store(Access::full(ValType::I64), memarg)?,
        O::F32Store { memarg } => store(Access::full(ValType::F32), memarg)?,
        O::F64Store { memarg } => store(Access::full(ValType::F64), memarg)?,
        O::I32Store8 { memarg } => store(Access::narrow(ValType::I32, 1, false), memarg)?,
        O::I32Store16 { memarg } => store(Access::narrow(ValType::I32, 2, false), memarg)?,
        O::I64Store8 { memarg } => store(Access::narrow(ValType::I64, 1, false), memarg)?,
        O::I64Store16 { memarg } => store(Access::narrow(ValType::I64, 2, false), memarg)?,
        O::I64Store32 { memarg } => store(Access::narrow(ValType::I64, 4, false), memarg)?,
        O::MemorySize { mem: 0 } => Op::MemorySize,
        O::MemoryGrow { mem: 0 } => Op::MemoryGrow,

        O::I32Const { value } => Op::I32Const(value),
        O::I64Const { value } => Op::I64Const(value),
        O::F32Const { value } => Op::F32Const(value.bits()),
        O::F64Const { value } => Op::F64Const(value.bits()),

        O::I32Eqz => Op::IntUnary(I32, IntUnary::Eqz),
        O::I32Eq => Op::IntCompare(I32, IntCompare::Eq),
        O::I32Ne => Op::IntCompare(I32, IntCompare::Ne),
        O::I32LtS => Op::IntCompare(I32, IntCompare::LtS),
        O::I32LtU => Op::IntCompare(I32, IntCompare::LtU),
        O::I32GtS => Op::IntCompare(I32, IntCompare::GtS),
        O::I32GtU => Op::IntCompare(I32, IntCompare::GtU),
        O::I32LeS => Op::IntCompare(I32, IntCompare::LeS),
        O::I32LeU => Op::IntCompare(I32, IntCompare::LeU),
        O::I32GeS => Op::IntCompare(I32, IntCompare::GeS),
        O::I32GeU => Op::IntCompare(I32, IntCompare::GeU),
        O::I64Eqz => Op::IntUnary(I64, IntUnary::Eqz),
        O::I64Eq => Op::IntCompare(I64, IntCompare::Eq),
        O::I64Ne => Op::IntCompare(I64, IntCompare::Ne),
        O::I64LtS => Op::IntCompare(I64, IntCompare::LtS),
        O::I64LtU => Op::IntCompare(I64, IntCompare::LtU),
        O::I64GtS => Op::IntCompare(I64, IntCompare::GtS),
        O::I64GtU => Op::IntCompare(I64, IntCompare::GtU),
        O::I64LeS => Op::IntCompare(I64, IntCompare::LeS),
        O::I64LeU => Op::IntCompare(I64, IntCompare::LeU),
        O::I64GeS => Op::IntCompare(I64, IntCompare::GeS),
        O::I64GeU => Op::IntCompare(I64, IntCompare::GeU),
        O::F32Eq => Op::FloatCompare(F32, FloatCompare::Eq),
        O::F32Ne => Op::FloatCompare(F32, FloatCompare::Ne),
        O::F32Lt => Op::FloatCompare(F32, FloatCompare::Lt),
        O::F32Gt => Op::FloatCompare(F32, FloatCompare::Gt),
        O::F32Le => Op::FloatCompare(F32, FloatCompare::Le),
        O::F32Ge => Op::FloatCompare(F32, FloatCompare::Ge),
        O::F64Eq => Op::FloatCompare(F64, FloatCompare::Eq),
        O::F64Ne => Op::FloatCompare(F64, FloatCompare::Ne),
        O::F64Lt => Op::FloatCompare(F64, FloatCompare::Lt),
        O::F64Gt => Op::FloatCompare(F64, FloatCompare::Gt),
        O::F64Le => Op::FloatCompare(F64, FloatCompare::Le),
        O::F64Ge => Op::FloatCompare(F64, FloatCompare::Ge),

        O::I32Clz => Op::IntUnary(I32, IntUnary::Clz),
        O::I32Ctz => Op::IntUnary(I32, IntUnary::Ctz),
        O::I32Popcnt => Op::IntUnary(I32, IntUnary::Popcnt),
        O::I32Add => Op::IntBinary(I32, IntBinary::Add),
        O::I32Sub => Op::IntBinary(I32, IntBinary::Sub),
        O::I32Mul => Op::IntBinary(I32, IntBinary::Mul),
        O::I32DivS => Op::IntBinary(I32, IntBinary::DivS),
        O::I32DivU => Op::IntBinary(I32, IntBinary::DivU),
        O::I32RemS => Op::IntBinary(I32, IntBinary::RemS),
        O::I32RemU => Op::IntBinary(I32, IntBinary::RemU),
        O::I32And => Op::IntBinary(I32, IntBinary::And),
        O::I32Or => Op::IntBinary(I32, IntBinary::Or),
        O::I32Xor => Op::IntBinary(I32, IntBinary::Xor),
        O::I32Shl => Op::IntBinary(I32, IntBinary::Shl),
        O::I32ShrS => Op::IntBinary(I32, IntBinary::ShrS),
        O::I32ShrU => Op::IntBinary(I32, IntBinary::ShrU),
        O::I32Rotl => Op::IntBinary(I32, IntBinary::Rotl),
        O::I32Rotr => Op::IntBinary(I32, IntBinary::Rotr),
        O::I64Clz => Op::IntUnary(I64, IntUnary::Clz),
        O::I64Ctz => Op::IntUnary(I64, IntUnary::Ctz),
        O::I64Popcnt => Op::IntUnary(I64, IntUnary::Popcnt),
        O::I64Add => Op::IntBinary(I64, IntBinary::Add),
        O::I64Sub => Op::IntBinary(I64, IntBinary::Sub),
        O::I64Mul => Op::IntBinary(I64, IntBinary::Mul),
        O::I64DivS => Op::IntBinary(I64, IntBinary::DivS),
        O::I64DivU => Op::IntBinary(I64, IntBinary::DivU),
        O::I64RemS => Op::IntBinary(I64, IntBinary::RemS),
        O::I64RemU => Op::IntBinary(I64, IntBinary::RemU),
        O::I64And => Op::IntBinary(I64, IntBinary::And),
        O::I64Or => Op::IntBinary(I64, IntBinary::Or),
        O::I64Xor => Op::IntBinary(I64, IntBinary::Xor),
        O::I64Shl => Op::IntBinary(I64, IntBinary::Shl),
        O::I64ShrS => Op::IntBinary(I64, IntBinary::ShrS),
        O::I64ShrU => Op::IntBinary(I64, IntBinary::ShrU),
        O::I64Rotl => Op::IntBinary(I64, IntBinary::Rotl),
        O::I64Rotr => Op::IntBinary(I64, IntBinary::Rotr),

        O::F32Abs => Op::FloatUnary(F32, FloatUnary::Abs),
        O::F32Neg => Op::FloatUnary(F32, FloatUnary::Neg),
        O::F32Ceil => Op::FloatUnary(F32, FloatUnary::Ceil),
        O::F32Floor => Op::FloatUnary(F32, FloatUnary::Floor),
        O::F32Trunc => Op::FloatUnary(F32, FloatUnary::Trunc),
        O::F32Nearest => Op::FloatUnary(F32, FloatUnary::Nearest),
        O::F32Sqrt => Op::FloatUnary(F32, FloatUnary::Sqrt),
        O::F32Add => Op::FloatBinary(F32, FloatBinary::Add),
        O::F32Sub => Op::FloatBinary(F32, FloatBinary::Sub),
        O::F32Mul => Op::FloatBinary(F32, FloatBinary::Mul),
        O::F32Div => Op::FloatBinary(F32, FloatBinary::Div),
        O::F32Min => Op::FloatBinary(F32, FloatBinary::Min),
        O::F32Max => Op::FloatBinary(F32, FloatBinary::Max),
        O::F32Copysign => Op::FloatBinary(F32, FloatBinary::Copysign),
        O::F64Abs => Op::FloatUnary(F64, FloatUnary::Abs),
        O::F64Neg => Op::FloatUnary(F64, FloatUnary::Neg),
        O::F64Ceil => Op::FloatUnary(F64, FloatUnary::Ceil),
        O::F64Floor => Op::FloatUnary(F64, FloatUnary::Floor),
        O::F64Trunc => Op::FloatUnary(F64, FloatUnary::Trunc),
        O::F64Nearest => Op::FloatUnary(F64, FloatUnary::Nearest),
        O::F64Sqrt => Op::FloatUnary(F64, FloatUnary::Sqrt),
        O::F64Add => Op::FloatBinary(F64, FloatBinary::Add),
        O::F64Sub => Op::FloatBinary(F64, FloatBinary::Sub),
        O::F64Mul => Op::FloatBinary(F64, FloatBinary::Mul),
        O::F64Div => Op::FloatBinary(F64, FloatBinary::Div),
        O::F64Min => Op::FloatBinary(F64, FloatBinary::Min),
        O::F64Max => Op::FloatBinary(F64, FloatBinary::Max),
        O::F64Copysign => Op::FloatBinary(F64, FloatBinary::Copysign),

        O::I32WrapI64 => Op::Convert(C::I32WrapI64),
        O::I32TruncF32S => Op::Convert(C::Trunc { to: I32, from: F32, signed: true }),
        O::I32TruncF32U => Op::Convert(C::Trunc { to: I32, from: F32, signed: false }),
        O::I32TruncF64S => Op::Convert(C::Trunc { to: I32, from: F64, signed: true }),
        O::I32TruncF64U => Op::Convert(C::Trunc { to: I32, from: F64, signed: false }),
        O::I64ExtendI32S => Op::Convert(C::I64ExtendI32S),
        O::I64ExtendI32U => Op::Convert(C::I64ExtendI32U),
        O::I64TruncF32S => Op::Convert(C::Trunc { to: I64, from: F32, signed: true }),
        O::I64TruncF32U => Op::Convert(C::Trunc { to: I64, from: F32, signed: false }),
        O::I64TruncF64S => Op::Convert(C::Trunc { to: I64, from: F64, signed: true }),
        O::I64TruncF64U => Op::Convert(C::Trunc { to: I64, from: F64, signed: false }),
        O::F32ConvertI32S => Op::Convert(C::Convert { to: F32, from: I32, signed: true }),
        O::F32ConvertI32U => Op::Convert(C::Convert { to: F32, from: I32, signed: false }),
        O::F32ConvertI64S => Op::Convert(C::Convert { to: F32, from: I64, signed: true }),
        O::F32ConvertI64U => Op::Convert(C::Convert { to: F32, from: I64, signed: false }),
        O::F32DemoteF64 => Op::Convert(C::F32DemoteF64),
        O::F64ConvertI32S => Op::Convert(C::Convert { to: F64, from: I32, signed: true }),
        O::F64ConvertI32U => Op::Convert(C::Convert { to: F64, from: I32, signed: false }),
        O::F64ConvertI64S => Op::Convert(C::Convert { to: F64, from: I64, signed: true }),
        O::F64ConvertI64U => Op::Convert(C::Convert { to: F64, from: I64, signed: false }),
        O::F64PromoteF32 => Op::Convert(C::F64PromoteF32),
        O::I32ReinterpretF32 => Op::Convert(C::I32ReinterpretF32),
        O::I64ReinterpretF64 => Op::Convert(C::I64ReinterpretF64),
        O::F32ReinterpretI32 => Op::Convert(C::F32ReinterpretI32),
        O::F64ReinterpretI64 => Op::Convert(C::F64ReinterpretI64),

        O::I32Extend8S => Op::IntUnary(I32, IntUnary::Extend8S),
        O::I32Extend16S => Op::IntUnary(I32, IntUnary::Extend16S),
        O::I64Extend8S => Op::IntUnary(I64, IntUnary::Extend8S),
        O::I64Extend16S => Op::IntUnary(I64, IntUnary::Extend16S),
        O::I64Extend32S => Op::IntUnary(I64, IntUnary::Extend32S),

        _ => return None,
    })
}
