//! The closed operator set
//!
//! `Op` is the allow-list: an operator the decoder cannot map to a variant
//! is rejected. Numeric operators are grouped by shape so passes can treat
//! whole families at once.

use super::module::ValType;

/// Block signature (MVP: no params, at most one result)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// `[] -> []`
    Empty,
    /// `[] -> [t]`
    Value(ValType),
}

impl BlockType {
    /// Result type, if any
    pub fn result(self) -> Option<ValType> {
        match self {
            BlockType::Empty => None,
            BlockType::Value(ty) => Some(ty),
        }
    }
}

/// Integer operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    /// i32
    I32,
    /// i64
    I64,
}

impl IntWidth {
    /// Matching value type
    pub fn ty(self) -> ValType {
        match self {
            IntWidth::I32 => ValType::I32,
            IntWidth::I64 => ValType::I64,
        }
    }
}

/// Float operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatWidth {
    /// f32
    F32,
    /// f64
    F64,
}

impl FloatWidth {
    /// Matching value type
    pub fn ty(self) -> ValType {
        match self {
            FloatWidth::F32 => ValType::F32,
            FloatWidth::F64 => ValType::F64,
        }
    }
}

/// Single-operand integer operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum IntUnary {
    Clz,
    Ctz,
    Popcnt,
    /// Produces an i32 regardless of width
    Eqz,
    Extend8S,
    Extend16S,
    /// i64 only
    Extend32S,
}

/// Two-operand integer operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum IntBinary {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

/// Integer comparisons, producing an i32
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum IntCompare {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

/// Single-operand float operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FloatUnary {
    Abs,
    Neg,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Sqrt,
}

/// Two-operand float operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FloatBinary {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Copysign,
}

/// Float comparisons, producing an i32
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FloatCompare {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Type conversions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Conversion {
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
    /// Trapping float-to-int truncation
    Trunc { to: IntWidth, from: FloatWidth, signed: bool },
    /// Int-to-float conversion
    Convert { to: FloatWidth, from: IntWidth, signed: bool },
    F32DemoteF64,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
}

impl Conversion {
    /// `(operand, result)` types
    pub fn types(self) -> (ValType, ValType) {
        use ValType::*;
        match self {
            Conversion::I32WrapI64 => (I64, I32),
            Conversion::I64ExtendI32S | Conversion::I64ExtendI32U => (I32, I64),
            Conversion::Trunc { to, from, .. } => (from.ty(), to.ty()),
            Conversion::Convert { to, from, .. } => (from.ty(), to.ty()),
            Conversion::F32DemoteF64 => (F64, F32),
            Conversion::F64PromoteF32 => (F32, F64),
            Conversion::I32ReinterpretF32 => (F32, I32),
            Conversion::I64ReinterpretF64 => (F64, I64),
            Conversion::F32ReinterpretI32 => (I32, F32),
            Conversion::F64ReinterpretI64 => (I64, F64),
        }
    }
}

/// Memory immediate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    /// Alignment hint, log2
    pub align: u8,
    /// Static offset added to the dynamic address
    pub offset: u32,
}

/// Shape of a load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    /// Value type on the operand stack
    pub ty: ValType,
    /// Bytes touched in memory
    pub bytes: u8,
    /// Sign-extend narrow loads
    pub signed: bool,
}

impl Access {
    /// Full-width access of `ty`
    pub const fn full(ty: ValType) -> Self {
        let bytes = match ty {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
        };
        Access { ty, bytes, signed: false }
    }

    /// Narrow integer access
    pub const fn narrow(ty: ValType, bytes: u8, signed: bool) -> Self {
        Access { ty, bytes, signed }
    }
}

/// An allowed operator
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Op {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Box<[u32]>, default: u32 },
    Return,
    Call(u32),
    /// Operand is the signature's type index
    CallIndirect(u32),
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load(Access, MemArg),
    Store(Access, MemArg),
    MemorySize,
    MemoryGrow,
    I32Const(i32),
    I64Const(i64),
    /// Raw bits
    F32Const(u32),
    /// Raw bits
    F64Const(u64),
    IntUnary(IntWidth, IntUnary),
    IntBinary(IntWidth, IntBinary),
    IntCompare(IntWidth, IntCompare),
    FloatUnary(FloatWidth, FloatUnary),
    FloatBinary(FloatWidth, FloatBinary),
    FloatCompare(FloatWidth, FloatCompare),
    Convert(Conversion),
}

impl Op {
    /// Whether a new basic block starts after this operator
    pub fn ends_basic_block(&self) -> bool {
        matches!(
            self,
            Op::Block(_)
                | Op::Loop(_)
                | Op::If(_)
                | Op::Else
                | Op::End
                | Op::Br(_)
                | Op::BrIf(_)
                | Op::BrTable { .. }
                | Op::Return
                | Op::Unreachable
        )
    }

    /// Whether this operator opens a control frame
    pub fn opens_frame(&self) -> bool {
        matches!(self, Op::Block(_) | Op::Loop(_) | Op::If(_))
    }
}

/// A pass over a function body, one operator at a time
pub trait OpVisitor {
    /// Failure type of the pass
    type Error;

    /// Handle one operator
    fn visit(&mut self, op: &Op) -> Result<(), Self::Error>;
}

/// Drive `visitor` over `ops` in order, stopping at the first error
pub fn walk<V: OpVisitor + ?Sized>(ops: &[Op], visitor: &mut V) -> Result<(), V::Error> {
    for op in ops {
        visitor.visit(op)?;
    }
    Ok(())
}
