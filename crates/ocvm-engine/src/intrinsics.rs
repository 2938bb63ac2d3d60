//! Intrinsic table definition
//!
//! Compiled code reaches host functionality by ordinal through a table
//! stored at a fixed negative offset from `vmctx`. The ordinal is the enum
//! discriminant; adding, removing or reordering entries requires bumping
//! `INTRINSIC_TABLE_VERSION`, which feeds the codegen version.
//!
//! Ordinals below `FIRST_HOST` are internal (traps, metering, memory
//! growth, float helpers) and cannot be imported by contracts, except
//! `checktime`, which only the metering injector imports.

use crate::wasm::{FuncType, ValType};

/// Version of the ordinal layout
pub const INTRINSIC_TABLE_VERSION: u8 = 1;

/// Import module of host functions
pub const HOST_MODULE: &str = "env";

/// Import module of the injected metering call
pub const INJECTION_MODULE: &str = "ocvm_injection";

/// One entry in the intrinsic table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Intrinsic {
    // Traps
    TrapUnreachable = 0,
    TrapInteger = 1,
    TrapIndirectMismatch = 2,
    TrapIndirectOutOfBounds = 3,
    TrapCallDepth = 4,
    TrapMemoryOutOfBounds = 5,

    // Metering and memory
    Checktime = 6,
    GrowMemory = 7,

    // Float truncation
    I32TruncF32S = 8,
    I32TruncF32U = 9,
    I32TruncF64S = 10,
    I32TruncF64U = 11,
    I64TruncF32S = 12,
    I64TruncF32U = 13,
    I64TruncF64S = 14,
    I64TruncF64U = 15,

    // Float rounding
    F32Ceil = 16,
    F32Floor = 17,
    F32Trunc = 18,
    F32Nearest = 19,
    F64Ceil = 20,
    F64Floor = 21,
    F64Trunc = 22,
    F64Nearest = 23,

    // Host functions
    ActionDataSize = 24,
    ReadActionData = 25,
    CurrentReceiver = 26,
    RequireAuth = 27,
    HasAuth = 28,
    IsAccount = 29,
    CurrentTime = 30,
    DbStoreI64 = 31,
    DbFindI64 = 32,
    DbGetI64 = 33,
    DbUpdateI64 = 34,
    DbRemoveI64 = 35,
    Sha256 = 36,
    AssertSha256 = 37,
    Prints = 38,
    PrintsL = 39,
    Printi = 40,
    Printui = 41,
    Printhex = 42,
    Check = 43,
    CheckMessage = 44,
    Abort = 45,
    Exit = 46,
    Memcpy = 47,
    Memmove = 48,
    Memset = 49,
    Memcmp = 50,
}

/// Number of table slots
pub const INTRINSIC_COUNT: usize = 51;

/// First ordinal contracts may import
pub const FIRST_HOST: u32 = Intrinsic::ActionDataSize as u32;

impl Intrinsic {
    /// Every intrinsic in ordinal order
    pub const ALL: [Intrinsic; INTRINSIC_COUNT] = [
        Intrinsic::TrapUnreachable,
        Intrinsic::TrapInteger,
        Intrinsic::TrapIndirectMismatch,
        Intrinsic::TrapIndirectOutOfBounds,
        Intrinsic::TrapCallDepth,
        Intrinsic::TrapMemoryOutOfBounds,
        Intrinsic::Checktime,
        Intrinsic::GrowMemory,
        Intrinsic::I32TruncF32S,
        Intrinsic::I32TruncF32U,
        Intrinsic::I32TruncF64S,
        Intrinsic::I32TruncF64U,
        Intrinsic::I64TruncF32S,
        Intrinsic::I64TruncF32U,
        Intrinsic::I64TruncF64S,
        Intrinsic::I64TruncF64U,
        Intrinsic::F32Ceil,
        Intrinsic::F32Floor,
        Intrinsic::F32Trunc,
        Intrinsic::F32Nearest,
        Intrinsic::F64Ceil,
        Intrinsic::F64Floor,
        Intrinsic::F64Trunc,
        Intrinsic::F64Nearest,
        Intrinsic::ActionDataSize,
        Intrinsic::ReadActionData,
        Intrinsic::CurrentReceiver,
        Intrinsic::RequireAuth,
        Intrinsic::HasAuth,
        Intrinsic::IsAccount,
        Intrinsic::CurrentTime,
        Intrinsic::DbStoreI64,
        Intrinsic::DbFindI64,
        Intrinsic::DbGetI64,
        Intrinsic::DbUpdateI64,
        Intrinsic::DbRemoveI64,
        Intrinsic::Sha256,
        Intrinsic::AssertSha256,
        Intrinsic::Prints,
        Intrinsic::PrintsL,
        Intrinsic::Printi,
        Intrinsic::Printui,
        Intrinsic::Printhex,
        Intrinsic::Check,
        Intrinsic::CheckMessage,
        Intrinsic::Abort,
        Intrinsic::Exit,
        Intrinsic::Memcpy,
        Intrinsic::Memmove,
        Intrinsic::Memset,
        Intrinsic::Memcmp,
    ];

    /// Table slot of this intrinsic
    pub fn ordinal(self) -> u32 {
        self as u32
    }

    /// Intrinsic at `ordinal`
    pub fn from_ordinal(ordinal: u32) -> Option<Intrinsic> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Import name
    pub fn name(self) -> &'static str {
        use Intrinsic::*;
        match self {
            TrapUnreachable => "trap_unreachable",
            TrapInteger => "trap_integer",
            TrapIndirectMismatch => "trap_indirect_mismatch",
            TrapIndirectOutOfBounds => "trap_indirect_out_of_bounds",
            TrapCallDepth => "trap_call_depth",
            TrapMemoryOutOfBounds => "trap_memory_out_of_bounds",
            Checktime => "checktime",
            GrowMemory => "grow_memory",
            I32TruncF32S => "i32_trunc_f32_s",
            I32TruncF32U => "i32_trunc_f32_u",
            I32TruncF64S => "i32_trunc_f64_s",
            I32TruncF64U => "i32_trunc_f64_u",
            I64TruncF32S => "i64_trunc_f32_s",
            I64TruncF32U => "i64_trunc_f32_u",
            I64TruncF64S => "i64_trunc_f64_s",
            I64TruncF64U => "i64_trunc_f64_u",
            F32Ceil => "f32_ceil",
            F32Floor => "f32_floor",
            F32Trunc => "f32_trunc",
            F32Nearest => "f32_nearest",
            F64Ceil => "f64_ceil",
            F64Floor => "f64_floor",
            F64Trunc => "f64_trunc",
            F64Nearest => "f64_nearest",
            ActionDataSize => "action_data_size",
            ReadActionData => "read_action_data",
            CurrentReceiver => "current_receiver",
            RequireAuth => "require_auth",
            HasAuth => "has_auth",
            IsAccount => "is_account",
            CurrentTime => "current_time",
            DbStoreI64 => "db_store_i64",
            DbFindI64 => "db_find_i64",
            DbGetI64 => "db_get_i64",
            DbUpdateI64 => "db_update_i64",
            DbRemoveI64 => "db_remove_i64",
            Sha256 => "sha256",
            AssertSha256 => "assert_sha256",
            Prints => "prints",
            PrintsL => "prints_l",
            Printi => "printi",
            Printui => "printui",
            Printhex => "printhex",
            Check => "check",
            CheckMessage => "check_message",
            Abort => "abort",
            Exit => "exit",
            Memcpy => "memcpy",
            Memmove => "memmove",
            Memset => "memset",
            Memcmp => "memcmp",
        }
    }

    /// Wasm-level signature, excluding the leading `vmctx`
    pub fn signature(self) -> FuncType {
        use Intrinsic::*;
        use ValType::{F32, F64, I32, I64};
        let (params, results): (&[ValType], &[ValType]) = match self {
            TrapUnreachable | TrapInteger | TrapIndirectMismatch | TrapIndirectOutOfBounds
            | TrapCallDepth | TrapMemoryOutOfBounds => (&[], &[]),
            Checktime => (&[I32], &[]),
            GrowMemory => (&[I32], &[I32]),
            I32TruncF32S | I32TruncF32U => (&[F32], &[I32]),
            I32TruncF64S | I32TruncF64U => (&[F64], &[I32]),
            I64TruncF32S | I64TruncF32U => (&[F32], &[I64]),
            I64TruncF64S | I64TruncF64U => (&[F64], &[I64]),
            F32Ceil | F32Floor | F32Trunc | F32Nearest => (&[F32], &[F32]),
            F64Ceil | F64Floor | F64Trunc | F64Nearest => (&[F64], &[F64]),
            ActionDataSize => (&[], &[I32]),
            ReadActionData => (&[I32, I32], &[I32]),
            CurrentReceiver => (&[], &[I64]),
            RequireAuth => (&[I64], &[]),
            HasAuth | IsAccount => (&[I64], &[I32]),
            CurrentTime => (&[], &[I64]),
            DbStoreI64 => (&[I64, I64, I64, I64, I32, I32], &[I32]),
            DbFindI64 => (&[I64, I64, I64, I64], &[I32]),
            DbGetI64 => (&[I32, I32, I32], &[I32]),
            DbUpdateI64 => (&[I32, I64, I32, I32], &[]),
            DbRemoveI64 => (&[I32], &[]),
            Sha256 | AssertSha256 => (&[I32, I32, I32], &[]),
            Prints => (&[I32], &[]),
            PrintsL | Printhex => (&[I32, I32], &[]),
            Printi | Printui => (&[I64], &[]),
            Check => (&[I32, I32], &[]),
            CheckMessage => (&[I32, I32, I32], &[]),
            Abort => (&[], &[]),
            Exit => (&[I32], &[]),
            Memcpy | Memmove | Memset => (&[I32, I32, I32], &[I32]),
            Memcmp => (&[I32, I32, I32], &[I32]),
        };
        FuncType::new(params, results)
    }

    /// Whether contracts may import this intrinsic from `env`
    pub fn is_host_function(self) -> bool {
        self.ordinal() >= FIRST_HOST
    }

    /// Whether the call can leave a trap or exit code in the control block
    pub fn may_trap(self) -> bool {
        !matches!(
            self,
            Intrinsic::GrowMemory
                | Intrinsic::F32Ceil
                | Intrinsic::F32Floor
                | Intrinsic::F32Trunc
                | Intrinsic::F32Nearest
                | Intrinsic::F64Ceil
                | Intrinsic::F64Floor
                | Intrinsic::F64Trunc
                | Intrinsic::F64Nearest
                | Intrinsic::ActionDataSize
                | Intrinsic::CurrentReceiver
                | Intrinsic::CurrentTime
        )
    }

    /// Resolve an import by module, name and exact signature
    pub fn resolve_import(module: &str, name: &str, ty: &FuncType) -> Option<Intrinsic> {
        let found = match module {
            HOST_MODULE => Self::ALL
                .iter()
                .copied()
                .filter(|i| i.is_host_function())
                .find(|i| i.name() == name)?,
            INJECTION_MODULE if name == Intrinsic::Checktime.name() => Intrinsic::Checktime,
            _ => return None,
        };
        (found.signature() == *ty).then_some(found)
    }
}
