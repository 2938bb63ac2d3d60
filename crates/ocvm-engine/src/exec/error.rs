//! Execution errors

use std::fmt;

use thiserror::Error;

use super::apply::HostError;

/// Why generated code stopped abnormally
///
/// The discriminant is the value stored in the control block's trap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrapCode {
    /// `unreachable` executed
    Unreachable = 1,
    /// Integer division by zero or overflow
    Arithmetic = 2,
    /// `call_indirect` signature mismatch or null slot
    IndirectCallMismatch = 3,
    /// `call_indirect` index beyond the table
    IndirectCallOutOfBounds = 4,
    /// Call depth or native stack exhausted
    CallDepthExceeded = 5,
    /// Linear-memory access out of bounds
    MemoryOutOfBounds = 6,
    /// Float-to-int truncation of NaN or an out-of-range value
    InvalidConversion = 7,
    /// Instruction budget exhausted
    Metering = 8,
    /// Wall-clock deadline passed
    DeadlineExceeded = 9,
}

impl TrapCode {
    /// Decode a trap-slot value
    pub fn from_slot(slot: u32) -> Option<TrapCode> {
        use TrapCode::*;
        Some(match slot {
            1 => Unreachable,
            2 => Arithmetic,
            3 => IndirectCallMismatch,
            4 => IndirectCallOutOfBounds,
            5 => CallDepthExceeded,
            6 => MemoryOutOfBounds,
            7 => InvalidConversion,
            8 => Metering,
            9 => DeadlineExceeded,
            _ => return None,
        })
    }

    /// Value stored in the trap slot
    pub fn slot(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TrapCode::Unreachable => "unreachable executed",
            TrapCode::Arithmetic => "integer divide by zero or overflow",
            TrapCode::IndirectCallMismatch => "indirect call type mismatch",
            TrapCode::IndirectCallOutOfBounds => "indirect call index out of bounds",
            TrapCode::CallDepthExceeded => "call depth exceeded",
            TrapCode::MemoryOutOfBounds => "memory access out of bounds",
            TrapCode::InvalidConversion => "invalid float to integer conversion",
            TrapCode::Metering => "instruction budget exhausted",
            TrapCode::DeadlineExceeded => "deadline exceeded",
        };
        f.write_str(text)
    }
}

/// Failure of one `apply` execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    /// Generated code trapped
    #[error("Wasm trap: {0}")]
    Trap(TrapCode),

    /// A host function reported a failure
    #[error("Host function failed: {0}")]
    Host(#[from] HostError),

    /// An intrinsic panicked; the panic was contained
    #[error("Intrinsic panicked: {0}")]
    Panic(String),

    /// The descriptor does not fit the code or this executor
    #[error("Invalid code descriptor: {0}")]
    InvalidDescriptor(String),

    /// Reserving memory or starting the watchdog failed
    #[error("Resource error: {0}")]
    Resource(String),
}

impl From<TrapCode> for ExecutionError {
    fn from(code: TrapCode) -> Self {
        ExecutionError::Trap(code)
    }
}
