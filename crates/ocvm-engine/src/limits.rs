//! Resource ceilings
//!
//! `WasmLimits` are the static constraints a module must satisfy before it
//! is compiled. `ExecutionLimits` bound a single `apply` invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wasm::WASM_PAGE_SIZE;

/// Static constraints checked by the validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmLimits {
    /// Largest linear memory a module may reach, in bytes
    pub max_linear_memory: u64,
    /// Window that data segments must fall within, in bytes
    pub max_linear_memory_init: u64,
    /// Largest indirect-call table, in elements
    pub max_table_elements: u32,
    /// Total storage of mutable globals, in bytes
    pub max_mutable_global_bytes: u32,
    /// Largest element count of any one section
    pub max_section_elements: u32,
    /// Params plus locals of one function, in bytes
    pub max_func_local_bytes: u32,
    /// Largest accepted bytecode, in bytes
    pub max_code_bytes: u64,
    /// Deepest nesting of block/loop/if in one function
    pub max_nesting_depth: u32,
}

impl Default for WasmLimits {
    fn default() -> Self {
        WasmLimits {
            max_linear_memory: 33 * 1024 * 1024,
            max_linear_memory_init: 64 * 1024,
            max_table_elements: 1024,
            max_mutable_global_bytes: 1024,
            max_section_elements: 8192,
            max_func_local_bytes: 8192,
            max_code_bytes: 20 * 1024 * 1024,
            max_nesting_depth: 1024,
        }
    }
}

impl WasmLimits {
    /// Page ceiling derived from `max_linear_memory`
    pub fn max_pages(&self) -> u32 {
        (self.max_linear_memory / WASM_PAGE_SIZE) as u32
    }
}

/// Limits for one `apply` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Maximum nesting of compiled function calls
    pub call_depth: u32,
    /// Instructions the metering intrinsic allows before trapping
    pub instruction_budget: u64,
    /// Wall-clock limit, checked at metering points
    #[serde(with = "duration_ms")]
    pub deadline: Option<Duration>,
    /// Native stack the generated code may consume below the entry frame
    pub native_stack_bytes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            call_depth: 250,
            instruction_budget: 100_000_000,
            deadline: None,
            native_stack_bytes: 1024 * 1024,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
