//! Compiled-artifact metadata
//!
//! A `CompiledModule` is what the compiler hands to the code cache: a code
//! blob plus the `ModuleMeta` needed to run it. Once the cache places the
//! blob in its arena it records a `CodeDescriptor`, the location-aware form
//! the executor consumes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 digest identifying a piece of bytecode
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Hash raw bytecode
    pub fn of(bytes: &[u8]) -> Self {
        ContentHash(Sha256::digest(bytes).into())
    }

    /// Hex rendering, used in logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Cache key: bytecode hash plus the VM generation it was compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeTuple {
    /// Digest of the bytecode
    pub code_hash: ContentHash,
    /// Execution-engine generation tag
    pub vm_version: u8,
}

impl CodeTuple {
    /// Create a tuple
    pub fn new(code_hash: ContentHash, vm_version: u8) -> Self {
        CodeTuple { code_hash, vm_version }
    }
}

impl fmt::Display for CodeTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", &self.code_hash.to_hex()[..16], self.vm_version)
    }
}

/// How to run the module's start function, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFunction {
    /// No start function
    None,
    /// Start function is an imported intrinsic
    Intrinsic(u32),
    /// Start function is compiled code at this blob offset
    CodeOffset(u64),
}

/// Initial state copied into place before every execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    /// Raw bits of each mutable global, in slot order
    pub globals: Vec<u64>,
    /// `(offset, bytes)` written into fresh linear memory
    pub segments: Vec<(u32, Vec<u8>)>,
}

/// Layout metadata produced alongside a code blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMeta {
    /// Generated-code ABI version
    pub codegen_version: u8,
    /// Blob offset of the exported `apply` function
    pub apply_offset: u64,
    /// Start function dispatch
    pub start: StartFunction,
    /// Linear memory pages at entry
    pub starting_memory_pages: u32,
    /// Pages `grow_memory` may reach
    pub max_memory_pages: u32,
    /// Blob offset of the indirect-call table
    pub table_offset: u64,
    /// Slots in the indirect-call table
    pub table_len: u32,
    /// Blob offset of each defined function, by defined-function index
    pub function_offsets: Vec<u64>,
    /// Mutable globals and initial memory
    pub init_data: InitData,
}

/// Compiler output before placement in the cache
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// Position-independent machine code blob
    pub code: Vec<u8>,
    /// Layout metadata
    pub meta: ModuleMeta,
}

impl CompiledModule {
    /// Descriptor for this blob once placed at `code_begin`
    pub fn descriptor_at(&self, code_hash: ContentHash, vm_version: u8, code_begin: u64) -> CodeDescriptor {
        CodeDescriptor {
            code_hash,
            vm_version,
            code_begin,
            code_size: self.code.len() as u64,
            meta: self.meta.clone(),
        }
    }
}

/// A compiled artifact resident in the code cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeDescriptor {
    /// Bytecode hash
    pub code_hash: ContentHash,
    /// VM generation
    pub vm_version: u8,
    /// Arena offset of the code blob
    pub code_begin: u64,
    /// Length of the code blob
    pub code_size: u64,
    /// Layout metadata, offsets relative to `code_begin`
    pub meta: ModuleMeta,
}

impl CodeDescriptor {
    /// Cache key of this descriptor
    pub fn tuple(&self) -> CodeTuple {
        CodeTuple::new(self.code_hash, self.vm_version)
    }

    /// Generated-code ABI version
    pub fn codegen_version(&self) -> u8 {
        self.meta.codegen_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256() {
        let hash = ContentHash::of(b"abc");
        assert_eq!(
            hash.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_tuple_ordering_follows_hash_then_version() {
        let h = ContentHash::of(b"x");
        let a = CodeTuple::new(h, 1);
        let b = CodeTuple::new(h, 2);
        assert!(a < b);
        assert_ne!(a, b);
    }
}
