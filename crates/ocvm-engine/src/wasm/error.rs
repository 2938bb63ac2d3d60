//! Validation errors

use thiserror::Error;

/// Static rejection of a module, raised before any code is generated
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The binary failed structural decoding or wasm validation
    #[error("Malformed wasm binary: {0}")]
    Parse(String),

    /// A construct outside the accepted module shape
    #[error("Unsupported wasm feature: {feature}")]
    Unsupported {
        /// What was found
        feature: String,
    },

    /// Initial memory exceeds the page ceiling
    #[error("Initial memory of {pages} pages exceeds the limit of {max} pages")]
    MemoryTooLarge {
        /// Declared initial pages
        pages: u32,
        /// Page ceiling
        max: u32,
    },

    /// A data segment writes outside the initial-memory window
    #[error("Data segment at offset {offset} with {len} bytes exceeds the {window}-byte initial memory window")]
    DataSegmentOutOfBounds {
        /// Segment offset
        offset: u32,
        /// Segment length
        len: usize,
        /// Bytes writable at instantiation
        window: u64,
    },

    /// Table larger than the element ceiling
    #[error("Table of {elements} elements exceeds the limit of {max}")]
    TableTooLarge {
        /// Declared initial elements
        elements: u32,
        /// Element ceiling
        max: u32,
    },

    /// An element segment writes outside the table
    #[error("Element segment at offset {offset} with {len} entries exceeds the table size {table_size}")]
    ElementSegmentOutOfBounds {
        /// Segment offset
        offset: u32,
        /// Segment entries
        len: usize,
        /// Table size
        table_size: u32,
    },

    /// Mutable globals need more storage than allowed
    #[error("Mutable globals use {bytes} bytes, limit is {max}")]
    MutableGlobalsTooLarge {
        /// Total bytes
        bytes: u32,
        /// Byte ceiling
        max: u32,
    },

    /// An operator outside the allow-list
    #[error("Disallowed opcode {name} in function {func_index}")]
    DisallowedOpcode {
        /// Operator name
        name: String,
        /// Defined-function index the opcode was found in
        func_index: u32,
    },

    /// An import no intrinsic provides
    #[error("Unresolvable import {module}.{name}")]
    UnresolvableImport {
        /// Import module
        module: String,
        /// Import field
        name: String,
    },

    /// A section holds too many entries
    #[error("Section {section} has {count} entries, limit is {max}")]
    SectionTooLarge {
        /// Section name
        section: &'static str,
        /// Entry count
        count: usize,
        /// Entry ceiling
        max: u32,
    },

    /// A function's params and locals exceed the byte ceiling
    #[error("Function {func_index} declares {bytes} bytes of locals, limit is {max}")]
    FunctionLocalsTooLarge {
        /// Defined-function index
        func_index: u32,
        /// Bytes of params plus locals
        bytes: u64,
        /// Byte ceiling
        max: u32,
    },

    /// Control structures nest too deeply
    #[error("Function {func_index} nests control structures {depth} deep, limit is {max}")]
    NestingTooDeep {
        /// Defined-function index
        func_index: u32,
        /// Depth reached
        depth: u32,
        /// Depth ceiling
        max: u32,
    },

    /// Bytecode larger than accepted
    #[error("Bytecode of {bytes} bytes exceeds the limit of {max}")]
    CodeTooLarge {
        /// Bytecode length
        bytes: u64,
        /// Byte ceiling
        max: u64,
    },

    /// No `apply(i64, i64, i64)` export
    #[error("Missing or mistyped entry point export `apply`")]
    MissingEntryPoint,
}

impl From<wasmparser::BinaryReaderError> for ValidationError {
    fn from(e: wasmparser::BinaryReaderError) -> Self {
        ValidationError::Parse(e.to_string())
    }
}

impl ValidationError {
    pub(crate) fn unsupported(feature: impl Into<String>) -> Self {
        ValidationError::Unsupported { feature: feature.into() }
    }
}
