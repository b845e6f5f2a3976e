//! Resolve instruction addresses of a traced process into module and symbol
//! information for crash and backtrace reports.

pub mod context;
pub mod maps;
pub mod memory;
pub mod symbolizer;

pub use context::{ContextError, Module, PtraceContext, Resolution, MODULE_SIGNATURE};
pub use maps::{Mapping, MappingSource, MapsError, ProcMaps};
pub use memory::{INVALID_WORD, LocalMemory, MemoryAccessor, MemoryError, PtraceMemory, WordReader};
pub use symbolizer::{ElfSymbolLoader, Symbol, SymbolLoader, SymbolLookup, SymbolTable};
