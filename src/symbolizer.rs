use std::borrow::Cow;
use std::fs;
use std::path::Path;

use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use tracing::debug;

const PAGE_SIZE: u64 = 4096;

/// A named range inside a module, relative to the module's first mapped byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub start: u64,
    pub size: u64,
    pub name: String,
}

impl Symbol {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

/// Offset to symbol lookup over one module.
pub trait SymbolLookup {
    fn lookup(&self, offset: u64) -> Option<&Symbol>;
}

/// Loads the symbol table of a module from its backing file.
///
/// `None` means no symbols are available for that file, which is not an error.
pub trait SymbolLoader {
    type Table: SymbolLookup;

    fn load(&self, path: &Path) -> Option<Self::Table>;
}

/// Symbols of one module, sorted by start offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by(|a, b| a.start.cmp(&b.start).then(b.size.cmp(&a.size)));
        symbols.dedup_by_key(|s| s.start);
        Self { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// The symbol with the greatest start not above `offset`.
    pub fn find(&self, offset: u64) -> Option<&Symbol> {
        let idx = self.symbols.partition_point(|s| s.start <= offset);
        idx.checked_sub(1).map(|i| &self.symbols[i])
    }
}

impl SymbolLookup for SymbolTable {
    fn lookup(&self, offset: u64) -> Option<&Symbol> {
        self.find(offset)
    }
}

/// Reads function symbols out of ELF files with the `object` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfSymbolLoader;

impl SymbolLoader for ElfSymbolLoader {
    type Table = SymbolTable;

    fn load(&self, path: &Path) -> Option<SymbolTable> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) => {
                debug!("no symbols for {}: {err}", path.display());
                return None;
            }
        };
        let file = match object::File::parse(data.as_slice()) {
            Ok(file) => file,
            Err(err) => {
                debug!("failed to parse {}: {err}", path.display());
                return None;
            }
        };

        // Offsets are taken from the first mapped byte, i.e. the lowest PT_LOAD page.
        let base = file.segments().map(|s| s.address()).min().unwrap_or(0) & !(PAGE_SIZE - 1);

        let symbols: Vec<Symbol> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition())
            .filter_map(|sym| {
                let name = sym.name().ok().filter(|n| !n.is_empty())?;
                let start = sym.address().checked_sub(base)?;
                Some(Symbol {
                    start,
                    size: sym.size(),
                    name: addr2line::demangle_auto(Cow::Borrowed(name), None).into_owned(),
                })
            })
            .collect();

        if symbols.is_empty() {
            debug!("{} has no function symbols", path.display());
            return None;
        }
        let table = SymbolTable::new(symbols);
        debug!("loaded {} symbols from {}", table.len(), path.display());
        Some(table)
    }
}
