use std::collections::TryReserveError;
use std::path::Path;

use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

use crate::maps::{Mapping, MappingSource, ProcMaps};
use crate::memory::{MemoryAccessor, PtraceMemory, WordReader};
use crate::symbolizer::{ElfSymbolLoader, Symbol, SymbolLoader, SymbolLookup, SymbolTable};

/// First word of every loadable module: the ELF magic `7f 45 4c 46`.
pub const MODULE_SIGNATURE: u32 = u32::from_ne_bytes(object::elf::ELFMAG);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("out of memory while building context for process {pid}")]
    AllocationExhausted {
        pid: Pid,
        source: TryReserveError,
    },
}

/// Data attached to a mapping detected as a loaded module.
#[derive(Debug)]
pub struct Module<T> {
    /// `None` when the mapping is anonymous or the loader found nothing.
    pub symbols: Option<T>,
}

/// Result of [`PtraceContext::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub address: u64,
    pub mapping: Option<&'a Mapping>,
    pub symbol: Option<&'a Symbol>,
}

impl Resolution<'_> {
    /// Distance from the start of the resolved symbol.
    pub fn symbol_offset(&self) -> Option<u64> {
        let mapping = self.mapping?;
        let symbol = self.symbol?;
        (self.address - mapping.start).checked_sub(symbol.start)
    }
}

/// Mappings of one traced process together with the symbol tables of the
/// modules found in them.
///
/// Built once per attach and immutable afterwards, so `resolve` can be called
/// from several threads at once.
#[derive(Debug)]
pub struct PtraceContext<T = SymbolTable> {
    pid: Pid,
    /// One slot per mapping, pointing into `modules`.
    slots: Vec<Option<usize>>,
    // Declared before `mappings` so attached tables drop first.
    modules: Vec<Module<T>>,
    mappings: Vec<Mapping>,
}

impl PtraceContext<SymbolTable> {
    /// Builds a context for a process the caller has already attached to and stopped.
    pub fn build(pid: Pid) -> Result<Self, ContextError> {
        Self::build_with(pid, &ProcMaps, &PtraceMemory::new(pid), &ElfSymbolLoader)
    }
}

impl<T: SymbolLookup> PtraceContext<T> {
    pub fn build_with<S, R, L>(
        pid: Pid,
        source: &S,
        reader: &R,
        loader: &L,
    ) -> Result<Self, ContextError>
    where
        S: MappingSource + ?Sized,
        R: WordReader + ?Sized,
        L: SymbolLoader<Table = T> + ?Sized,
    {
        let mappings = source.enumerate(pid);

        // The slot table is the context's own storage; failing here fails the build.
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(mappings.len())
            .map_err(|err| ContextError::AllocationExhausted { pid, source: err })?;
        slots.resize(mappings.len(), None);

        // The list is complete before detection, so every read sees all mappings.
        let accessor = MemoryAccessor::new(&mappings, reader);
        let mut modules = Vec::new();
        for (index, mapping) in mappings.iter().enumerate() {
            let Some(module) = detect_module(&accessor, mapping, loader) else {
                continue;
            };
            // A record that cannot be stored only costs this mapping its symbols.
            if let Err(err) = modules.try_reserve(1) {
                warn!("dropping module data for {}: {err}", mapping.pathname);
                continue;
            }
            slots[index] = Some(modules.len());
            modules.push(module);
        }

        debug!(
            "process {pid}: {} mappings, {} modules, {} with symbols",
            mappings.len(),
            modules.len(),
            modules.iter().filter(|m| m.symbols.is_some()).count()
        );

        Ok(Self {
            pid,
            slots,
            modules,
            mappings,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Module data attached to the mapping at `index`, if it was detected as one.
    pub fn module(&self, index: usize) -> Option<&Module<T>> {
        let record = (*self.slots.get(index)?)?;
        self.modules.get(record)
    }

    pub fn has_symbols(&self, index: usize) -> bool {
        self.module(index).is_some_and(|m| m.symbols.is_some())
    }

    /// Finds the mapping containing `address` and, if that mapping carries a
    /// symbol table, the symbol covering it.
    pub fn resolve(&self, address: u64) -> Resolution<'_> {
        let Some(index) = self.mappings.iter().position(|m| m.contains(address)) else {
            return Resolution { address, mapping: None, symbol: None };
        };
        let mapping = &self.mappings[index];
        let symbol = self
            .module(index)
            .and_then(|m| m.symbols.as_ref())
            .and_then(|table| table.lookup(address - mapping.start));
        Resolution { address, mapping: Some(mapping), symbol }
    }

    /// Releases every attached symbol table in mapping order, then the mappings.
    pub fn destroy(self) {
        let Self { pid, slots, modules, mappings } = self;
        let released = modules.iter().filter(|m| m.symbols.is_some()).count();
        drop(slots);
        drop(modules);
        drop(mappings);
        debug!("process {pid}: released {released} symbol tables");
    }
}

/// Attaches module data to an executable, readable mapping whose first word
/// is the module signature.
fn detect_module<R, L>(
    accessor: &MemoryAccessor<'_, R>,
    mapping: &Mapping,
    loader: &L,
) -> Option<Module<L::Table>>
where
    R: WordReader + ?Sized,
    L: SymbolLoader + ?Sized,
{
    if !(mapping.executable && mapping.readable) {
        return None;
    }
    match accessor.try_read_word(mapping.start) {
        Ok(MODULE_SIGNATURE) => {}
        Ok(_) => return None,
        Err(err) => {
            debug!("skipping mapping at 0x{:x}: {err}", mapping.start);
            return None;
        }
    }
    let symbols = if mapping.pathname.is_empty() {
        None
    } else {
        loader.load(Path::new(&mapping.pathname))
    };
    Some(Module { symbols })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::memory::tests::{mapping, FakeMemory};

    const NOT_A_MODULE: u32 = 0xdead_beef;

    fn pid() -> Pid {
        Pid::from_raw(4242)
    }

    fn sym(start: u64, name: &str) -> Symbol {
        Symbol { start, size: 0x10, name: name.to_owned() }
    }

    /// Serves fixed tables per path and records every request.
    #[derive(Default)]
    struct FakeLoader {
        tables: HashMap<String, Vec<Symbol>>,
        requested: RefCell<Vec<String>>,
        released: Arc<AtomicUsize>,
        release_order: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLoader {
        fn with(entries: &[(&str, Vec<Symbol>)]) -> Self {
            Self {
                tables: entries.iter().map(|(p, s)| (p.to_string(), s.clone())).collect(),
                ..Default::default()
            }
        }
    }

    struct CountedTable {
        path: String,
        table: SymbolTable,
        released: Arc<AtomicUsize>,
        release_order: Arc<Mutex<Vec<String>>>,
    }

    impl SymbolLookup for CountedTable {
        fn lookup(&self, offset: u64) -> Option<&Symbol> {
            self.table.find(offset)
        }
    }

    impl Drop for CountedTable {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.release_order.lock().unwrap().push(self.path.clone());
        }
    }

    impl SymbolLoader for FakeLoader {
        type Table = CountedTable;

        fn load(&self, path: &Path) -> Option<CountedTable> {
            let path = path.to_string_lossy().into_owned();
            self.requested.borrow_mut().push(path.clone());
            self.tables.get(&path).map(|symbols| CountedTable {
                path: path.clone(),
                table: SymbolTable::new(symbols.clone()),
                released: Arc::clone(&self.released),
                release_order: Arc::clone(&self.release_order),
            })
        }
    }

    fn two_library_process() -> (Vec<Mapping>, FakeMemory, FakeLoader) {
        let maps = vec![
            mapping(0x1000, 0x2000, "r-xp", "/lib/a.so"),
            mapping(0x2000, 0x3000, "r-xp", "/lib/b.so"),
        ];
        let mem = FakeMemory::with(&[(0x1000, MODULE_SIGNATURE), (0x2000, NOT_A_MODULE)]);
        let loader = FakeLoader::with(&[
            ("/lib/a.so", vec![sym(0x0, "a_init"), sym(0x40, "a_main"), sym(0x80, "a_exit")]),
            ("/lib/b.so", vec![sym(0x0, "b_main")]),
        ]);
        (maps, mem, loader)
    }

    #[test]
    fn module_signature_is_elf_magic() {
        assert_eq!(MODULE_SIGNATURE.to_ne_bytes(), *b"\x7fELF");
        #[cfg(target_endian = "little")]
        assert_eq!(MODULE_SIGNATURE, 0x464C_457f);
    }

    #[test]
    fn attaches_symbols_only_to_signed_modules() {
        let (maps, mem, loader) = two_library_process();
        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();

        assert_eq!(ctx.mappings().len(), 2);
        assert!(ctx.has_symbols(0));
        assert!(ctx.module(1).is_none());
        assert_eq!(*loader.requested.borrow(), vec!["/lib/a.so".to_owned()]);

        let hit = ctx.resolve(0x1050);
        assert_eq!(hit.mapping, Some(&maps[0]));
        assert_eq!(hit.symbol.unwrap().name, "a_main");
        assert_eq!(hit.symbol_offset(), Some(0x10));

        let exact = ctx.resolve(0x1080);
        assert_eq!(exact.symbol.unwrap().name, "a_exit");
        assert_eq!(exact.symbol_offset(), Some(0));

        let unsigned = ctx.resolve(0x2050);
        assert_eq!(unsigned.mapping, Some(&maps[1]));
        assert_eq!(unsigned.symbol, None);

        let nowhere = ctx.resolve(0x500);
        assert_eq!(nowhere.mapping, None);
        assert_eq!(nowhere.symbol, None);
        assert_eq!(nowhere.symbol_offset(), None);
    }

    #[test]
    fn skips_mappings_that_are_not_loadable_modules() {
        let maps = vec![
            mapping(0x1000, 0x2000, "r--p", "/lib/data.so"),
            mapping(0x2000, 0x3000, "--xp", "/lib/xonly.so"),
            mapping(0x3000, 0x4000, "r-xp", ""),
            mapping(0x4000, 0x5000, "rwxp", "/lib/jit"),
            mapping(0x5001, 0x6000, "r-xp", "/lib/odd.so"),
        ];
        let mem = FakeMemory::with(&[
            (0x1000, MODULE_SIGNATURE),
            (0x2000, MODULE_SIGNATURE),
            (0x3000, MODULE_SIGNATURE),
            (0x4000, NOT_A_MODULE),
        ]);
        let loader = FakeLoader::with(&[
            ("/lib/data.so", vec![sym(0, "d")]),
            ("/lib/xonly.so", vec![sym(0, "x")]),
            ("/lib/jit", vec![sym(0, "j")]),
            ("/lib/odd.so", vec![sym(0, "o")]),
        ]);

        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();

        // Anonymous module: record attached but no table requested.
        assert!(ctx.module(2).is_some_and(|m| m.symbols.is_none()));
        for index in [0, 1, 3, 4] {
            assert!(ctx.module(index).is_none(), "mapping {index}");
        }
        assert!(loader.requested.borrow().is_empty());
        assert_eq!(ctx.resolve(0x3004).symbol, None);
    }

    #[test]
    fn loader_without_symbols_leaves_record_empty() {
        let maps = vec![mapping(0x1000, 0x2000, "r-xp", "/lib/stripped.so")];
        let mem = FakeMemory::with(&[(0x1000, MODULE_SIGNATURE)]);
        let loader = FakeLoader::default();

        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();
        assert!(ctx.module(0).is_some());
        assert!(!ctx.has_symbols(0));
        assert_eq!(ctx.resolve(0x1004).mapping, Some(&maps[0]));
        assert_eq!(ctx.resolve(0x1004).symbol, None);
    }

    #[test]
    fn same_file_gets_a_table_per_mapping() {
        let maps = vec![
            mapping(0x1000, 0x2000, "r-xp", "/lib/a.so"),
            mapping(0x8000, 0x9000, "r-xp", "/lib/a.so"),
        ];
        let mem = FakeMemory::with(&[(0x1000, MODULE_SIGNATURE), (0x8000, MODULE_SIGNATURE)]);
        let loader = FakeLoader::with(&[("/lib/a.so", vec![sym(0, "a_init")])]);

        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();
        assert_eq!(loader.requested.borrow().len(), 2);
        assert!(ctx.has_symbols(0) && ctx.has_symbols(1));

        ctx.destroy();
        assert_eq!(loader.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn destroy_releases_each_attached_table_once() {
        let (maps, mem, loader) = two_library_process();
        let released = Arc::clone(&loader.released);

        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        ctx.destroy();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn records_line_up_with_their_mappings() {
        let mut maps = Vec::new();
        let mut words = Vec::new();
        let mut entries = Vec::new();
        for i in 0..8u64 {
            let start = 0x10000 * (i + 1);
            let path = format!("/lib/m{i}.so");
            maps.push(mapping(start, start + 0x1000, "r-xp", &path));
            // Only even mappings carry the signature.
            words.push((start, if i % 2 == 0 { MODULE_SIGNATURE } else { NOT_A_MODULE }));
            entries.push((path, vec![sym(0, &format!("m{i}_entry"))]));
        }
        let mem = FakeMemory::with(&words);
        let entries: Vec<(&str, Vec<Symbol>)> =
            entries.iter().map(|(p, s)| (p.as_str(), s.clone())).collect();
        let loader = FakeLoader::with(&entries);
        let release_order = Arc::clone(&loader.release_order);

        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();
        for (i, m) in maps.iter().enumerate() {
            assert_eq!(ctx.module(i).is_some(), i % 2 == 0, "mapping {i}");
            let res = ctx.resolve(m.start + 0x8);
            assert_eq!(res.mapping, Some(m));
            let expected = format!("m{i}_entry");
            assert_eq!(res.symbol.map(|s| s.name.as_str()), (i % 2 == 0).then_some(expected.as_str()));
        }
        assert!(ctx.module(maps.len()).is_none());

        ctx.destroy();
        assert_eq!(
            *release_order.lock().unwrap(),
            vec!["/lib/m0.so", "/lib/m2.so", "/lib/m4.so", "/lib/m6.so"]
        );
    }

    #[test]
    fn dropping_the_context_releases_tables_too() {
        let (maps, mem, loader) = two_library_process();
        {
            let _ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();
        }
        assert_eq!(loader.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_process_resolves_nothing() {
        let mem = FakeMemory::default();
        let ctx =
            PtraceContext::build_with(pid(), &Vec::<Mapping>::new(), &mem, &FakeLoader::default())
                .unwrap();
        assert!(ctx.mappings().is_empty());
        assert_eq!(ctx.resolve(0x1000).mapping, None);
        assert_eq!(mem.reads.get(), 0);
    }

    #[test]
    fn resolve_does_not_require_readable_mapping() {
        let maps = vec![mapping(0x1000, 0x2000, "--xp", "/lib/a.so")];
        let mem = FakeMemory::default();
        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &FakeLoader::default()).unwrap();
        assert_eq!(ctx.resolve(0x1800).mapping, Some(&maps[0]));
    }

    #[test]
    fn resolve_is_shareable_across_threads() {
        let maps = vec![mapping(0x1000, 0x2000, "r-xp", "/lib/a.so")];
        let mem = FakeMemory::with(&[(0x1000, MODULE_SIGNATURE)]);
        let table = SymbolTable::new(vec![sym(0x0, "a_init"), sym(0x100, "a_main")]);
        let loader = StaticLoader(table);

        let ctx = PtraceContext::build_with(pid(), &maps, &mem, &loader).unwrap();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for offset in (0..0x1000).step_by(4) {
                        let res = ctx.resolve(0x1000 + offset);
                        let expected = if offset < 0x100 { "a_init" } else { "a_main" };
                        assert_eq!(res.symbol.unwrap().name, expected);
                    }
                });
            }
        });
    }

    struct StaticLoader(SymbolTable);

    impl SymbolLoader for StaticLoader {
        type Table = SymbolTable;

        fn load(&self, _path: &Path) -> Option<SymbolTable> {
            Some(self.0.clone())
        }
    }
}
