use nix::libc::{c_long, c_void};
use nix::sys::ptrace;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::debug;

use crate::maps::{find_mapping, find_readable_mapping, Mapping};

/// Value reported for a word that could not be read.
pub const INVALID_WORD: u32 = 0xffff_ffff;

const PEEK_SIZE: usize = std::mem::size_of::<c_long>();

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address 0x{0:x} is not word aligned")]
    MisalignedAddress(u64),
    #[error("address 0x{0:x} is not in any mapping")]
    AddressNotMapped(u64),
    #[error("address 0x{0:x} is in a mapping that is not readable")]
    NotReadable(u64),
    #[error("reading address 0x{address:x} failed: {errno}")]
    ReadFailed { address: u64, errno: nix::Error },
}

/// Performs the raw 32-bit read once an address has been validated.
pub trait WordReader {
    fn read_u32(&self, address: u64) -> Result<u32, MemoryError>;
}

/// Reads straight out of the calling process's address space.
///
/// Only meaningful when the mapping list describes this process, i.e. the
/// context was built for `Pid::this()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalMemory;

impl WordReader for LocalMemory {
    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        let ptr = address as usize as *const u32;
        // SAFETY: MemoryAccessor only calls this for 4-byte aligned addresses
        // inside a readable mapping of this process.
        Ok(unsafe { ptr.read_volatile() })
    }
}

/// Peeks memory of a ptrace-stopped tracee.
#[derive(Debug, Clone, Copy)]
pub struct PtraceMemory {
    pid: Pid,
}

impl PtraceMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }
}

impl WordReader for PtraceMemory {
    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        // PEEKDATA transfers a whole native word. Peek the aligned word that
        // holds `address` so the read never crosses the end of the mapping.
        let aligned = address & !(PEEK_SIZE as u64 - 1);
        let word = ptrace::read(self.pid, aligned as *mut c_void)
            .map_err(|errno| MemoryError::ReadFailed { address, errno })?;
        let bytes = word.to_ne_bytes();
        let at = (address - aligned) as usize;
        Ok(u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]))
    }
}

/// Validating view over a mapping list. Borrows everything, owns nothing.
pub struct MemoryAccessor<'a, R: WordReader + ?Sized> {
    mappings: &'a [Mapping],
    reader: &'a R,
}

impl<'a, R: WordReader + ?Sized> MemoryAccessor<'a, R> {
    pub fn new(mappings: &'a [Mapping], reader: &'a R) -> Self {
        Self { mappings, reader }
    }

    /// Reads the aligned word at `address` if a readable mapping covers it.
    pub fn try_read_word(&self, address: u64) -> Result<u32, MemoryError> {
        debug!("reading word at 0x{address:x}");
        if address & 3 != 0 {
            debug!("invalid pointer 0x{address:x}");
            return Err(MemoryError::MisalignedAddress(address));
        }
        if find_readable_mapping(self.mappings, address).is_none() {
            debug!("pointer 0x{address:x} not in a readable map");
            return Err(if find_mapping(self.mappings, address).is_some() {
                MemoryError::NotReadable(address)
            } else {
                MemoryError::AddressNotMapped(address)
            });
        }
        self.reader.read_u32(address)
    }

    /// Like [`try_read_word`](Self::try_read_word), but reports failure as
    /// `(INVALID_WORD, false)`.
    pub fn read_word(&self, address: u64) -> (u32, bool) {
        match self.try_read_word(address) {
            Ok(word) => (word, true),
            Err(_) => (INVALID_WORD, false),
        }
    }
}
