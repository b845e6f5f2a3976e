use std::fs::File;
use std::io::{self, BufRead, BufReader};

use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

/// One contiguous region of a traced process's address space, as listed in
/// `/proc/<pid>/maps`.
///
/// Example lines:
/// 7f3892fbd000-7f3892fe0000 r-xp 00001000 08:20 42625                      /usr/lib/x86_64-linux-gnu/ld-2.31.so
/// 7f38911ff000-7f38913ff000 rw-p 00000000 00:00 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Offset of `start` into the backing file.
    pub offset: u64,
    /// Backing file, empty for anonymous mappings.
    pub pathname: String,
}

impl Mapping {
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// `start <= address < end`. Zero-size mappings contain nothing.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn is_anonymous(&self) -> bool {
        self.pathname.is_empty()
    }

    /// Parses one line of `/proc/<pid>/maps`:
    /// `address perms offset dev inode [pathname]`.
    pub fn parse_line(line: &str) -> Result<Self, MapsError> {
        let mut parts = line.splitn(6, ' ');

        let (start, end) = parts
            .next()
            .and_then(|range| range.split_once('-'))
            .and_then(|(start, end)| {
                let start = u64::from_str_radix(start, 16).ok()?;
                let end = u64::from_str_radix(end, 16).ok()?;
                Some((start, end))
            })
            .ok_or_else(|| MapsError::InvalidAddress { line: line.to_owned() })?;

        let perms = parts
            .next()
            .filter(|p| p.len() == 4)
            .ok_or_else(|| MapsError::InvalidPermissions { line: line.to_owned() })?
            .as_bytes();

        let offset = parts
            .next()
            .and_then(|o| u64::from_str_radix(o, 16).ok())
            .ok_or_else(|| MapsError::InvalidOffset { line: line.to_owned() })?;

        let _device = parts
            .next()
            .ok_or_else(|| MapsError::InvalidDevice { line: line.to_owned() })?;
        let _inode = parts
            .next()
            .and_then(|i| i.parse::<u64>().ok())
            .ok_or_else(|| MapsError::InvalidInode { line: line.to_owned() })?;

        // The kernel pads the inode column with spaces before the path.
        let pathname = parts.next().unwrap_or("").trim().to_owned();

        Ok(Mapping {
            start,
            end,
            readable: perms[0] == b'r',
            writable: perms[1] == b'w',
            executable: perms[2] == b'x',
            offset,
            pathname,
        })
    }
}

/// Errors while reading a process memory map.
#[derive(Debug, Error)]
pub enum MapsError {
    #[error("failed to open memory map for process {pid}")]
    Open { pid: Pid, source: io::Error },
    #[error("failed to read memory map for process {pid}")]
    Read { pid: Pid, source: io::Error },
    #[error("can not parse address range: {line}")]
    InvalidAddress { line: String },
    #[error("can not parse permissions: {line}")]
    InvalidPermissions { line: String },
    #[error("can not parse offset: {line}")]
    InvalidOffset { line: String },
    #[error("can not parse device: {line}")]
    InvalidDevice { line: String },
    #[error("can not parse inode: {line}")]
    InvalidInode { line: String },
}

/// Reads and parses `/proc/<pid>/maps` in kernel order.
pub fn read_maps(pid: Pid) -> Result<Vec<Mapping>, MapsError> {
    let maps_path = format!("/proc/{pid}/maps");
    let file = File::open(&maps_path).map_err(|source| MapsError::Open { pid, source })?;
    parse_maps(pid, BufReader::new(file))
}

fn parse_maps(pid: Pid, reader: impl BufRead) -> Result<Vec<Mapping>, MapsError> {
    let mut mappings = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|source| MapsError::Read { pid, source })?;
        if line.trim().is_empty() {
            continue;
        }
        mappings.push(Mapping::parse_line(&line)?);
    }
    Ok(mappings)
}

/// Produces the mapping list of a process.
pub trait MappingSource {
    fn enumerate(&self, pid: Pid) -> Vec<Mapping>;
}

/// Enumerates mappings from procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMaps;

impl MappingSource for ProcMaps {
    fn enumerate(&self, pid: Pid) -> Vec<Mapping> {
        match read_maps(pid) {
            Ok(mappings) => {
                debug!("read {} mappings for process {pid}", mappings.len());
                mappings
            }
            Err(err) => {
                warn!("{err}, continuing without mappings");
                Vec::new()
            }
        }
    }
}

impl MappingSource for Vec<Mapping> {
    fn enumerate(&self, _pid: Pid) -> Vec<Mapping> {
        self.clone()
    }
}

/// First mapping containing `address`, regardless of permissions.
pub fn find_mapping(mappings: &[Mapping], address: u64) -> Option<&Mapping> {
    mappings.iter().find(|m| m.contains(address))
}

/// First mapping containing `address` that is also readable.
pub fn find_readable_mapping(mappings: &[Mapping], address: u64) -> Option<&Mapping> {
    mappings.iter().find(|m| m.readable && m.contains(address))
}
