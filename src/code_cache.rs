//! Compiled-code store.
//!
//! Host functions produced by the lifter are kept in memory keyed by
//! `TraceId`; the pairing of `TraceId`s with the live dispatch keys they
//! were installed under is appended to a JSON-lines index file, so a later
//! run (or a forked address space with identical bytes) can repopulate its
//! dispatch table without lifting again. The index is append-only under an
//! advisory lock, and readers tolerate a torn final line.

use crate::lifter::{LiftedFunction, LiftedModule};
use crate::trace::{LiveTraceId, TraceId};
use crate::workspace::Workspace;
use log::{debug, warn};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("code cache index i/o: {0}")]
    Io(#[from] io::Error),
    #[error("code cache index lock: {0}")]
    Lock(nix::Error),
}

/// One persisted line: which translation served which dispatch key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRecord {
    pub trace: TraceId,
    pub live: LiveTraceId,
}

/// Names the lifter's modules may reference, resolved to host addresses.
/// Populated with the runtime intrinsics before any module is compiled.
pub struct SymbolTable {
    symbols: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable {
            symbols: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, addr: usize) {
        self.symbols.insert(name.to_owned(), addr);
    }

    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }
}

pub struct CodeCache {
    functions: HashMap<TraceId, LiftedFunction>,
    symbols: SymbolTable,
    index_path: PathBuf,
}

impl CodeCache {
    pub fn new(workspace: &Workspace, symbols: SymbolTable) -> CodeCache {
        CodeCache {
            functions: HashMap::new(),
            symbols,
            index_path: workspace.index_path(),
        }
    }

    pub fn install_module(&mut self, module: &LiftedModule) {
        for lifted in &module.functions {
            debug!("caching translation {}", lifted.id);
            self.functions.insert(lifted.id, lifted.func);
        }
    }

    pub fn lookup(&self, id: &TraceId) -> Option<LiftedFunction> {
        self.functions.get(id).copied()
    }

    pub fn resolve_symbol(&self, name: &str) -> Option<usize> {
        self.symbols.resolve(name)
    }

    /// Read every parseable index record. A missing file is an empty index;
    /// an unreadable line (torn append, stray corruption) is skipped, and
    /// everything before it is still used.
    pub fn load_index(&self) -> Vec<IndexRecord> {
        let file = match File::open(&self.index_path) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("unreadable code cache index tail: {}", err);
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<IndexRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping bad code cache index entry: {}", err),
            }
        }
        records
    }

    /// Append records under an advisory exclusive lock, so concurrent
    /// executions sharing a workspace interleave whole lines.
    pub fn append_index(&self, records: &[IndexRecord]) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index_path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(CacheError::Lock)?;
        let result = write_records(&mut file, records);
        let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
        result
    }
}

fn write_records(file: &mut File, records: &[IndexRecord]) -> Result<(), CacheError> {
    let mut buf = Vec::with_capacity(records.len() * 64);
    for record in records {
        serde_json::to_writer(&mut buf, record).map_err(io::Error::from)?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_ptr::GuestPc;
    use crate::memory::CodeVersion;
    use std::fs;

    fn record(pc: u64, hash: u64) -> IndexRecord {
        IndexRecord {
            trace: TraceId {
                entry_pc: GuestPc::new(pc),
                hash,
            },
            live: LiveTraceId {
                pc: GuestPc::new(pc),
                version: CodeVersion::from_digest(hash),
            },
        }
    }

    fn cache_in(dir: &std::path::Path) -> CodeCache {
        let workspace = Workspace::open(dir).unwrap();
        CodeCache::new(&workspace, SymbolTable::new())
    }

    #[test]
    fn index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let records = vec![record(0x4000, 7), record(0x8000, 9)];
        cache.append_index(&records).unwrap();
        assert_eq!(cache.load_index(), records);
    }

    #[test]
    fn missing_index_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(cache.load_index().is_empty());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.append_index(&[record(0x4000, 7)]).unwrap();
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("index"))
            .unwrap();
        file.write_all(b"{\"trace\":{\"entry_pc\":16384").unwrap();
        drop(file);
        let records = cache.load_index();
        assert_eq!(records, vec![record(0x4000, 7)]);
    }

    #[test]
    fn appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.append_index(&[record(0x4000, 1)]).unwrap();
        cache.append_index(&[record(0x5000, 2)]).unwrap();
        assert_eq!(cache.load_index().len(), 2);
        let raw = fs::read_to_string(dir.path().join("index")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
