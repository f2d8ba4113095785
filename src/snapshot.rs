//! The program snapshot message and its workspace loader.
//!
//! A snapshot is a frozen image of a guest process: address-space
//! descriptors (each a list of page ranges, with an optional parent link for
//! forked spaces) and task descriptors (PC plus an opaque register blob).
//! Page contents live next to the message, one file per non-zero range under
//! `<workspace>/memory/`. Capturing snapshots is a separate tool's job; this
//! module only validates and loads them.

use crate::arch::ArchName;
use crate::guest_ptr::GuestPc;
use crate::memory::{AddressSpace, AddressSpaceSharedPtr, PagePerms};
use crate::workspace::Workspace;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot i/o: {0}")]
    Io(#[from] io::Error),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
    #[error("duplicate address space id {0}")]
    DuplicateAddressSpace(u64),
    #[error("reference to unknown address space id {0}")]
    UnknownAddressSpace(u64),
    #[error("missing page range file {0:?}")]
    MissingPageFile(String),
    #[error("page range file {0:?} is shorter than its range")]
    ShortPageFile(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Anonymous,
    AnonymousZero,
    FileBacked,
    Stack,
    Heap,
    Vdso,
    Vvar,
    Vsyscall,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageRangeDesc {
    pub base: u64,
    pub limit: u64,
    pub kind: PageKind,
    pub can_read: bool,
    pub can_write: bool,
    pub can_exec: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_offset: Option<u64>,
}

impl PageRangeDesc {
    /// Name of the sibling file under `<workspace>/memory/` holding this
    /// range's bytes.
    pub fn memory_file_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{:016x}_{:016x}", self.base, self.limit),
        }
    }

    pub fn perms(&self) -> PagePerms {
        let mut perms = PagePerms::empty();
        if self.can_read {
            perms |= PagePerms::READ;
        }
        if self.can_write {
            perms |= PagePerms::WRITE;
        }
        if self.can_exec {
            perms |= PagePerms::EXEC;
        }
        perms
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressSpaceDesc {
    pub id: u64,
    #[serde(default)]
    pub parent_id: Option<u64>,
    pub page_ranges: Vec<PageRangeDesc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDesc {
    pub address_space_id: u64,
    pub pc: u64,
    #[serde(default)]
    pub state: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub address_spaces: Vec<AddressSpaceDesc>,
    pub tasks: Vec<TaskDesc>,
}

impl Snapshot {
    pub fn read_from(path: &Path) -> Result<Snapshot, SnapshotError> {
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|err| SnapshotError::Malformed(err.to_string()))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SnapshotError> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)
            .map_err(|err| SnapshotError::Malformed(err.to_string()))
    }
}

pub struct LoadedTask {
    pub state: Vec<u8>,
    pub pc: GuestPc,
    pub memory: AddressSpaceSharedPtr,
}

pub struct LoadedSnapshot {
    pub memories: HashMap<u64, AddressSpaceSharedPtr>,
    pub tasks: Vec<LoadedTask>,
}

/// Materialise every address space and task of the workspace's snapshot.
/// Inconsistencies (duplicate ids, dangling references, missing or short
/// page files) are fatal; a snapshot is either loaded whole or not at all.
pub fn load(workspace: &Workspace, arch: ArchName) -> Result<LoadedSnapshot, SnapshotError> {
    let snapshot = Snapshot::read_from(&workspace.snapshot_path())?;
    let mut memories: HashMap<u64, AddressSpaceSharedPtr> = HashMap::new();

    for desc in &snapshot.address_spaces {
        if memories.contains_key(&desc.id) {
            return Err(SnapshotError::DuplicateAddressSpace(desc.id));
        }
        // Forked spaces clone their parent (sharing page backings) before
        // overlaying their own ranges; parents must precede children.
        let mut space = match desc.parent_id {
            Some(parent_id) => memories
                .get(&parent_id)
                .ok_or(SnapshotError::UnknownAddressSpace(parent_id))?
                .borrow()
                .fork(),
            None => AddressSpace::new(arch),
        };
        for range in &desc.page_ranges {
            if range.limit <= range.base {
                return Err(SnapshotError::Malformed(format!(
                    "empty page range [{:#x}, {:#x})",
                    range.base, range.limit
                )));
            }
            let size = range.limit - range.base;
            let name = range.memory_file_name();
            match range.kind {
                PageKind::AnonymousZero => space.add_map_zero(range.base, size, &name),
                _ => {
                    let path = workspace.memory_file(&name);
                    let mut bytes = fs::read(&path)
                        .map_err(|_| SnapshotError::MissingPageFile(name.clone()))?;
                    if (bytes.len() as u64) < size {
                        return Err(SnapshotError::ShortPageFile(name));
                    }
                    bytes.truncate(size as usize);
                    space.add_map_bytes(
                        range.base,
                        size,
                        &name,
                        range.file_offset.unwrap_or(0),
                        bytes,
                    );
                }
            }
            space.set_permissions(range.base, size, range.perms());
        }
        debug!(
            "loaded address space {} ({} ranges)",
            desc.id,
            desc.page_ranges.len()
        );
        memories.insert(desc.id, space.into_shared());
    }

    let mut tasks = Vec::with_capacity(snapshot.tasks.len());
    for desc in &snapshot.tasks {
        let memory = memories
            .get(&desc.address_space_id)
            .ok_or(SnapshotError::UnknownAddressSpace(desc.address_space_id))?;
        tasks.push(LoadedTask {
            state: desc.state.clone(),
            pc: GuestPc::new(desc.pc),
            memory: memory.clone(),
        });
    }
    Ok(LoadedSnapshot { memories, tasks })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: u64, limit: u64, kind: PageKind) -> PageRangeDesc {
        PageRangeDesc {
            base,
            limit,
            kind,
            can_read: true,
            can_write: true,
            can_exec: false,
            name: None,
            file_path: None,
            file_offset: None,
        }
    }

    fn write_snapshot(workspace: &Workspace, snapshot: &Snapshot) {
        snapshot.write_to(&workspace.snapshot_path()).unwrap();
    }

    fn write_page_file(workspace: &Workspace, range: &PageRangeDesc, bytes: &[u8]) {
        let mut content = bytes.to_vec();
        content.resize((range.limit - range.base) as usize, 0);
        fs::write(workspace.memory_file(&range.memory_file_name()), content).unwrap();
    }

    #[test]
    fn loads_spaces_pages_and_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        let code = {
            let mut r = range(0x4000, 0x5000, PageKind::FileBacked);
            r.can_exec = true;
            r.can_write = false;
            r
        };
        let heap = range(0x6000, 0x8000, PageKind::AnonymousZero);
        write_page_file(&workspace, &code, &[0x90, 0x90, 0xC3]);
        write_snapshot(
            &workspace,
            &Snapshot {
                address_spaces: vec![AddressSpaceDesc {
                    id: 7,
                    parent_id: None,
                    page_ranges: vec![code, heap],
                }],
                tasks: vec![TaskDesc {
                    address_space_id: 7,
                    pc: 0x4000,
                    state: vec![1, 2, 3],
                }],
            },
        );

        let loaded = load(&workspace, ArchName::Amd64).unwrap();
        assert_eq!(loaded.memories.len(), 1);
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].pc, GuestPc::new(0x4000));
        let space = loaded.memories[&7].borrow();
        let mut byte = 0u8;
        assert!(space.try_read_executable(GuestPc::new(0x4000), &mut byte));
        assert_eq!(byte, 0x90);
        assert!(!space.can_write(0x4000));
        assert_eq!(space.try_read_val::<u8>(0x6000), Some(0));
        assert!(!space.can_execute(0x6000));
    }

    #[test]
    fn forked_spaces_share_parent_pages() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        let data = range(0x1000, 0x2000, PageKind::Anonymous);
        write_page_file(&workspace, &data, &[0xAB]);
        write_snapshot(
            &workspace,
            &Snapshot {
                address_spaces: vec![
                    AddressSpaceDesc {
                        id: 1,
                        parent_id: None,
                        page_ranges: vec![data],
                    },
                    AddressSpaceDesc {
                        id: 2,
                        parent_id: Some(1),
                        page_ranges: vec![],
                    },
                ],
                tasks: vec![],
            },
        );
        let loaded = load(&workspace, ArchName::Amd64).unwrap();
        let parent = loaded.memories[&1].clone();
        let child = loaded.memories[&2].clone();
        assert_eq!(child.borrow().try_read_val::<u8>(0x1000), Some(0xAB));
        assert!(child.borrow_mut().try_write_val::<u8>(0x1000, 0xCD));
        assert_eq!(parent.borrow().try_read_val::<u8>(0x1000), Some(0xAB));
    }

    #[test]
    fn duplicate_space_ids_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        write_snapshot(
            &workspace,
            &Snapshot {
                address_spaces: vec![
                    AddressSpaceDesc {
                        id: 3,
                        parent_id: None,
                        page_ranges: vec![],
                    },
                    AddressSpaceDesc {
                        id: 3,
                        parent_id: None,
                        page_ranges: vec![],
                    },
                ],
                tasks: vec![],
            },
        );
        match load(&workspace, ArchName::Amd64) {
            Err(SnapshotError::DuplicateAddressSpace(3)) => {}
            other => panic!("expected duplicate-id error, got {:?}", other.err()),
        }
    }

    #[test]
    fn task_with_unknown_space_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        write_snapshot(
            &workspace,
            &Snapshot {
                address_spaces: vec![],
                tasks: vec![TaskDesc {
                    address_space_id: 9,
                    pc: 0,
                    state: vec![],
                }],
            },
        );
        match load(&workspace, ArchName::Amd64) {
            Err(SnapshotError::UnknownAddressSpace(9)) => {}
            other => panic!("expected unknown-space error, got {:?}", other.err()),
        }
    }

    #[test]
    fn missing_and_short_page_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        let data = range(0x1000, 0x3000, PageKind::Anonymous);
        write_snapshot(
            &workspace,
            &Snapshot {
                address_spaces: vec![AddressSpaceDesc {
                    id: 1,
                    parent_id: None,
                    page_ranges: vec![data.clone()],
                }],
                tasks: vec![],
            },
        );
        match load(&workspace, ArchName::Amd64) {
            Err(SnapshotError::MissingPageFile(_)) => {}
            other => panic!("expected missing-file error, got {:?}", other.err()),
        }
        // A file shorter than the range is as fatal as no file.
        fs::write(workspace.memory_file(&data.memory_file_name()), &[0u8; 16]).unwrap();
        match load(&workspace, ArchName::Amd64) {
            Err(SnapshotError::ShortPageFile(_)) => {}
            other => panic!("expected short-file error, got {:?}", other.err()),
        }
    }

    #[test]
    fn garbage_snapshot_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::open(dir.path()).unwrap();
        fs::write(workspace.snapshot_path(), b"not json").unwrap();
        match Snapshot::read_from(&workspace.snapshot_path()) {
            Err(SnapshotError::Malformed(_)) => {}
            other => panic!("expected malformed error, got {:?}", other.err()),
        }
    }
}
