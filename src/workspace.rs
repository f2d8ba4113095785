//! On-disk workspace layout.
//!
//! ```text
//! <workspace>/snapshot        the snapshot message
//! <workspace>/index           code-cache index (TraceId <-> LiveTraceId)
//! <workspace>/memory/<name>   raw page contents per mapped range
//! <workspace>/bitcode/        lifted IR modules
//! <workspace>/<hash>/lib/     per-tool compiled artifacts
//! ```

use crate::util;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating as needed) the workspace directory skeleton.
    pub fn open(root: &Path) -> io::Result<Workspace> {
        let workspace = Workspace {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(workspace.memory_dir())?;
        fs::create_dir_all(workspace.bitcode_dir())?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    pub fn memory_file(&self, name: &str) -> PathBuf {
        self.memory_dir().join(name)
    }

    pub fn bitcode_dir(&self) -> PathBuf {
        self.root.join("bitcode")
    }

    /// Artifact directory for one (runtime, tool list) combination. Distinct
    /// combinations compile to distinct artifacts, so each gets its own
    /// content-addressed directory.
    pub fn tool_lib_dir(&self, runtime: &str, tools: &[String]) -> PathBuf {
        let mut digest = util::Digest::with_seed(0);
        digest.update(runtime.as_bytes());
        for tool in tools {
            digest.update(b"\0");
            digest.update(tool.as_bytes());
        }
        self.root
            .join(format!("{:016x}", digest.finish()))
            .join("lib")
    }
}
