use crate::arch::{ArchName, OsName};
use lazy_static::lazy_static;
use std::path::PathBuf;
use std::sync::RwLock;

lazy_static! {
    static ref FLAGS: RwLock<Flags> = RwLock::new(Flags::default());
}

/// Process-wide configuration, captured once from the command line before any
/// command runs. Library code reads it through `Flags::get()`.
#[derive(Clone)]
pub struct Flags {
    /// Directory holding the snapshot, memory files and the code-cache index.
    pub workspace: PathBuf,
    pub arch: ArchName,
    pub os: OsName,
    /// Runtime library name or path; defaults to `<os>_<arch>`.
    pub runtime: String,
    /// Instrumentation tools to load, in activation order.
    pub tools: Vec<String>,
    pub verbose: bool,
    /// Track code versions so self-modifying code forces re-translation.
    /// When off, every code version is `CodeVersion::NONE` and the dispatch
    /// key degenerates to the PC alone.
    pub version_code: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            workspace: PathBuf::from("."),
            arch: ArchName::Amd64,
            os: OsName::Linux,
            runtime: crate::arch::default_runtime_name(OsName::Linux, ArchName::Amd64),
            tools: Vec::new(),
            verbose: false,
            version_code: false,
        }
    }
}

impl Flags {
    pub fn get() -> Flags {
        FLAGS.read().unwrap().clone()
    }

    /// Install the parsed command-line configuration. Called once from main
    /// before any other module looks at the flags.
    pub fn init(flags: Flags) {
        *FLAGS.write().unwrap() = flags;
    }
}

/// Split a `--tool` list: colon-separated on POSIX, semicolon-separated on
/// Windows.
pub fn parse_tool_list(spec: &str) -> Vec<String> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    spec.split(sep)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_list_splits_and_drops_empties() {
        let tools = parse_tool_list("cov::taint");
        assert_eq!(tools, vec!["cov".to_owned(), "taint".to_owned()]);
        assert!(parse_tool_list("").is_empty());
    }
}
