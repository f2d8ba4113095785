use crate::arch::{default_runtime_name, ArchName, OsName};
use crate::flags::{parse_tool_list, Flags};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Clone, Debug, StructOpt)]
#[structopt(
    name = "snapvm",
    about = "Re-execute program snapshots through a dynamic binary translator"
)]
pub struct Options {
    /// Workspace directory holding the snapshot, memory files and cached
    /// translations.
    #[structopt(long, parse(from_os_str), default_value = ".")]
    pub workspace: PathBuf,

    /// Guest architecture: x86, amd64 or aarch64.
    #[structopt(long, default_value = "amd64")]
    pub arch: ArchName,

    /// Guest operating system.
    #[structopt(long, default_value = "linux")]
    pub os: OsName,

    /// Guest runtime name or path; defaults to `<os>_<arch>`.
    #[structopt(long)]
    pub runtime: Option<String>,

    /// Instrumentation tools to activate, colon-separated (semicolon on
    /// Windows).
    #[structopt(long)]
    pub tool: Option<String>,

    #[structopt(long)]
    pub verbose: bool,

    /// Track code versions so self-modifying code is re-translated.
    #[structopt(long = "version_code")]
    pub version_code: bool,

    #[structopt(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Clone, Debug, StructOpt)]
pub enum SubCommand {
    /// Run the workspace's snapshot to completion.
    Execute,
}

impl Options {
    pub fn to_flags(&self) -> Flags {
        Flags {
            workspace: self.workspace.clone(),
            arch: self.arch,
            os: self.os,
            runtime: self
                .runtime
                .clone()
                .unwrap_or_else(|| default_runtime_name(self.os, self.arch)),
            tools: self
                .tool
                .as_ref()
                .map(|spec| parse_tool_list(spec))
                .unwrap_or_default(),
            verbose: self.verbose,
            version_code: self.version_code,
        }
    }
}
