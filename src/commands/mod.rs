use std::io;

pub mod execute_command;
pub mod options;

/// A subcommand of the `snapvm` binary. `run` returns the process exit
/// code: 0 for clean termination, 1 for unrecoverable translation errors,
/// 2 for a snapshot that could not be loaded.
pub trait VmCommand {
    fn run(&mut self) -> io::Result<i32>;
}
