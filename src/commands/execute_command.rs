use crate::commands::options::Options;
use crate::commands::VmCommand;
use crate::executor::Executor;
use crate::flags::Flags;
use crate::lifter::NullLifter;
use crate::runtime::CooperativeRuntime;
use crate::snapshot;
use crate::workspace::Workspace;
use log::{debug, error, info};
use std::fs;
use std::io;
use std::sync::Arc;

pub struct ExecuteCommand;

impl ExecuteCommand {
    pub fn new(_options: &Options) -> ExecuteCommand {
        ExecuteCommand
    }
}

impl VmCommand for ExecuteCommand {
    fn run(&mut self) -> io::Result<i32> {
        let flags = Flags::get();
        let workspace = Workspace::open(&flags.workspace)?;

        let loaded = match snapshot::load(&workspace, flags.arch) {
            Ok(loaded) => loaded,
            Err(err) => {
                error!("cannot load snapshot: {}", err);
                return Ok(2);
            }
        };
        info!(
            "snapshot: {} address spaces, {} tasks",
            loaded.memories.len(),
            loaded.tasks.len()
        );
        if flags.verbose {
            for (id, memory) in &loaded.memories {
                debug!("address space {}:", id);
                memory.borrow().dump_maps();
            }
        }

        let tool_dir = workspace.tool_lib_dir(&flags.runtime, &flags.tools);
        fs::create_dir_all(&tool_dir)?;
        debug!("tool artifacts at {}", tool_dir.display());

        // The translation backend is external; without one linked in, every
        // trace lowers to the error intrinsic.
        let mut executor = Executor::new(&workspace, Arc::new(NullLifter));
        for task in loaded.tasks {
            executor.add_initial_task(task.state, task.pc, task.memory);
        }
        let mut runtime = CooperativeRuntime;
        Ok(executor.run(&mut runtime))
    }
}
