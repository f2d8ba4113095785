use log::error;
use snapvm::commands::execute_command::ExecuteCommand;
use snapvm::commands::options::{Options, SubCommand};
use snapvm::commands::VmCommand;
use snapvm::flags::Flags;
use std::process;
use structopt::StructOpt;

fn main() {
    let options = Options::from_args();
    let default_filter = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    Flags::init(options.to_flags());

    let result = match options.cmd {
        SubCommand::Execute => ExecuteCommand::new(&options).run(),
    };
    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
