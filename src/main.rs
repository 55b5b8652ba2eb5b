mod cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tilesched",
    version,
    about = "Modulo scheduling and software pipelining for tiled GPU kernel loops"
)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule every loop of a kernel and pipeline the ones that allow it
    Schedule(cli::schedule::ScheduleArgs),
    /// Print a kernel's trace and constraints
    Show {
        /// Kernel JSON file
        input: Option<PathBuf>,
        /// Use a built-in kernel instead of a file
        #[arg(long, value_name = "NAME")]
        builtin: Option<String>,
        /// List the built-in kernels
        #[arg(long)]
        list: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    cli::init_tracing(cli.verbose);

    match cli.command {
        Command::Schedule(args) => cli::schedule::cmd_schedule(args),
        Command::Show {
            input,
            builtin,
            list,
        } => cli::show::cmd_show(input, builtin, list),
    }
}
