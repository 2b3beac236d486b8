use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;

use crate::commands;
use crate::{print_err, print_info, print_success};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay scripted conversations and record energy measurement traces.
    Run(commands::run::RunArgs),
    /// Chat interactively with a model while recording instrumentation events.
    Chat(commands::chat::ChatArgs),
    /// Parse a runtime statistics text and print it as JSON.
    Stats(commands::stats::StatsArgs),
}

pub fn cli_main() -> ExitCode {
    let args = CliArgs::parse();
    let time_begin = std::time::Instant::now();

    let cli_res = match args.command {
        Commands::Run(run_args) => commands::run::handle_command(run_args),
        Commands::Chat(chat_args) => commands::chat::handle_command(chat_args),
        Commands::Stats(stats_args) => commands::stats::handle_command(stats_args),
    };

    let code = match cli_res {
        Ok(()) => {
            print_success!("Command executed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_err!("{:#}", e);
            ExitCode::FAILURE
        }
    };

    print_info!(
        "Time elapsed for the current execution: {}",
        format_duration(time_begin.elapsed())
    );
    code
}

pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    match secs {
        0 => format!("{millis}ms"),
        1..60 => format!("{secs}.{millis:03}s"),
        _ => format!("{}m {:02}s", secs / 60, secs % 60),
    }
}
