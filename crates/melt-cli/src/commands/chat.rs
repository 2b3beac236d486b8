use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use melt_runtime::{
    CancelToken, Device, DeviceKind, FinishReason, RuntimeStats, SessionController, SessionHost,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{print_err, print_info, print_warn};

const HELP: &str = "\
Commands:
  /help          show this message
  /stats         print the runtime statistics of the conversation
  /reset         restart the conversation
  /save [FILE]   write the instrumentation events collected so far
  /exit          leave the chat (Ctrl-D works too)
Ctrl-C interrupts the answer being generated.";

/// Chat with a model from the terminal.
#[derive(Parser, Debug)]
pub struct ChatArgs {
    #[clap(help = "Model library name, e.g. Llama-2-7b-chat-hf-q4f16_1.")]
    model_lib: String,
    #[clap(long = "model-path", help = "Model weights directory. Defaults to the library name.")]
    model_path: Option<String>,
    #[clap(short = 'd', long = "device", default_value = "opencl", help = "Device kind.")]
    device: DeviceKind,
    #[clap(long = "device-id", default_value_t = 0, help = "Device index.")]
    device_id: i64,
    #[clap(long = "max-gen-len", help = "Maximum number of tokens per answer.")]
    max_gen_len: Option<usize>,
    #[clap(long = "max-steps", help = "Stop decoding after this many steps.")]
    max_steps: Option<usize>,
    #[clap(
        long = "token-latency-ms",
        default_value_t = 0,
        help = "Simulated time spent per token."
    )]
    token_latency_ms: u64,
    #[clap(
        short = 'e',
        long = "events",
        default_value = "melt_events.csv",
        help = "File receiving the instrumentation events on exit."
    )]
    events: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Help,
    Exit,
    Stats,
    Reset,
    Save(Option<PathBuf>),
    Prompt(String),
    Unknown(String),
    Empty,
}

impl ReplCommand {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Prompt(line.to_string());
        };
        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));
        match name {
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            "stats" => Self::Stats,
            "reset" => Self::Reset,
            "save" if rest.is_empty() => Self::Save(None),
            "save" => Self::Save(Some(PathBuf::from(rest))),
            _ => Self::Unknown(name.to_string()),
        }
    }
}

pub(crate) fn handle_command(args: ChatArgs) -> anyhow::Result<()> {
    let device = Device::new(args.device, args.device_id);
    let model_path = args.model_path.clone().unwrap_or_else(|| args.model_lib.clone());
    let registry = super::simulated_registry(
        &args.model_lib,
        args.max_gen_len,
        Duration::from_millis(args.token_latency_ms),
    );
    let controller = SessionController::new(Arc::new(registry), device)
        .context("Failed to create the chat session")?;
    let host = SessionHost::spawn(controller);

    let model_lib = args.model_lib.clone();
    host.with(move |c| c.reload(&model_lib, &model_path))?
        .with_context(|| format!("Failed to load '{}'", args.model_lib))?;
    print_info!("Loaded '{}' on {}. Type /help for commands.", args.model_lib, device);

    let cancel = super::cancel_on_interrupt()?;
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{} ", ">>>".green().bold());
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            println!();
            break;
        };
        match ReplCommand::parse(&line?) {
            ReplCommand::Empty => {}
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Exit => break,
            ReplCommand::Stats => {
                let text = host.with(|c| c.runtime_stats_text())??;
                match RuntimeStats::parse(&text) {
                    Ok(stats) => println!("{}", stats.to_pretty_json()),
                    Err(e) => {
                        print_warn!("Unreadable runtime stats ({e}): {text}");
                    }
                }
            }
            ReplCommand::Reset => {
                host.with(|c| c.reset_chat())??;
                print_info!("Conversation restarted.");
            }
            ReplCommand::Save(path) => {
                let path = path.unwrap_or_else(|| args.events.clone());
                let target = path.clone();
                match host.with(move |c| c.save_instrumentation(&target))? {
                    Ok(()) => {
                        print_info!("Events written to {}", path.display());
                    }
                    Err(e) => {
                        print_err!("{e}");
                    }
                }
            }
            ReplCommand::Unknown(name) => {
                print_warn!("Unknown command '/{name}'. Type /help for the list.");
            }
            ReplCommand::Prompt(prompt) => answer(&host, prompt, args.max_steps, &cancel)?,
        }
    }

    host.with(|c| c.unload())??;
    let controller = host.into_controller()?;
    controller
        .save_instrumentation(&args.events)
        .with_context(|| format!("Failed to save events to {}", args.events.display()))?;
    print_info!(
        "{} event(s) written to {}",
        controller.timeline().len(),
        args.events.display()
    );
    Ok(())
}

fn answer(
    host: &SessionHost,
    prompt: String,
    max_steps: Option<usize>,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    cancel.reset();
    let token = cancel.clone();
    let generation = host.with(move |c| {
        let mut printed = 0;
        c.generate(&prompt, max_steps, &token, |message| {
            if let Some(delta) = message.get(printed..) {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            printed = message.len();
        })
    })??;
    println!();

    match generation.finish {
        FinishReason::Stopped => {}
        FinishReason::StepLimit => {
            print_warn!("Answer truncated after {} step(s).", generation.decode_steps);
        }
        FinishReason::Cancelled => {
            print_warn!("Answer interrupted.");
        }
    }
    Ok(())
}
