use anyhow::Context;
use clap::Parser;
use melt_runtime::RuntimeStats;
use std::io::Read;

/// Parse runtime statistics, in JSON or legacy text form.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[clap(default_value = "-", help = "Statistics file, or '-' to read standard input.")]
    source: String,
}

fn read_source(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read standard input")?;
        Ok(text)
    } else {
        std::fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))
    }
}

pub(crate) fn handle_command(args: StatsArgs) -> anyhow::Result<()> {
    let text = read_source(&args.source)?;
    let stats = RuntimeStats::parse(&text)?;
    println!("{}", stats.to_pretty_json());
    Ok(())
}
