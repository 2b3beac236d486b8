use anyhow::Context;
use clap::Parser;
use melt_runtime::{MeasurementConfig, MeasurementRun, SessionController, load_conversations};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::{print_info, print_warn};

/// Replay the scripted conversations of a measurement configuration.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Measurement configuration file (TOML).
    #[clap(short = 'c', long = "config", help = "Measurement configuration file (TOML).")]
    config: PathBuf,
    /// Overrides `automation.input`.
    #[clap(short = 'i', long = "input", help = "Conversations file (JSON).")]
    input: Option<PathBuf>,
    /// Overrides `automation.output_dir`.
    #[clap(short = 'o', long = "output-dir", help = "Directory receiving the traces and records.")]
    output_dir: Option<PathBuf>,
    /// Overrides `automation.measurement`.
    #[clap(short = 'm', long = "measurement", help = "Name prefix of the produced files.")]
    measurement: Option<String>,
    #[clap(long = "no-pause", help = "Skip the idle pauses between questions and conversations.")]
    no_pause: bool,
    #[clap(
        long = "token-latency-ms",
        default_value_t = 0,
        help = "Simulated time spent per token."
    )]
    token_latency_ms: u64,
}

impl RunArgs {
    fn load_config(&self) -> anyhow::Result<MeasurementConfig> {
        let mut config = MeasurementConfig::load(&self.config)
            .with_context(|| format!("Failed to load {}", self.config.display()))?;
        let automation = &mut config.automation;
        if let Some(input) = &self.input {
            automation.input = input.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            automation.output_dir = output_dir.clone();
        }
        if let Some(measurement) = &self.measurement {
            automation.measurement = measurement.clone();
        }
        if self.no_pause {
            automation.question_pause_secs = 0.0;
            automation.conversation_pause_secs = 0.0;
        }
        config.validate()?;
        log::debug!("Measurement configuration: {config:?}");
        Ok(config)
    }
}

pub(crate) fn handle_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.load_config()?;
    let conversations = load_conversations(&config.automation.input).with_context(|| {
        format!(
            "Failed to read conversations from {}",
            config.automation.input.display()
        )
    })?;
    print_info!(
        "Replaying {} conversation(s) with '{}' on {}",
        conversations.len(),
        config.session.model_lib,
        config.session.device()
    );

    let registry = super::simulated_registry(
        &config.session.model_lib,
        config.session.max_gen_len,
        Duration::from_millis(args.token_latency_ms),
    );
    let mut controller = SessionController::new(Arc::new(registry), config.session.device())
        .context("Failed to create the chat session")?;

    let cancel = super::cancel_on_interrupt()?;
    let report = MeasurementRun::new(&config)
        .with_cancel_token(cancel)
        .run(&mut controller, &conversations)?;

    if report.cancelled {
        print_warn!("Run interrupted, completion notification skipped.");
    }
    for file in &report.timeline_files {
        print_info!("Timeline written to {}", file.display());
    }
    print_info!(
        "{} question(s) over {} conversation(s) recorded in {}",
        report.questions,
        report.conversations,
        report.records_file.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("measurement.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[session]\nmodel_lib = \"tiny-chat\"\nmodel_path = \"/models/tiny\"\n\n[automation]\nmeasurement = \"base\""
        )
        .unwrap();
        path
    }

    #[test]
    fn flags_override_the_configuration_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs::parse_from([
            "run",
            "--config",
            write_config(dir.path()).to_str().unwrap(),
            "--measurement",
            "override",
            "--output-dir",
            "out",
            "--no-pause",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.automation.measurement, "override");
        assert_eq!(config.automation.output_dir, PathBuf::from("out"));
        assert_eq!(config.automation.question_pause_secs, 0.0);
        assert_eq!(config.automation.conversation_pause_secs, 0.0);
        assert_eq!(config.session.model_lib, "tiny-chat");
    }

    #[test]
    fn missing_configuration_is_reported() {
        let args = RunArgs::parse_from(["run", "--config", "/nonexistent/melt.toml"]);
        let err = args.load_config().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/melt.toml"));
    }
}
