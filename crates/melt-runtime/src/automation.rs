//! Scripted measurement runs.
//!
//! A run loads the configured model once, then replays every scripted conversation through the
//! controller: each question is prefilled and decoded until the module stops, its runtime stats
//! and answer are recorded, and the instrumentation timeline of the conversation is exported to
//! `<output_dir>/<measurement>_conv<index>.csv` before the chat and the timeline are reset.
//! Pauses between questions and conversations let the device return to idle power.

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::config::{AutomationConfig, MeasurementConfig};
use crate::controller::SessionController;
use crate::error::SessionError;
use crate::notify::{CompletionNotifier, NotifyError};
use crate::records::{
    ConversationRecord, ConversationRecords, QuestionRecord, RecordError, TimeRecord,
    UNKNOWN_TOKEN_COUNT,
};
use crate::stats::{RuntimeStats, StatsError};
use crate::timeline::InstrumentationError;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Questions grouped by conversation.
pub type Conversations = Vec<Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid conversations file: {0}")]
    InvalidInput(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Instrumentation(#[from] InstrumentationError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Records(#[from] RecordError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

pub fn load_conversations(path: impl AsRef<Path>) -> Result<Conversations, AutomationError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| AutomationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct AutomationReport {
    pub conversations: usize,
    pub questions: usize,
    pub timeline_files: Vec<PathBuf>,
    pub records_file: PathBuf,
    pub cancelled: bool,
}

pub struct MeasurementRun<'a> {
    config: &'a MeasurementConfig,
    cancel: CancelToken,
}

impl<'a> MeasurementRun<'a> {
    pub fn new(config: &'a MeasurementConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token that stops the run after the current question.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn automation(&self) -> &AutomationConfig {
        &self.config.automation
    }

    pub fn timeline_path(&self, conversation: usize) -> PathBuf {
        let automation = self.automation();
        automation
            .output_dir
            .join(format!("{}_conv{conversation}.csv", automation.measurement))
    }

    pub fn records_path(&self) -> PathBuf {
        let automation = self.automation();
        automation
            .output_dir
            .join(format!("{}.json", automation.measurement))
    }

    pub fn run<C: Clock>(
        &self,
        controller: &mut SessionController<C>,
        conversations: &[Vec<String>],
    ) -> Result<AutomationReport, AutomationError> {
        let automation = self.automation();
        let session = &self.config.session;
        std::fs::create_dir_all(&automation.output_dir).map_err(|source| {
            AutomationError::Io {
                path: automation.output_dir.clone(),
                source,
            }
        })?;

        log::info!(
            "Loading '{}' from {} on {}",
            session.model_lib,
            session.model_path,
            session.device()
        );
        let (loaded, load_time) =
            TimeRecord::measure(|| controller.reload(&session.model_lib, &session.model_path));
        loaded?;
        log::info!("Model loaded in {:.3} s", load_time.duration);

        let mut records = ConversationRecords::new();
        let mut timeline_files = Vec::new();
        let mut questions = 0;

        for (c_idx, conversation) in conversations.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let mut record = ConversationRecord::new(&session.model_lib, Some(load_time));
            for (q_idx, question) in conversation.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    break;
                }
                log::info!("Conversation {c_idx}, question {q_idx}: {question}");
                let question_record = self.ask(controller, question)?;
                log::debug!(
                    "Answered with {} token(s) in {:.3} s",
                    question_record.output_tokens,
                    question_record.time.duration
                );
                record.question_records.push(question_record);
                questions += 1;
                self.pause(automation.question_pause());
            }

            let timeline_path = self.timeline_path(c_idx);
            controller.save_instrumentation(&timeline_path)?;
            timeline_files.push(timeline_path);
            records.push(record);

            controller.reset_chat()?;
            controller.reset_instrumentation();
            if c_idx + 1 < conversations.len() {
                self.pause(automation.conversation_pause());
            }
        }

        let records_file = self.records_path();
        records.save(&records_file)?;

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            log::warn!("Measurement run cancelled after {questions} question(s)");
        } else if let Some(notify) = &self.config.notify {
            CompletionNotifier::new(notify)?.notify()?;
        }

        Ok(AutomationReport {
            conversations: records.conversations().len(),
            questions,
            timeline_files,
            records_file,
            cancelled,
        })
    }

    fn ask<C: Clock>(
        &self,
        controller: &mut SessionController<C>,
        question: &str,
    ) -> Result<QuestionRecord, AutomationError> {
        let max_steps = self.automation().max_decode_steps;
        let (result, time) = TimeRecord::measure(|| -> Result<_, AutomationError> {
            controller.prefill(question)?;
            let mut steps = 0;
            while !controller.stopped()? {
                if max_steps.is_some_and(|max| steps >= max) || self.cancel.is_cancelled() {
                    break;
                }
                controller.decode()?;
                steps += 1;
            }
            let runtime_stats = controller.runtime_stats_text()?;
            let stats = RuntimeStats::parse(&runtime_stats)?;
            let output = controller.get_message()?;
            Ok((runtime_stats, stats, output))
        });
        let (runtime_stats, stats, output) = result?;

        Ok(QuestionRecord {
            time,
            input: question.to_string(),
            output,
            original_session_tokens: UNKNOWN_TOKEN_COUNT,
            input_tokens: stats.prefill()?.total_tokens,
            output_tokens: stats.decode()?.total_tokens,
            runtime_stats,
        })
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }
}
