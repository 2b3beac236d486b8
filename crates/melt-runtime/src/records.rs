use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Failed to write conversation records to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Token count written when the runtime cannot provide one.
pub const UNKNOWN_TOKEN_COUNT: i64 = -1;

/// Wall-clock start (Unix seconds) and duration (seconds) of a measured span.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRecord {
    pub start: f64,
    pub duration: f64,
}

impl TimeRecord {
    pub fn new(start: SystemTime, duration: Duration) -> Self {
        let start = start
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            start,
            duration: duration.as_secs_f64(),
        }
    }

    /// Time `f`, returning its output together with the span it took.
    pub fn measure<T>(f: impl FnOnce() -> T) -> (T, TimeRecord) {
        let start = SystemTime::now();
        let timer = std::time::Instant::now();
        let out = f();
        (out, TimeRecord::new(start, timer.elapsed()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub time: TimeRecord,
    pub input: String,
    pub output: String,
    /// Tokens already in the context before the question. The runtime does not report it, so
    /// records carry [`UNKNOWN_TOKEN_COUNT`].
    pub original_session_tokens: i64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(rename = "runtimeStats")]
    pub runtime_stats: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub model_name: String,
    pub model_load_time: Option<TimeRecord>,
    #[serde(default)]
    pub question_records: Vec<QuestionRecord>,
}

impl ConversationRecord {
    pub fn new(model_name: impl Into<String>, model_load_time: Option<TimeRecord>) -> Self {
        Self {
            model_name: model_name.into(),
            model_load_time,
            question_records: Vec::new(),
        }
    }
}

/// Collects conversation records of a run and writes them as a JSON array.
#[derive(Debug, Default)]
pub struct ConversationRecords {
    conversations: Vec<ConversationRecord>,
}

impl ConversationRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conversation: ConversationRecord) {
        self.conversations.push(conversation);
    }

    pub fn conversations(&self) -> &[ConversationRecord] {
        &self.conversations
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RecordError> {
        let path = path.as_ref();
        let io_error = |source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(&self.conversations)?;
        std::fs::write(path, json).map_err(io_error)?;
        log::info!(
            "Saved {} conversation record(s) to {}",
            self.conversations.len(),
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            conversations: serde_json::from_str(&text)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ConversationRecord {
        let mut conversation = ConversationRecord::new(
            "Llama-2-7b",
            Some(TimeRecord {
                start: 1.5,
                duration: 2.0,
            }),
        );
        conversation.question_records.push(QuestionRecord {
            time: TimeRecord {
                start: 4.0,
                duration: 0.5,
            },
            input: "hi".to_string(),
            output: "hello".to_string(),
            original_session_tokens: UNKNOWN_TOKEN_COUNT,
            input_tokens: 1,
            output_tokens: 1,
            runtime_stats: "{}".to_string(),
        });
        conversation
    }

    #[test]
    fn field_names_match_record_format() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["modelName"], "Llama-2-7b");
        assert_eq!(json["modelLoadTime"]["duration"], 2.0);
        let question = &json["questionRecords"][0];
        assert_eq!(question["input_tokens"], 1);
        assert_eq!(question["runtimeStats"], "{}");
        assert_eq!(question["original_session_tokens"], -1);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.json");
        let mut records = ConversationRecords::new();
        records.push(record());
        records.save(&path).unwrap();

        let loaded = ConversationRecords::load(&path).unwrap();
        assert_eq!(loaded.conversations(), records.conversations());
    }

    #[test]
    fn measure_reports_duration() {
        let (value, time) = TimeRecord::measure(|| 7);
        assert_eq!(value, 7);
        assert!(time.duration >= 0.0);
        assert!(time.start > 0.0);
    }
}
