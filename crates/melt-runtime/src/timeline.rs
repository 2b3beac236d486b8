//! Ordered log of instrumentation events.
//!
//! Every session operation is bracketed by a `start` and an `end` event. Events are keyed by
//! `(operation, sequence, phase)` and rendered as `reload.0.start`, `decode.12.end` or, for
//! operations without a counter, `evaluate.start`.
//!
//! Writing an existing key replaces its timestamp in place: the entry keeps the position of its
//! first insertion, so export order is the order in which each key was first seen.
//!
//! The export format is one `name,timestamp` pair per line, no header.

use crate::counters::Operation;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum InstrumentationError {
    #[error("Failed to write instrumentation to {}: {source}", path.display())]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read instrumentation from {}: {source}", path.display())]
    Import {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Malformed event on line {line}: {reason} ({content:?})")]
    Malformed {
        line: usize,
        content: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub operation: Operation,
    pub sequence: Option<u64>,
    pub phase: Phase,
}

impl EventKey {
    pub fn new(operation: Operation, sequence: Option<u64>, phase: Phase) -> Self {
        Self {
            operation,
            sequence,
            phase,
        }
    }

    pub fn start(operation: Operation, sequence: Option<u64>) -> Self {
        Self::new(operation, sequence, Phase::Start)
    }

    pub fn end(operation: Operation, sequence: Option<u64>) -> Self {
        Self::new(operation, sequence, Phase::End)
    }
}

impl Display for EventKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.sequence {
            Some(seq) => write!(f, "{}.{}.{}", self.operation, seq, self.phase),
            None => write!(f, "{}.{}", self.operation, self.phase),
        }
    }
}

impl FromStr for EventKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let (operation, sequence, phase) = match parts.as_slice() {
            [op, phase] => (*op, None, *phase),
            [op, seq, phase] => {
                let seq = seq
                    .parse::<u64>()
                    .map_err(|_| format!("invalid sequence number '{seq}'"))?;
                (*op, Some(seq), *phase)
            }
            _ => return Err(format!("unexpected event name '{s}'")),
        };
        let operation = Operation::from_str(operation)
            .map_err(|_| format!("unknown operation '{operation}'"))?;
        let phase = Phase::from_str(phase).map_err(|_| format!("unknown phase '{phase}'"))?;
        Ok(Self::new(operation, sequence, phase))
    }
}

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub key: EventKey,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    events: Vec<Event>,
    index: HashMap<EventKey, usize>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event, or overwrite the timestamp of an existing key.
    pub fn record(&mut self, key: EventKey, timestamp: u64) {
        match self.index.get(&key) {
            Some(&pos) => self.events[pos].timestamp = timestamp,
            None => {
                self.index.insert(key, self.events.len());
                self.events.push(Event { key, timestamp });
            }
        }
    }

    pub fn get(&self, key: &EventKey) -> Option<u64> {
        self.index.get(key).map(|&pos| self.events[pos].timestamp)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.index.clear();
    }

    /// Write every event as `name,timestamp\n`, in timeline order.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), InstrumentationError> {
        for event in &self.events {
            writeln!(writer, "{},{}", event.key, event.timestamp)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Export the timeline to a file, replacing its content.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), InstrumentationError> {
        let path = path.as_ref();
        let to_export_error = |source| InstrumentationError::Export {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(to_export_error)?;
        match self.write_to(BufWriter::new(file)) {
            Ok(()) => Ok(()),
            Err(InstrumentationError::Io(source)) => Err(to_export_error(source)),
            Err(e) => Err(e),
        }
    }

    /// Parse the export format back into a timeline.
    pub fn parse(text: &str) -> Result<Self, InstrumentationError> {
        let mut timeline = Self::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let malformed = |reason: String| InstrumentationError::Malformed {
                line: idx + 1,
                content: line.to_string(),
                reason,
            };
            let (name, timestamp) = line
                .split_once(',')
                .ok_or_else(|| malformed("missing ',' separator".to_string()))?;
            let key = EventKey::from_str(name).map_err(&malformed)?;
            let timestamp = timestamp
                .trim()
                .parse::<u64>()
                .map_err(|e| malformed(format!("invalid timestamp: {e}")))?;
            timeline.record(key, timestamp);
        }
        Ok(timeline)
    }

    pub fn import(path: impl AsRef<Path>) -> Result<Self, InstrumentationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| InstrumentationError::Import {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }
}
