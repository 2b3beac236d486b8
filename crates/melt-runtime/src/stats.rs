//! Parsing of the runtime statistics reported by the chat module.
//!
//! Two shapes are understood. The JSON form maps each phase to string values with units:
//!
//! ```text
//! {"prefill": {"throughput": "87.899 tok/s", "total tokens": "10 tok", "total time": "0.114 s"},
//!  "decode":  {"throughput": "54.603 tok/s", "total tokens": "18 tok", "total time": "0.330 s"}}
//! ```
//!
//! The legacy text form uses four lines per phase:
//!
//! ```text
//! ----------- prefill -----------
//! throughput: 87.899 tok/s
//! total tokens: 10 tok
//! total time: 0.114 s
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static FLOAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid float regex"));
static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid int regex"));

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("Invalid runtime stats JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Phase '{phase}' is missing field '{field}'")]
    MissingField { phase: String, field: &'static str },
    #[error("Phase '{phase}' has no number in field '{field}': {value:?}")]
    InvalidNumber {
        phase: String,
        field: &'static str,
        value: String,
    },
    #[error("Unrecognized runtime stats text: {0:?}")]
    Unrecognized(String),
    #[error("Runtime stats do not report phase '{0}'")]
    MissingPhase(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    /// Tokens per second.
    pub throughput: f64,
    pub total_tokens: u64,
    /// Seconds.
    pub total_time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub phases: BTreeMap<String, PhaseStats>,
}

impl RuntimeStats {
    pub const PREFILL: &'static str = "prefill";
    pub const DECODE: &'static str = "decode";

    /// Parse either the JSON or the legacy text form.
    pub fn parse(text: &str) -> Result<Self, StatsError> {
        let text = text.trim();
        if text.starts_with('{') {
            Self::parse_json(text)
        } else {
            Self::parse_text(text)
        }
    }

    pub fn parse_json(text: &str) -> Result<Self, StatsError> {
        let raw: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(text)?;
        let mut phases = BTreeMap::new();
        for (phase, fields) in raw {
            let field = |name: &'static str| {
                fields
                    .get(name)
                    .map(String::as_str)
                    .ok_or_else(|| StatsError::MissingField {
                        phase: phase.clone(),
                        field: name,
                    })
            };
            let stats = PhaseStats {
                throughput: parse_float(&phase, "throughput", field("throughput")?)?,
                total_tokens: parse_int(&phase, "total tokens", field("total tokens")?)?,
                total_time: parse_float(&phase, "total time", field("total time")?)?,
            };
            phases.insert(phase, stats);
        }
        Ok(Self { phases })
    }

    pub fn parse_text(text: &str) -> Result<Self, StatsError> {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if lines.is_empty() || lines.len() % 4 != 0 {
            return Err(StatsError::Unrecognized(text.to_string()));
        }
        let mut phases = BTreeMap::new();
        for chunk in lines.chunks(4) {
            let phase = chunk[0].trim_matches('-').trim().to_string();
            if phase.is_empty() {
                return Err(StatsError::Unrecognized(chunk[0].to_string()));
            }
            let value = |line: &str, field: &'static str| {
                line.split_once(':')
                    .filter(|(key, _)| key.trim() == field)
                    .map(|(_, v)| v.trim().to_string())
                    .ok_or_else(|| StatsError::MissingField {
                        phase: phase.clone(),
                        field,
                    })
            };
            let stats = PhaseStats {
                throughput: parse_float(&phase, "throughput", &value(chunk[1], "throughput")?)?,
                total_tokens: parse_int(&phase, "total tokens", &value(chunk[2], "total tokens")?)?,
                total_time: parse_float(&phase, "total time", &value(chunk[3], "total time")?)?,
            };
            phases.insert(phase, stats);
        }
        Ok(Self { phases })
    }

    pub fn phase(&self, name: &'static str) -> Result<&PhaseStats, StatsError> {
        self.phases.get(name).ok_or(StatsError::MissingPhase(name))
    }

    pub fn prefill(&self) -> Result<&PhaseStats, StatsError> {
        self.phase(Self::PREFILL)
    }

    pub fn decode(&self) -> Result<&PhaseStats, StatsError> {
        self.phase(Self::DECODE)
    }

    /// JSON rendering with unit-suffixed strings, as printed by the `stats` command.
    pub fn to_pretty_json(&self) -> String {
        let value: BTreeMap<_, _> = self
            .phases
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "throughput": format!("{} tok/s", s.throughput),
                        "total_tokens": format!("{} tok", s.total_tokens),
                        "total_time": format!("{} s", s.total_time),
                    }),
                )
            })
            .collect();
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }
}

fn parse_float(phase: &str, field: &'static str, value: &str) -> Result<f64, StatsError> {
    FLOAT_RE
        .find(value)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| StatsError::InvalidNumber {
            phase: phase.to_string(),
            field,
            value: value.to_string(),
        })
}

fn parse_int(phase: &str, field: &'static str, value: &str) -> Result<u64, StatsError> {
    INT_RE
        .find(value)
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or_else(|| StatsError::InvalidNumber {
            phase: phase.to_string(),
            field,
            value: value.to_string(),
        })
}
