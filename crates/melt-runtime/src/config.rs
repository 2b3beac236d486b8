//! Measurement configuration, loaded from TOML.
//!
//! ```toml
//! [session]
//! device = "opencl"
//! device_id = 0
//! model_lib = "Llama-2-7b-chat-hf-q4f16_1"
//! model_path = "/data/models/Llama-2-7b-chat-hf-q4f16_1"
//!
//! [automation]
//! input = "conversations.json"
//! output_dir = "melt_measurements"
//! measurement = "llama2_opencl"
//! question_pause_secs = 5.0
//! conversation_pause_secs = 60.0
//!
//! [notify]
//! host = "192.168.1.42"
//! port = 5100
//! ```

use crate::native::{Device, DeviceKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub session: SessionConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub device_id: i64,
    pub model_lib: String,
    pub model_path: String,
    /// Words generated per prompt by the simulated backend.
    #[serde(default)]
    pub max_gen_len: Option<usize>,
}

impl SessionConfig {
    pub fn device(&self) -> Device {
        Device::new(self.device, self.device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// JSON file holding `[[question, ...], ...]`.
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub measurement: String,
    pub question_pause_secs: f64,
    pub conversation_pause_secs: f64,
    pub max_decode_steps: Option<usize>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("conversations.json"),
            output_dir: PathBuf::from("melt_measurements"),
            measurement: "measurement".to_string(),
            question_pause_secs: 5.0,
            conversation_pause_secs: 60.0,
            max_decode_steps: None,
        }
    }
}

impl AutomationConfig {
    pub fn question_pause(&self) -> Duration {
        Duration::from_secs_f64(self.question_pause_secs)
    }

    pub fn conversation_pause(&self) -> Duration {
        Duration::from_secs_f64(self.conversation_pause_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub host: String,
    pub port: u16,
}

impl MeasurementConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.model_lib.trim().is_empty() {
            return Err(ConfigError::Invalid("session.model_lib is empty".into()));
        }
        let automation = &self.automation;
        for (name, secs) in [
            ("question_pause_secs", automation.question_pause_secs),
            ("conversation_pause_secs", automation.conversation_pause_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "automation.{name} must be a non-negative number of seconds, got {secs}"
                )));
            }
        }
        if automation.measurement.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "automation.measurement must be a plain file stem, got '{}'",
                automation.measurement
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[session]
device = "metal"
device_id = 1
model_lib = "Llama-2-7b-chat-hf-q4f16_1"
model_path = "/models/llama"

[automation]
input = "questions.json"
output_dir = "out"
measurement = "run1"
question_pause_secs = 0.5
conversation_pause_secs = 2
max_decode_steps = 128

[notify]
host = "10.0.0.2"
port = 5100
"#;

    #[test]
    fn parses_full_config() {
        let config = MeasurementConfig::from_toml(FULL).unwrap();
        assert_eq!(config.session.device(), Device::new(DeviceKind::Metal, 1));
        assert_eq!(config.automation.question_pause(), Duration::from_millis(500));
        assert_eq!(config.automation.max_decode_steps, Some(128));
        assert_eq!(config.notify.unwrap().port, 5100);
    }

    #[test]
    fn automation_and_notify_are_optional() {
        let config = MeasurementConfig::from_toml(
            "[session]\nmodel_lib = \"m\"\nmodel_path = \"/m\"\n",
        )
        .unwrap();
        assert_eq!(config.session.device(), Device::default());
        assert_eq!(config.automation, AutomationConfig::default());
        assert!(config.notify.is_none());
    }

    #[test]
    fn rejects_negative_pause() {
        let err = MeasurementConfig::from_toml(
            "[session]\nmodel_lib = \"m\"\nmodel_path = \"/m\"\n[automation]\nquestion_pause_secs = -1.0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_pause_overflowing_duration() {
        for pause in ["question_pause_secs = 1e20", "conversation_pause_secs = 1e300"] {
            let err = MeasurementConfig::from_toml(&format!(
                "[session]\nmodel_lib = \"m\"\nmodel_path = \"/m\"\n[automation]\n{pause}\n"
            ))
            .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{pause}");
        }
    }

    #[test]
    fn rejects_unknown_device() {
        let err = MeasurementConfig::from_toml(
            "[session]\ndevice = \"tpu\"\nmodel_lib = \"m\"\nmodel_path = \"/m\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
