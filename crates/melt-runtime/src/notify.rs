use crate::config::NotifyConfig;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to reach orchestrator at {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Orchestrator at {url} answered with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Tells the external orchestrator that a measurement run finished, so it can stop the power
/// trace and move on to the next experiment.
pub struct CompletionNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl CompletionNotifier {
    pub fn new(config: &NotifyConfig) -> Result<Self, NotifyError> {
        let url = Self::continue_url(config);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| NotifyError::Request {
                url: url.clone(),
                source,
            })?;
        Ok(Self { url, client })
    }

    pub fn continue_url(config: &NotifyConfig) -> String {
        format!("http://{}:{}/continue", config.host, config.port)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send the `continue` signal and return the response body.
    pub fn notify(&self) -> Result<String, NotifyError> {
        let to_error = |source| NotifyError::Request {
            url: self.url.clone(),
            source,
        };
        let response = self.client.get(&self.url).send().map_err(to_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                url: self.url.clone(),
                status,
            });
        }
        let body = response.text().map_err(to_error)?;
        log::info!("Orchestrator acknowledged completion: {}", body.trim());
        Ok(body)
    }
}
