use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("resource: {0}")]
    Thread(#[from] osthread::ThreadError),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("scenario {scenario} failed: {message}")]
    ScenarioFailed {
        scenario: &'static str,
        message: String,
    },
    #[error("log {path} has {errors} invalid line(s)")]
    InvalidLog { path: String, errors: usize },
}

impl HarnessError {
    pub(crate) fn failed(scenario: &'static str, message: impl Into<String>) -> Self {
        Self::ScenarioFailed {
            scenario,
            message: message.into(),
        }
    }
}
