use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("timed out after {}ms waiting for {condition}", elapsed.as_millis())]
    ConditionTimeout { condition: String, elapsed: Duration },

    #[error("region menu trigger not found: {0}")]
    RegionMenuNotFound(String),

    #[error("region '{region}' could not be selected: {reason}")]
    RegionNotSelectable { region: String, reason: String },

    #[error("no element matches {0}")]
    NoSuchElement(String),

    #[error("webdriver error {error}: {message}")]
    WebDriver { error: String, message: String },

    #[error("webdriver transport failed: {0}")]
    Transport(String),

    #[error("webdriver could not be started: {0}")]
    DriverStart(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        CrawlError::Transport(err.to_string())
    }
}

/// Failure of a best-effort step. The caller logs it and carries on with
/// degraded behavior instead of aborting the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableFailure {
    pub step: &'static str,
    pub reason: String,
}

impl RecoverableFailure {
    pub fn new(step: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            step,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for RecoverableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.reason)
    }
}

pub type StepResult = Result<(), RecoverableFailure>;
