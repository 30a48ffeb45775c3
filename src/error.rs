use thiserror::Error;

/// Error taxonomy for a scenario run. Extraction that finds no data is not
/// an error (it reports zero records); persistence failures are logged and
/// undercount rather than abort.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No scenario, metadata or credentials could be resolved. Fatal for the
    /// attempt; the whole-run retry wrapper still applies.
    #[error("scenario resolution failed: {0}")]
    Resolution(String),

    /// The interpreter returned unparseable or blocked output. Never
    /// retried at step level.
    #[error("step interpretation failed: {0}")]
    Interpretation(String),

    /// Selector not visible or operation timed out after the in-process
    /// fallback chain was exhausted.
    #[error("action timed out or target not visible: {0}")]
    ActionTransient(String),

    /// Any other action failure (navigation error, unsupported input).
    #[error("action failed: {0}")]
    ActionFatal(String),

    /// Record store write or read failed.
    #[error("record store failure: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Class name matched against a scenario's `retry_on` list.
    pub fn class(&self) -> &'static str {
        match self {
            EngineError::Resolution(_) => "resolution",
            EngineError::Interpretation(_) => "interpretation",
            EngineError::ActionTransient(_) => "timeout",
            EngineError::ActionFatal(_) => "action_failed",
            EngineError::Persistence(_) => "persistence",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}
