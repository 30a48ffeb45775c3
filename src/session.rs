//! Narrow browser capability surface the executor drives.
//!
//! The engine never talks to a browser library directly; it goes through
//! [`BrowserSession`] so the whole pipeline can run against a stub in tests
//! and against Chrome in production.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure classification for browser operations. Only not-visible and
/// timeout failures escalate the click fallback chain; everything else
/// aborts immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    NotVisible,
    Timeout,
    Other,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn not_visible(message: impl Into<String>) -> Self {
        Self {
            kind: SessionErrorKind::NotVisible,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: SessionErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: SessionErrorKind::Other,
            message: message.into(),
        }
    }

    /// Classify a browser backend error by message. Headless engines report
    /// visibility and timeout failures as text only.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("not visible") || lower.contains("not clickable") {
            SessionErrorKind::NotVisible
        } else if lower.contains("timed out") || lower.contains("timeout") {
            SessionErrorKind::Timeout
        } else {
            SessionErrorKind::Other
        };
        Self { kind, message }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            SessionErrorKind::NotVisible | SessionErrorKind::Timeout
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Options for one click attempt. `last` targets the final match instead of
/// the first (portals often render a hidden copy of a nav item before the
/// visible one); `force` bypasses the visibility check.
#[derive(Debug, Clone, Copy)]
pub struct ClickOptions {
    pub timeout_ms: u64,
    pub force: bool,
    pub last: bool,
    pub no_wait_after: bool,
}

impl Default for ClickOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            force: false,
            last: false,
            no_wait_after: false,
        }
    }
}

/// One exclusive browser session for the lifetime of a run.
///
/// Selectors are CSS, or the internal text-match form `text=<visible text>`
/// produced by selector normalization.
pub trait BrowserSession: Send {
    fn navigate(&mut self, url: &str) -> SessionResult<()>;

    /// Current page HTML, fed to the interpreter as context.
    fn current_content(&mut self) -> SessionResult<String>;

    fn screenshot(&mut self, path: &Path) -> SessionResult<()>;

    /// Best-effort JPEG screenshot for the interpreter. `None` when the
    /// backend cannot produce one; interpretation proceeds without it.
    fn screenshot_base64(&mut self) -> Option<String>;

    fn click(&mut self, selector: &str, opts: ClickOptions) -> SessionResult<()>;

    fn fill(&mut self, selector: &str, value: &str) -> SessionResult<()>;

    fn hover(&mut self, selector: &str) -> SessionResult<()>;

    fn press_key(&mut self, key: &str) -> SessionResult<()>;

    fn scroll_by(&mut self, pixels: i64) -> SessionResult<()>;

    fn wait(&mut self, ms: u64);

    fn select_option(&mut self, selector: &str, value: &str) -> SessionResult<()>;

    /// Outer HTML of every element matching `selector`, in document order.
    /// The extraction heuristics work on these fragments.
    fn outer_html_all(&mut self, selector: &str) -> SessionResult<Vec<String>>;

    /// Click `selector` and wait for the triggered download, storing the
    /// file at `dest`. Returns the final path.
    fn download(&mut self, selector: &str, dest: &Path) -> SessionResult<PathBuf>;
}
