use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::parse::month_end;

/// One entry in a scenario. Free text goes through the interpreter first;
/// a structured action is executed as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Text(String),
    Action(Action),
}

/// A single atomic browser operation the executor knows how to perform.
///
/// The `action` tag matches what the interpreter is prompted to emit and what
/// declarative scenario files store, so stored JSON round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
        #[serde(default = "default_click_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        no_wait_after: bool,
    },
    Fill {
        selector: String,
        value: String,
    },
    Hover {
        selector: String,
    },
    Scroll {
        pixels: i64,
    },
    Wait {
        ms: u64,
    },
    Keyboard {
        key: String,
    },
    Screenshot {
        path: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Download {
        selector: String,
        path: String,
    },
    Extract {
        selector: String,
        target: TargetTable,
        #[serde(default)]
        amount_column: Option<String>,
        #[serde(default)]
        horizontal: bool,
    },
    ExtractCsv {
        path: String,
        target: TargetTable,
        date_column: String,
        amount_column: String,
    },
    /// Sentinel emitted when interpretation fails. Always fails the step.
    Error {
        message: String,
    },
}

fn default_click_timeout_ms() -> u64 {
    10_000
}

/// Which actuals table an extraction feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTable {
    Daily,
    Monthly,
}

/// Daily runs collect per-day figures, monthly runs per-month figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExecutionType {
    Daily,
    Monthly,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Daily => "daily",
            ExecutionType::Monthly => "monthly",
        }
    }
}

/// Temporal key of one observed revenue figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemporalKey {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
}

impl TemporalKey {
    /// Calendar date used for persistence. Periods are stored as the last
    /// day of their month.
    pub fn storage_date(&self) -> NaiveDate {
        match *self {
            TemporalKey::Day(d) => d,
            TemporalKey::Month { year, month } => month_end(year, month),
        }
    }
}

/// One `(date-or-period, amount)` observation destined for the store.
/// Amounts are integer minor units (yen).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub key: TemporalKey,
    pub amount: i64,
}

/// Whole-run retry policy attached to a scenario. The per-click fallback
/// chain inside the executor is separate and always applies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    2_000
}

fn default_retry_on() -> Vec<String> {
    vec![
        "timeout".to_string(),
        "action_failed".to_string(),
        "resolution".to_string(),
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, error_class: &str) -> bool {
        self.retry_on.iter().any(|c| c == error_class)
    }
}

/// Outcome of one executed action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub records_saved: u32,
}

/// Terminal (or in-flight) status of an execution-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }
}

/// ASP row as the store knows it. `id` is `None` for a synthetic row built
/// for a scenario that has not been registered yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AspRow {
    pub id: Option<String>,
    pub name: String,
    pub login_url: Option<String>,
    pub prompt: Option<String>,
    pub media_id: Option<String>,
    pub account_item_id: Option<String>,
}

impl AspRow {
    /// Minimal metadata for an ASP the store has no row for, so new
    /// scenarios can be test-run before formal registration.
    pub fn synthetic(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Secret-key references for one `(asp, media)` portal account.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub username_key: String,
    pub password_key: String,
}

/// Everything an action needs to know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub asp_id: Option<String>,
    pub asp_name: String,
    pub media_id: String,
    pub account_item_id: String,
    pub execution_type: ExecutionType,
    /// Reference date for year inference in date parsing.
    pub today: NaiveDate,
}
