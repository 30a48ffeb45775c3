//! Run orchestration: one state machine per `(asp, execution type)` target,
//! whole-run retry with linear backoff, and the sequential batch driver.
//!
//! A run resolves its scenario, opens one browser session, walks the steps
//! in order (interpreting free-text steps against the live page), and always
//! finalizes its execution-log row, whether the steps succeeded or not. The
//! batch driver runs targets one after another with a courtesy delay; one
//! portal failing never stops the rest.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::executor::ActionExecutor;
use crate::interpreter::StepInterpreter;
use crate::scenario::{Scenario, ScenarioSource};
use crate::session::{BrowserSession, SessionError};
use crate::store::RecordStore;
use crate::types::{Action, AspRow, ExecutionType, RetryPolicy, RunContext, RunStatus, Step};

/// Fallbacks applied when the ASP row carries no media / account item
/// assignment, so an unregistered scenario can still be test-run.
const DEFAULT_MEDIA_ID: &str = "default";
const DEFAULT_ACCOUNT_ITEM_ID: &str = "affiliate_reward";

static BRACKET_PHRASE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"「([^」]+)」").unwrap());
static BEFORE_UI_NOUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9A-Za-z\p{Hiragana}\p{Katakana}\p{Han}ー]+?)(?:ボタン|リンク|タブ|メニュー)")
        .unwrap()
});

/// Opens one exclusive browser session per run attempt.
pub type SessionFactory =
    Arc<dyn Fn() -> Result<Box<dyn BrowserSession>, SessionError> + Send + Sync>;

/// Outcome of one target, as reported by the batch driver.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub asp: String,
    pub execution_type: ExecutionType,
    pub success: bool,
    pub records_saved: u32,
    pub attempts: u32,
    pub error: Option<String>,
}

struct AttemptOutcome {
    retry: RetryPolicy,
    records_saved: u32,
    error: Option<EngineError>,
}

/// Drives scenarios end to end. One instance serves a whole batch; each
/// `run` call is an independent single-use state machine.
pub struct Runner {
    source: ScenarioSource,
    store: Arc<dyn RecordStore>,
    interpreter: Arc<dyn StepInterpreter>,
    executor: ActionExecutor,
    sessions: SessionFactory,
    screenshots_dir: PathBuf,
}

impl Runner {
    pub fn new(
        source: ScenarioSource,
        store: Arc<dyn RecordStore>,
        interpreter: Arc<dyn StepInterpreter>,
        executor: ActionExecutor,
        sessions: SessionFactory,
        screenshots_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            store,
            interpreter,
            executor,
            sessions,
            screenshots_dir,
        }
    }

    /// Run one target to completion, retrying whole attempts under the
    /// scenario's policy with linear backoff. Only the final attempt's
    /// failure is reported.
    pub async fn run(&self, asp_key: &str, execution_type: ExecutionType) -> RunReport {
        let mut attempt = 1u32;
        loop {
            info!(asp = asp_key, attempt, "starting run attempt");
            let outcome = self.attempt(asp_key, execution_type).await;
            let Some(err) = outcome.error else {
                return RunReport {
                    asp: asp_key.to_string(),
                    execution_type,
                    success: true,
                    records_saved: outcome.records_saved,
                    attempts: attempt,
                    error: None,
                };
            };
            if attempt < outcome.retry.max_attempts && outcome.retry.should_retry(err.class()) {
                let delay_ms = outcome.retry.delay_ms * u64::from(attempt);
                warn!(asp = asp_key, attempt, delay_ms, "attempt failed ({err}), retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
                continue;
            }
            return RunReport {
                asp: asp_key.to_string(),
                execution_type,
                success: false,
                records_saved: outcome.records_saved,
                attempts: attempt,
                error: Some(err.to_string()),
            };
        }
    }

    /// One full attempt: resolve, open a session, drive steps, finalize.
    /// Finalization runs on every exit path that got as far as a log row.
    async fn attempt(&self, asp_key: &str, execution_type: ExecutionType) -> AttemptOutcome {
        let mut outcome = AttemptOutcome {
            retry: RetryPolicy::default(),
            records_saved: 0,
            error: None,
        };

        let scenario = match self.source.resolve(asp_key, execution_type) {
            Ok(scenario) => scenario,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.retry = scenario.retry.clone();

        let asp = match self.store.get_asp(asp_key) {
            Ok(Some(row)) => row,
            Ok(None) => {
                info!(asp = asp_key, "no ASP row registered, using synthetic metadata");
                AspRow::synthetic(asp_key)
            }
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };
        let ctx = RunContext {
            asp_id: asp.id.clone(),
            asp_name: asp.name.clone(),
            media_id: asp.media_id.unwrap_or_else(|| DEFAULT_MEDIA_ID.to_string()),
            account_item_id: asp
                .account_item_id
                .unwrap_or_else(|| DEFAULT_ACCOUNT_ITEM_ID.to_string()),
            execution_type,
            today: Utc::now().date_naive(),
        };

        let log_id = match self.store.create_execution_log(
            ctx.asp_id.as_deref(),
            execution_type,
            &json!({ "asp": ctx.asp_name, "steps": scenario.steps.len() }),
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("execution log not created: {e}");
                None
            }
        };

        let factory = self.sessions.clone();
        let mut session = match tokio::task::spawn_blocking(move || factory()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                let err = EngineError::ActionFatal(format!("browser launch failed: {e}"));
                self.finalize(log_id, &ctx, 0, Some(&err));
                outcome.error = Some(err);
                return outcome;
            }
            Err(e) => {
                let err = EngineError::ActionFatal(format!("browser launch task failed: {e}"));
                self.finalize(log_id, &ctx, 0, Some(&err));
                outcome.error = Some(err);
                return outcome;
            }
        };

        let mut saved = 0u32;
        let result = self
            .drive_steps(&scenario, session.as_mut(), &ctx, &mut saved)
            .await;
        if result.is_err() {
            let shot = self.screenshots_dir.join(format!(
                "{}_{}_error.png",
                ctx.asp_name,
                execution_type.as_str()
            ));
            if let Err(e) = session.screenshot(&shot) {
                debug!("error screenshot not taken: {e}");
            }
        }
        self.finalize(log_id, &ctx, saved, result.as_ref().err());

        outcome.records_saved = saved;
        outcome.error = result.err();
        outcome
        // Dropping the session closes the browser.
    }

    async fn drive_steps(
        &self,
        scenario: &Scenario,
        session: &mut dyn BrowserSession,
        ctx: &RunContext,
        saved: &mut u32,
    ) -> Result<(), EngineError> {
        for (index, step) in scenario.steps.iter().enumerate() {
            debug!(step = index + 1, total = scenario.steps.len(), "running step");
            let result = self.run_step(step, session, ctx, saved).await;

            let shot = self.screenshots_dir.join(format!(
                "{}_{}_step{:02}.png",
                ctx.asp_name,
                ctx.execution_type.as_str(),
                index + 1
            ));
            if let Err(e) = session.screenshot(&shot) {
                debug!("debug screenshot not taken: {e}");
            }

            result?;
        }
        Ok(())
    }

    /// Execute one step. Free text is interpreted fresh against the current
    /// page, since page state differs between attempts. The interpreter may
    /// return several actions; the list aborts on its first failure.
    async fn run_step(
        &self,
        step: &Step,
        session: &mut dyn BrowserSession,
        ctx: &RunContext,
        saved: &mut u32,
    ) -> Result<(), EngineError> {
        let (actions, instruction) = match step {
            Step::Action(action) => (vec![action.clone()], None),
            Step::Text(text) => {
                let page = session.current_content().unwrap_or_default();
                let screenshot = session.screenshot_base64();
                let actions = self
                    .interpreter
                    .interpret(text, &page, screenshot.as_deref())
                    .await?;
                (actions, Some(text.as_str()))
            }
        };

        for action in &actions {
            match self.executor.execute(action, session, ctx) {
                Ok(result) => *saved += result.records_saved,
                Err(e) => {
                    let fallback = instruction
                        .filter(|_| matches!(action, Action::Click { .. }))
                        .and_then(fallback_click_text);
                    let Some(text) = fallback else {
                        return Err(e);
                    };
                    warn!("click failed ({e}), retrying as text match \"{text}\"");
                    let retry = Action::Click {
                        selector: format!("text={text}"),
                        timeout_ms: 10_000,
                        no_wait_after: false,
                    };
                    self.executor.execute(&retry, session, ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Terminal bookkeeping: execution-log row and best-effort ASP status
    /// stamp. A failed attempt that still saved records counts as partial.
    fn finalize(
        &self,
        log_id: Option<i64>,
        ctx: &RunContext,
        saved: u32,
        err: Option<&EngineError>,
    ) {
        let status = match (err, saved) {
            (None, _) => RunStatus::Success,
            (Some(_), saved) if saved > 0 => RunStatus::Partial,
            (Some(_), _) => RunStatus::Failed,
        };
        let message = err.map(|e| e.to_string());
        if let Some(log_id) = log_id {
            if let Err(e) =
                self.store
                    .finalize_execution_log(log_id, status, saved, message.as_deref())
            {
                warn!("execution log not finalized: {e}");
            }
        }
        if let Some(asp_id) = ctx.asp_id.as_deref() {
            if let Err(e) = self
                .store
                .stamp_asp_status(asp_id, status.as_str(), message.as_deref())
            {
                warn!("asp status not stamped: {e}");
            }
        }
    }

    /// Run targets sequentially with a courtesy delay between portals. A
    /// failed target is reported and the batch moves on.
    pub async fn run_batch(
        &self,
        targets: &[String],
        execution_type: ExecutionType,
        delay: Duration,
    ) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(targets.len());
        for (index, asp) in targets.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let report = self.run(asp, execution_type).await;
            match &report.error {
                None => info!(
                    asp,
                    records = report.records_saved,
                    attempts = report.attempts,
                    "target succeeded"
                ),
                Some(e) => error!(asp, attempts = report.attempts, "target failed: {e}"),
            }
            reports.push(report);
        }
        reports
    }
}

/// Phrase to retry a failed interpreted click with: a bracket-quoted phrase
/// from the instruction, or the word preceding a known UI noun.
fn fallback_click_text(instruction: &str) -> Option<String> {
    if let Some(captures) = BRACKET_PHRASE.captures(instruction) {
        return Some(captures[1].to_string());
    }
    BEFORE_UI_NOUN
        .captures(instruction)
        .map(|captures| captures[1].to_string())
}
