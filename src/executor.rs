//! The command interpreter: one structured [`Action`] in, browser capability
//! calls out.
//!
//! Carries the selector-repair and click-fallback heuristics accumulated
//! from running against real portals: headless engines resolve positional
//! pseudo-selectors inconsistently against dynamically rendered rows, nav
//! items often exist twice with the first copy hidden, and interpreter
//! output mixes CSS with plain visible text.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::csvfile::read_csv_records;
use crate::error::EngineError;
use crate::session::{BrowserSession, ClickOptions, SessionError};
use crate::store::RecordStore;
use crate::table::extract_from_tables;
use crate::types::{Action, ExecResult, Record, RunContext, TargetTable};

static CONTAINS_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#":contains\(['"](.+?)['"]\)"#).unwrap());
static SECRET_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{SECRET:([A-Z0-9_]+)\}").unwrap());

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Executes one action against a browser session, persisting extracted
/// records through the store.
pub struct ActionExecutor {
    store: Arc<dyn RecordStore>,
    env: EnvLookup,
}

impl ActionExecutor {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Override secret lookup, for tests.
    #[cfg(test)]
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    pub fn execute(
        &self,
        action: &Action,
        session: &mut dyn BrowserSession,
        ctx: &RunContext,
    ) -> Result<ExecResult, EngineError> {
        debug!(?action, "executing");
        match action {
            Action::Navigate { url } => {
                session
                    .navigate(url)
                    .map_err(|e| EngineError::ActionFatal(e.to_string()))?;
                Ok(ExecResult::default())
            }
            Action::Click {
                selector,
                timeout_ms,
                no_wait_after,
            } => {
                self.click_with_fallback(session, selector, *timeout_ms, *no_wait_after)?;
                Ok(ExecResult::default())
            }
            Action::Fill { selector, value } => {
                let value = self.resolve_secrets(value, ctx);
                session
                    .fill(&normalize_selector(selector), &value)
                    .map_err(map_session_error)?;
                Ok(ExecResult::default())
            }
            Action::Hover { selector } => {
                session
                    .hover(&normalize_selector(selector))
                    .map_err(map_session_error)?;
                Ok(ExecResult::default())
            }
            Action::Scroll { pixels } => {
                session.scroll_by(*pixels).map_err(map_session_error)?;
                Ok(ExecResult::default())
            }
            Action::Wait { ms } => {
                session.wait(*ms);
                Ok(ExecResult::default())
            }
            Action::Keyboard { key } => {
                session.press_key(key).map_err(map_session_error)?;
                Ok(ExecResult::default())
            }
            Action::Screenshot { path } => {
                session
                    .screenshot(Path::new(path))
                    .map_err(map_session_error)?;
                Ok(ExecResult::default())
            }
            Action::Select { selector, value } => {
                session
                    .select_option(selector, value)
                    .map_err(map_session_error)?;
                Ok(ExecResult::default())
            }
            Action::Download { selector, path } => {
                let stored = session
                    .download(&normalize_selector(selector), Path::new(path))
                    .map_err(map_session_error)?;
                info!(path = %stored.display(), "file downloaded");
                Ok(ExecResult::default())
            }
            Action::Extract {
                selector,
                target,
                amount_column,
                horizontal,
            } => {
                let tables = match session.outer_html_all(selector) {
                    Ok(tables) => tables,
                    Err(e) if e.is_transient() => {
                        // Nothing matching the table selector is the
                        // no-data case, not a scraping failure.
                        warn!("no elements for extract selector {selector}: {e}");
                        Vec::new()
                    }
                    Err(e) => return Err(EngineError::ActionFatal(e.to_string())),
                };
                let records = extract_from_tables(
                    &tables,
                    *target,
                    amount_column.as_deref(),
                    *horizontal,
                    ctx.today,
                );
                if records.is_empty() {
                    info!(selector, "no records extracted");
                    return Ok(ExecResult::default());
                }
                let saved = self.persist(&records, *target, ctx)?;
                Ok(ExecResult {
                    records_saved: saved,
                })
            }
            Action::ExtractCsv {
                path,
                target,
                date_column,
                amount_column,
            } => {
                let records = read_csv_records(
                    Path::new(path),
                    date_column,
                    amount_column,
                    *target,
                    ctx.today,
                )?;
                if records.is_empty() {
                    info!(path, "no records in csv");
                    return Ok(ExecResult::default());
                }
                let saved = self.persist(&records, *target, ctx)?;
                Ok(ExecResult {
                    records_saved: saved,
                })
            }
            Action::Error { message } => Err(EngineError::Interpretation(message.clone())),
        }
    }

    /// Three-tier click: first match, then last match, then force-click the
    /// first match. Only not-visible/timeout failures escalate.
    fn click_with_fallback(
        &self,
        session: &mut dyn BrowserSession,
        selector: &str,
        timeout_ms: u64,
        no_wait_after: bool,
    ) -> Result<(), EngineError> {
        let selector = normalize_selector(selector);
        let base = ClickOptions {
            timeout_ms,
            no_wait_after,
            ..Default::default()
        };

        let Err(first) = session.click(&selector, base) else {
            return Ok(());
        };
        if !first.is_transient() {
            return Err(EngineError::ActionFatal(first.to_string()));
        }

        warn!(selector, "click failed ({first}), retrying last match");
        let Err(second) = session.click(
            &selector,
            ClickOptions {
                last: true,
                ..base
            },
        ) else {
            return Ok(());
        };
        if !second.is_transient() {
            return Err(EngineError::ActionFatal(second.to_string()));
        }

        warn!(selector, "click still failing ({second}), force-clicking");
        session
            .click(
                &selector,
                ClickOptions {
                    force: true,
                    ..base
                },
            )
            .map_err(map_session_error)
    }

    /// Replace `{SECRET:KEY}` placeholders. Keys ending in `_USERNAME` /
    /// `_PASSWORD` resolve through the per-(asp, media) credential row to a
    /// secret-key reference first, then the environment. Unresolved
    /// placeholders stay in place so the failure shows up in screenshots.
    fn resolve_secrets(&self, value: &str, ctx: &RunContext) -> String {
        let mut out = value.to_string();
        for cap in SECRET_PLACEHOLDER.captures_iter(value) {
            let key = &cap[1];
            match self.lookup_secret(key, ctx) {
                Some(secret) => {
                    out = out.replace(&format!("{{SECRET:{key}}}"), &secret);
                }
                None => warn!(key, "secret not found, placeholder left in value"),
            }
        }
        out
    }

    fn lookup_secret(&self, key: &str, ctx: &RunContext) -> Option<String> {
        let is_username = key.ends_with("_USERNAME");
        if is_username || key.ends_with("_PASSWORD") {
            if let Some(asp_id) = &ctx.asp_id {
                let credential = self
                    .store
                    .get_credential(asp_id, &ctx.media_id)
                    .unwrap_or_else(|e| {
                        warn!("credential lookup failed: {e}");
                        None
                    });
                if let Some(credential) = credential {
                    let env_key = if is_username {
                        &credential.username_key
                    } else {
                        &credential.password_key
                    };
                    if let Some(secret) = (self.env)(env_key) {
                        return Some(secret);
                    }
                }
            }
        }
        (self.env)(key)
    }

    /// Delete-then-insert for the window the batch covers, so a re-scrape
    /// supersedes instead of duplicating. Individual write failures
    /// undercount but never abort.
    fn persist(
        &self,
        records: &[Record],
        target: TargetTable,
        ctx: &RunContext,
    ) -> Result<u32, EngineError> {
        let Some(asp_id) = ctx.asp_id.as_deref() else {
            warn!(asp = ctx.asp_name, "ASP not registered, extracted records not persisted");
            return Ok(0);
        };

        let dates: Vec<_> = records.iter().map(|r| r.key.storage_date()).collect();
        let (start, end) = match (dates.iter().min(), dates.iter().max()) {
            (Some(&start), Some(&end)) => (start, end),
            _ => return Ok(0),
        };
        if let Err(e) = self
            .store
            .delete_range(asp_id, &ctx.media_id, start, end, target)
        {
            warn!("stale record delete failed: {e}");
        }

        let mut saved = 0;
        for record in records {
            let result = match target {
                TargetTable::Daily => self.store.upsert_daily(
                    record.key.storage_date(),
                    record.amount,
                    &ctx.media_id,
                    &ctx.account_item_id,
                    asp_id,
                ),
                TargetTable::Monthly => self.store.upsert_monthly(
                    record.key.storage_date(),
                    record.amount,
                    &ctx.media_id,
                    &ctx.account_item_id,
                    asp_id,
                ),
            };
            match result {
                Ok(()) => saved += 1,
                Err(e) => warn!("record not stored: {e}"),
            }
        }
        info!(saved, total = records.len(), "records persisted");
        Ok(saved)
    }
}

fn map_session_error(e: SessionError) -> EngineError {
    if e.is_transient() {
        EngineError::ActionTransient(e.to_string())
    } else {
        EngineError::ActionFatal(e.to_string())
    }
}

/// Repair selectors before use:
/// fragile positional pseudo-selectors are stripped (locator semantics pick
/// the first match anyway), jQuery `:contains` becomes a text match, and a
/// bare string with no CSS syntax is treated as visible text.
pub fn normalize_selector(raw: &str) -> String {
    let stripped = raw
        .replace(":first-of-type", "")
        .replace(":nth-of-type(1)", "");
    let stripped = stripped.trim();

    if let Some(cap) = CONTAINS_SYNTAX.captures(stripped) {
        return format!("text={}", &cap[1]);
    }
    if !stripped.starts_with("text=")
        && !stripped
            .chars()
            .any(|c| matches!(c, '#' | '.' | '[' | '>' | '=' | ':' | ' '))
    {
        return format!("text={stripped}");
    }
    stripped.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::ExecutionType;
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq)]
    struct ClickCall {
        selector: String,
        last: bool,
        force: bool,
    }

    /// Scriptable session: clicks consume queued results, fills are
    /// recorded, extraction selectors return canned HTML.
    #[derive(Default)]
    struct StubSession {
        click_results: VecDeque<Result<(), SessionError>>,
        clicks: Vec<ClickCall>,
        fills: Vec<(String, String)>,
        tables: Vec<String>,
    }

    impl BrowserSession for StubSession {
        fn navigate(&mut self, _url: &str) -> crate::session::SessionResult<()> {
            Ok(())
        }
        fn current_content(&mut self) -> crate::session::SessionResult<String> {
            Ok("<html></html>".into())
        }
        fn screenshot(&mut self, _path: &Path) -> crate::session::SessionResult<()> {
            Ok(())
        }
        fn screenshot_base64(&mut self) -> Option<String> {
            None
        }
        fn click(
            &mut self,
            selector: &str,
            opts: ClickOptions,
        ) -> crate::session::SessionResult<()> {
            self.clicks.push(ClickCall {
                selector: selector.to_string(),
                last: opts.last,
                force: opts.force,
            });
            self.click_results.pop_front().unwrap_or(Ok(()))
        }
        fn fill(&mut self, selector: &str, value: &str) -> crate::session::SessionResult<()> {
            self.fills.push((selector.to_string(), value.to_string()));
            Ok(())
        }
        fn hover(&mut self, _selector: &str) -> crate::session::SessionResult<()> {
            Ok(())
        }
        fn press_key(&mut self, _key: &str) -> crate::session::SessionResult<()> {
            Ok(())
        }
        fn scroll_by(&mut self, _pixels: i64) -> crate::session::SessionResult<()> {
            Ok(())
        }
        fn wait(&mut self, _ms: u64) {}
        fn select_option(
            &mut self,
            _selector: &str,
            _value: &str,
        ) -> crate::session::SessionResult<()> {
            Ok(())
        }
        fn outer_html_all(
            &mut self,
            _selector: &str,
        ) -> crate::session::SessionResult<Vec<String>> {
            Ok(self.tables.clone())
        }
        fn download(
            &mut self,
            _selector: &str,
            dest: &Path,
        ) -> crate::session::SessionResult<PathBuf> {
            Ok(dest.to_path_buf())
        }
    }

    fn seeded_store() -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        Arc::new(store)
    }

    fn ctx() -> RunContext {
        RunContext {
            asp_id: Some("asp-1".into()),
            asp_name: "afb".into(),
            media_id: "media-1".into(),
            account_item_id: "item-1".into(),
            execution_type: ExecutionType::Daily,
            today: NaiveDate::from_ymd_opt(2025, 11, 30).unwrap(),
        }
    }

    #[test]
    fn normalizes_fragile_and_textual_selectors() {
        assert_eq!(normalize_selector("li.nav:first-of-type"), "li.nav");
        assert_eq!(normalize_selector("tr:nth-of-type(1) td"), "tr td");
        assert_eq!(normalize_selector("a:contains('日別レポート')"), "text=日別レポート");
        assert_eq!(normalize_selector(r#"a:contains("Report")"#), "text=Report");
        assert_eq!(normalize_selector("日別レポート"), "text=日別レポート");
        assert_eq!(normalize_selector("#login"), "#login");
        assert_eq!(normalize_selector("button[type='submit']"), "button[type='submit']");
        assert_eq!(normalize_selector("text=ログイン"), "text=ログイン");
    }

    #[test]
    fn click_escalates_through_tiers_on_transient_errors() {
        let mut session = StubSession::default();
        session.click_results = VecDeque::from([
            Err(SessionError::timeout("timed out")),
            Err(SessionError::not_visible("element is not visible")),
            Ok(()),
        ]);
        let executor = ActionExecutor::new(seeded_store());
        let action = Action::Click {
            selector: "ログイン".into(),
            timeout_ms: 5_000,
            no_wait_after: false,
        };
        executor.execute(&action, &mut session, &ctx()).unwrap();

        assert_eq!(session.clicks.len(), 3);
        assert_eq!(
            session.clicks[0],
            ClickCall { selector: "text=ログイン".into(), last: false, force: false }
        );
        assert_eq!(
            session.clicks[1],
            ClickCall { selector: "text=ログイン".into(), last: true, force: false }
        );
        assert_eq!(
            session.clicks[2],
            ClickCall { selector: "text=ログイン".into(), last: false, force: true }
        );
    }

    #[test]
    fn non_transient_click_error_stops_the_chain() {
        let mut session = StubSession::default();
        session.click_results =
            VecDeque::from([Err(SessionError::other("net::ERR_CONNECTION_RESET"))]);
        let executor = ActionExecutor::new(seeded_store());
        let action = Action::Click {
            selector: "#go".into(),
            timeout_ms: 5_000,
            no_wait_after: false,
        };
        let err = executor.execute(&action, &mut session, &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::ActionFatal(_)));
        assert_eq!(session.clicks.len(), 1);
    }

    #[test]
    fn exhausted_tiers_report_transient_failure() {
        let mut session = StubSession::default();
        session.click_results = VecDeque::from([
            Err(SessionError::timeout("timed out")),
            Err(SessionError::timeout("timed out")),
            Err(SessionError::timeout("timed out")),
        ]);
        let executor = ActionExecutor::new(seeded_store());
        let action = Action::Click {
            selector: "#go".into(),
            timeout_ms: 1_000,
            no_wait_after: false,
        };
        let err = executor.execute(&action, &mut session, &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::ActionTransient(_)));
        assert_eq!(session.clicks.len(), 3);
    }

    #[test]
    fn fill_resolves_secret_via_credential_row() {
        // Credential row maps the placeholder key to a secret-key
        // reference; the env lookup serves that reference.
        let store = SqliteStore::in_memory().unwrap();
        store
            .conn_for_tests()
            .execute(
                "INSERT INTO asp_credentials (asp_id, media_id, username_key, password_key)
                 VALUES ('asp-1', 'media-1', 'AFB_LOGIN_ID', 'AFB_LOGIN_PW')",
                [],
            )
            .unwrap();
        let executor = ActionExecutor::new(Arc::new(store)).with_env(Arc::new(|key| {
            (key == "AFB_LOGIN_ID").then(|| "alice".to_string())
        }));

        let mut session = StubSession::default();
        let action = Action::Fill {
            selector: "input[name='login_name']".into(),
            value: "{SECRET:X_USERNAME}".into(),
        };
        executor.execute(&action, &mut session, &ctx()).unwrap();
        assert_eq!(session.fills[0].1, "alice");
    }

    #[test]
    fn unresolved_secret_stays_in_place() {
        let executor =
            ActionExecutor::new(seeded_store()).with_env(Arc::new(|_| None));
        let mut session = StubSession::default();
        let action = Action::Fill {
            selector: "#pw".into(),
            value: "{SECRET:MISSING_KEY}".into(),
        };
        executor.execute(&action, &mut session, &ctx()).unwrap();
        assert_eq!(session.fills[0].1, "{SECRET:MISSING_KEY}");
    }

    #[test]
    fn extract_persists_and_is_idempotent() {
        let html = "<table><tr><td>日付</td><td>発生報酬</td></tr>\
                    <tr><td>2025/11/01</td><td>¥1,200</td></tr>\
                    <tr><td>2025/11/02</td><td>2,300円</td></tr></table>";
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let executor = ActionExecutor::new(store.clone() as Arc<dyn RecordStore>);
        let mut session = StubSession {
            tables: vec![html.to_string()],
            ..Default::default()
        };
        let action = Action::Extract {
            selector: "table".into(),
            target: TargetTable::Daily,
            amount_column: None,
            horizontal: false,
        };

        let first = executor.execute(&action, &mut session, &ctx()).unwrap();
        assert_eq!(first.records_saved, 2);
        // Re-running the same extract supersedes, never duplicates.
        let second = executor.execute(&action, &mut session, &ctx()).unwrap();
        assert_eq!(second.records_saved, 2);

        let rows: i64 = store
            .conn_for_tests()
            .query_row("SELECT COUNT(*) FROM daily_actuals", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn extract_with_no_matching_tables_is_zero_record_success() {
        let executor = ActionExecutor::new(seeded_store());
        let mut session = StubSession::default();
        let action = Action::Extract {
            selector: "table.report".into(),
            target: TargetTable::Daily,
            amount_column: None,
            horizontal: false,
        };
        let result = executor.execute(&action, &mut session, &ctx()).unwrap();
        assert_eq!(result.records_saved, 0);
    }

    #[test]
    fn error_action_always_fails_as_interpretation() {
        let executor = ActionExecutor::new(seeded_store());
        let mut session = StubSession::default();
        let action = Action::Error {
            message: "blocked".into(),
        };
        let err = executor.execute(&action, &mut session, &ctx()).unwrap_err();
        assert!(matches!(err, EngineError::Interpretation(_)));
    }

    #[test]
    fn monthly_records_store_as_month_end() {
        let html = "<table><tr><td>2025年</td></tr>\
                    <tr><td>01月</td><td>02月</td></tr>\
                    <tr><td>¥100</td><td>¥200</td></tr></table>";
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let executor = ActionExecutor::new(store.clone() as Arc<dyn RecordStore>);
        let mut session = StubSession {
            tables: vec![html.to_string()],
            ..Default::default()
        };
        let action = Action::Extract {
            selector: "table".into(),
            target: TargetTable::Monthly,
            amount_column: None,
            horizontal: true,
        };
        let result = executor.execute(&action, &mut session, &ctx()).unwrap();
        assert_eq!(result.records_saved, 2);

        let dates: Vec<String> = {
            let conn = store.conn_for_tests();
            let mut stmt = conn
                .prepare("SELECT date FROM actuals ORDER BY date")
                .unwrap();
            let dates = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap();
            dates
        };
        assert_eq!(dates, vec!["2025-01-31", "2025-02-28"]);
    }
}
