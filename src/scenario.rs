//! Scenario resolution: declarative definitions first, stored free text as
//! the fallback.
//!
//! A declarative scenario is a YAML file named after the ASP key, holding
//! pre-compiled action lists per execution type plus a retry policy. When no
//! file covers the requested type, the stored scenario text on the ASP row
//! is used: a JSON array parses straight into actions, anything else is
//! treated as numbered free-text steps for the interpreter.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::store::RecordStore;
use crate::types::{Action, ExecutionType, RetryPolicy, Step};

static NUMBERED_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+[.)]\s*").unwrap());

/// A resolved scenario: ordered steps plus the whole-run retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub steps: Vec<Step>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    asp_name_in_db: Option<String>,
    #[serde(default)]
    daily: Option<TypeConfig>,
    #[serde(default)]
    monthly: Option<TypeConfig>,
    #[serde(default)]
    retry: Option<RetryPolicy>,
}

#[derive(Debug, Deserialize)]
struct TypeConfig {
    actions: Vec<Action>,
}

impl ScenarioFile {
    fn for_type(&self, execution_type: ExecutionType) -> Option<&TypeConfig> {
        match execution_type {
            ExecutionType::Daily => self.daily.as_ref(),
            ExecutionType::Monthly => self.monthly.as_ref(),
        }
    }

    fn db_name(&self, key: &str) -> String {
        self.asp_name_in_db
            .clone()
            .or_else(|| self.display_name.clone())
            .unwrap_or_else(|| key.to_string())
    }
}

pub struct ScenarioSource {
    dir: PathBuf,
    store: Arc<dyn RecordStore>,
}

impl ScenarioSource {
    pub fn new(dir: PathBuf, store: Arc<dyn RecordStore>) -> Self {
        Self { dir, store }
    }

    /// Resolve the steps and retry policy for one `(asp, execution type)`
    /// target. Missing in both sources is a resolution failure.
    pub fn resolve(
        &self,
        asp_key: &str,
        execution_type: ExecutionType,
    ) -> Result<Scenario, EngineError> {
        if let Some(file) = self.load_file(asp_key) {
            if let Some(config) = file.for_type(execution_type) {
                debug!(asp = asp_key, "resolved declarative scenario");
                return Ok(Scenario {
                    steps: config.actions.iter().cloned().map(Step::Action).collect(),
                    retry: file.retry.unwrap_or_default(),
                });
            }
        }

        let asp = self.store.get_asp(asp_key)?;
        let prompt = asp.and_then(|row| row.prompt);
        match prompt {
            Some(text) if !text.trim().is_empty() => {
                debug!(asp = asp_key, "resolved stored scenario");
                Ok(Scenario {
                    steps: parse_prompt(&text)?,
                    retry: RetryPolicy::default(),
                })
            }
            _ => Err(EngineError::Resolution(format!(
                "no scenario defined for {asp_key}/{}",
                execution_type.as_str()
            ))),
        }
    }

    /// ASP keys that have a declarative scenario file.
    pub fn list_files(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("yaml"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        keys.sort();
        keys
    }

    /// Render each declarative scenario to JSON and stamp it onto the
    /// matching ASP row, so the stored fallback stays in sync.
    pub fn sync_to_store(&self) -> Result<(), EngineError> {
        for key in self.list_files() {
            let Some(file) = self.load_file(&key) else { continue };
            let actions = file
                .daily
                .as_ref()
                .or(file.monthly.as_ref())
                .map(|c| &c.actions);
            let Some(actions) = actions else {
                warn!(asp = key, "scenario file has no actions, skipping sync");
                continue;
            };
            let json = serde_json::to_string_pretty(actions)
                .map_err(|e| EngineError::Resolution(e.to_string()))?;
            let db_name = file.db_name(&key);
            if self.store.set_asp_prompt(&db_name, &json)? {
                info!(asp = key, db_name, "scenario synced to store");
            } else {
                warn!(asp = key, db_name, "no matching ASP row for scenario");
            }
        }
        Ok(())
    }

    fn load_file(&self, asp_key: &str) -> Option<ScenarioFile> {
        let mut path = self.dir.join(format!("{asp_key}.yaml"));
        if !path.exists() {
            path = self.dir.join(format!("{}.yaml", asp_key.to_lowercase()));
        }
        let text = std::fs::read_to_string(&path).ok()?;
        match serde_yaml::from_str(&text) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), "scenario file unreadable: {e}");
                None
            }
        }
    }
}

/// Parse stored scenario text: a JSON array becomes structured actions,
/// anything else becomes free-text steps.
pub fn parse_prompt(text: &str) -> Result<Vec<Step>, EngineError> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        let actions: Vec<Action> = serde_json::from_str(trimmed)
            .map_err(|e| EngineError::Resolution(format!("stored scenario JSON invalid: {e}")))?;
        return Ok(actions.into_iter().map(Step::Action).collect());
    }
    Ok(parse_free_text(trimmed))
}

/// Split free text into steps: one per non-empty line, numbered-list
/// prefixes (`1. `, `2) `) stripped.
pub fn parse_free_text(text: &str) -> Vec<Step> {
    text.lines()
        .map(|line| NUMBERED_PREFIX.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .map(Step::Text)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::TargetTable;

    fn empty_store() -> Arc<dyn RecordStore> {
        Arc::new(SqliteStore::in_memory().unwrap())
    }

    fn store_with_prompt(dir: &std::path::Path, prompt: &str) -> Arc<dyn RecordStore> {
        let path = dir.join("store.db");
        let store = SqliteStore::open(&path).unwrap();
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute(
            "INSERT INTO asps (id, name, prompt) VALUES ('asp-1', 'afb', ?1)",
            [prompt],
        )
        .unwrap();
        Arc::new(store)
    }

    #[test]
    fn free_text_strips_numbered_prefixes_only() {
        let steps = parse_free_text(
            "1. https://example.com にアクセス\n\n2) 「日別」タブをクリック\nテーブルを抽出",
        );
        assert_eq!(
            steps,
            vec![
                Step::Text("https://example.com にアクセス".into()),
                Step::Text("「日別」タブをクリック".into()),
                Step::Text("テーブルを抽出".into()),
            ]
        );
    }

    #[test]
    fn json_prompt_parses_into_action_steps_in_order() {
        let prompt = r#"[
            {"action":"navigate","url":"https://example.com"},
            {"action":"extract","selector":"table","target":"daily"}
        ]"#;
        let steps = parse_prompt(prompt).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[0], Step::Action(Action::Navigate { .. })));
        match &steps[1] {
            Step::Action(Action::Extract { target, .. }) => {
                assert_eq!(*target, TargetTable::Daily)
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn declarative_file_wins_over_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("afb.yaml"),
            r#"
display_name: afb
daily:
  actions:
    - action: navigate
      url: https://www.afi-b.com/
    - action: extract
      selector: table
      target: daily
retry:
  max_attempts: 2
  delay_ms: 500
"#,
        )
        .unwrap();

        let source = ScenarioSource::new(dir.path().to_path_buf(), empty_store());
        let scenario = source.resolve("afb", ExecutionType::Daily).unwrap();
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(scenario.retry.max_attempts, 2);
        assert_eq!(scenario.retry.delay_ms, 500);

        // The file defines no monthly scenario and the store has no row.
        assert!(matches!(
            source.resolve("afb", ExecutionType::Monthly),
            Err(EngineError::Resolution(_))
        ));
    }

    #[test]
    fn stored_free_text_is_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_prompt(dir.path(), "1. ログインページを開く\n2. ログインする");
        let source = ScenarioSource::new(dir.path().join("scenarios"), store);
        let scenario = source.resolve("afb", ExecutionType::Daily).unwrap();
        assert_eq!(
            scenario.steps,
            vec![
                Step::Text("ログインページを開く".into()),
                Step::Text("ログインする".into()),
            ]
        );
        assert_eq!(scenario.retry, RetryPolicy::default());
    }

    #[test]
    fn missing_everywhere_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScenarioSource::new(dir.path().to_path_buf(), empty_store());
        assert!(matches!(
            source.resolve("nope", ExecutionType::Daily),
            Err(EngineError::Resolution(_))
        ));
    }
}
