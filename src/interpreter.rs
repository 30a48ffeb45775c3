//! Free-text step interpretation through a language model.
//!
//! One scenario step plus the current page context goes in, one or more
//! structured [`Action`]s come out. Interpretation failures surface as an
//! `Action::Error` sentinel, which the executor always fails on; transport
//! failures surface as [`EngineError::Interpretation`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::Action;

/// How much page HTML is handed to the model.
const PAGE_CONTEXT_MAX_CHARS: usize = 4_000;

const PROMPT_TEMPLATE: &str = r#"あなたはWebブラウザ操作のエキスパートです。
提供されたスクリーンショット（もしあれば）とHTMLコンテキストを使用して、
以下のシナリオステップを具体的なブラウザ操作コマンドに変換してください。

【シナリオステップ】
{step}

【現在のページ情報】
{page}

【指示】
このステップを実行するために必要な操作を、以下のJSON形式で返してください。
複数の操作が必要な場合はJSON配列で返してください。

- {"action":"navigate","url":"https://..."}
- {"action":"click","selector":"CSSセレクタまたはテキスト"}
- {"action":"fill","selector":"input[name='...']","value":"入力値"}
- {"action":"hover","selector":"CSSセレクタ"}
- {"action":"scroll","pixels":600}
- {"action":"wait","ms":3000}
- {"action":"keyboard","key":"Enter"}
- {"action":"select","selector":"select[name='...']","value":"値"}
- {"action":"download","selector":"CSVダウンロードボタンのセレクタ","path":"保存先"}
- {"action":"extract","selector":"table","target":"daily"}  (targetは daily または monthly)

必ずJSON形式のみを返してください。説明文は不要です。
"#;

/// Converts one free-text instruction plus page context into actions.
#[async_trait]
pub trait StepInterpreter: Send + Sync {
    async fn interpret(
        &self,
        instruction: &str,
        page_html: &str,
        screenshot_base64: Option<&str>,
    ) -> Result<Vec<Action>, EngineError>;
}

/// Gemini-backed interpreter.
pub struct GeminiInterpreter {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiInterpreter {
    pub fn new(api_key: String, model: String) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::Interpretation(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        screenshot_base64: Option<&str>,
    ) -> Result<GenerateOutcome, EngineError> {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some(image) = screenshot_base64 {
            parts.push(json!({
                "inline_data": { "mime_type": "image/jpeg", "data": image }
            }));
        }

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({ "contents": [{ "parts": parts }] }))
            .send()
            .await
            .map_err(|e| EngineError::Interpretation(format!("model request failed: {e}")))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Interpretation(format!("model response unreadable: {e}")))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(EngineError::Interpretation(format!(
                "model API error ({status}): {message}"
            )));
        }

        match body["candidates"][0]["content"]["parts"][0]["text"].as_str() {
            Some(text) => Ok(GenerateOutcome::Text(text.to_string())),
            None => Ok(GenerateOutcome::Blocked),
        }
    }
}

enum GenerateOutcome {
    Text(String),
    Blocked,
}

#[async_trait]
impl StepInterpreter for GeminiInterpreter {
    async fn interpret(
        &self,
        instruction: &str,
        page_html: &str,
        screenshot_base64: Option<&str>,
    ) -> Result<Vec<Action>, EngineError> {
        let page: String = page_html.chars().take(PAGE_CONTEXT_MAX_CHARS).collect();
        let prompt = PROMPT_TEMPLATE
            .replace("{step}", instruction)
            .replace("{page}", &page);

        let mut outcome = self.generate(&prompt, screenshot_base64).await?;
        if matches!(outcome, GenerateOutcome::Blocked) && screenshot_base64.is_some() {
            // Safety filters sometimes trip on the screenshot alone.
            info!("model response blocked, retrying without screenshot");
            outcome = self.generate(&prompt, None).await?;
        }

        let text = match outcome {
            GenerateOutcome::Text(text) => text,
            GenerateOutcome::Blocked => {
                return Ok(vec![Action::Error {
                    message: "model response was blocked by safety filters".to_string(),
                }]);
            }
        };

        let actions = parse_reply(&text);
        info!(step = instruction, ?actions, "interpreted step");
        Ok(actions)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InterpreterReply {
    Many(Vec<Action>),
    One(Action),
}

/// Parse a model reply into actions, tolerating markdown code fences. An
/// unparseable reply becomes the `Error` sentinel rather than a crash.
pub fn parse_reply(text: &str) -> Vec<Action> {
    let cleaned = strip_code_fences(text);
    match serde_json::from_str::<InterpreterReply>(cleaned) {
        Ok(InterpreterReply::Many(actions)) => actions,
        Ok(InterpreterReply::One(action)) => vec![action],
        Err(e) => {
            warn!("could not parse model reply: {e}; reply: {cleaned}");
            vec![Action::Error {
                message: format!("could not parse model reply: {e}"),
            }]
        }
    }
}

fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetTable;

    #[test]
    fn parses_single_action_with_markdown_fences() {
        let reply = "```json\n{\"action\":\"click\",\"selector\":\"text=日別レポート\"}\n```";
        let actions = parse_reply(reply);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Click { selector, .. } => assert_eq!(selector, "text=日別レポート"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn parses_action_list_preserving_order() {
        let reply = r##"[
            {"action":"fill","selector":"#user","value":"alice"},
            {"action":"click","selector":"#submit"}
        ]"##;
        let actions = parse_reply(reply);
        assert!(matches!(actions[0], Action::Fill { .. }));
        assert!(matches!(actions[1], Action::Click { .. }));
    }

    #[test]
    fn parses_extract_target() {
        let reply = r#"{"action":"extract","selector":"table.report","target":"monthly"}"#;
        match &parse_reply(reply)[0] {
            Action::Extract { target, .. } => assert_eq!(*target, TargetTable::Monthly),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn unparseable_reply_becomes_error_sentinel() {
        let actions = parse_reply("I could not figure this step out, sorry.");
        assert!(matches!(actions[0], Action::Error { .. }));
    }
}
