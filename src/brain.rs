//! Decision oracle: turns the current page and task history into exactly one
//! proposed action.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::page::PageIdentity;
use crate::state::{ActionSummary, TaskState};
use crate::store::{API_KEY_KEY, KeyValueStore};
use crate::types::{ActionDecision, ActionResult, InteractiveElement};

const SYSTEM_PROMPT: &str = r#"You are an assistant that helps users navigate web sites by performing ONE SINGLE ACTION at a time.

You decide exactly one action per request. After each action the page is observed again and you will be asked for the next action.

You receive:
1. The page TITLE and URL
2. The visible page text
3. A list of interactive ELEMENTS, each with:
   - a numeric index [0], [1], [2]...
   - its HTML tag (BUTTON, A, INPUT, LABEL, DIV, SPAN, LI)
   - its id and first class, when present
   - its visible text
4. The user's GOAL in natural language
5. The HISTORY of actions already performed, if any

ACTION TYPES:
1. "click" - click an element (uses buttonIndex)
2. "type" - write text into an input field (uses buttonIndex and text)
3. "hover" - move the pointer over an element WITHOUT clicking (opens dropdown menus)
4. "forceOpen" - force a menu open by editing the page (use when hover did not work)
5. "wait" - wait for a while (uses duration in ms)
6. "clickByText" - find an element by its text and click it (uses searchText)

RULES:
- Decide ONE action only.
- Read the history to know what has already been done.
- If you just opened a menu with hover/click/forceOpen, look for the menu entries in the element list.
- Do not repeat an action that already failed with the same approach.
- Check whether the goal is already satisfied: look for [ACTIVE], (SELECTED) or checked markers. If the desired option is already active, do NOT click it again; report completion instead.
- If the last action caused a reload or navigation, ASSUME it succeeded and look for visual confirmation.
- When the goal is reached, set "isComplete": true.

RESPONSE FORMAT - reply ONLY with valid JSON:
{
  "thought": "<what you are going to do and why>",
  "action": {
    "type": "click" | "type" | "hover" | "forceOpen" | "wait" | "clickByText",
    "buttonIndex": <number>,
    "text": "<text to write>",
    "searchText": "<text>",
    "duration": <ms>,
    "reasoning": "<short explanation>"
  },
  "expectation": "<what should happen after this action>",
  "isComplete": false
}

When the goal is REACHED:
{
  "thought": "The goal has been reached",
  "action": null,
  "isComplete": true
}

When you CANNOT proceed:
{
  "thought": "<what the problem is>",
  "action": {
    "type": "error",
    "reasoning": "<why you cannot proceed>"
  },
  "isComplete": true
}"#;

/// One line of the element list shown to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementSummary {
    pub index: usize,
    pub tag: String,
    pub id: Option<String>,
    pub first_class: Option<String>,
    pub text: String,
}

impl From<&InteractiveElement> for ElementSummary {
    fn from(element: &InteractiveElement) -> Self {
        Self {
            index: element.index,
            tag: element.tag.clone(),
            id: element.id.clone(),
            first_class: element.first_class().map(str::to_string),
            text: element.text.clone(),
        }
    }
}

/// Everything the oracle gets to see for one decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext {
    pub goal: String,
    pub page: PageIdentity,
    pub page_text: String,
    pub elements: Vec<ElementSummary>,
    pub history: Vec<ActionSummary>,
    pub step: u32,
    pub attempts: u32,
    pub elapsed: Duration,
    /// The task was picked up again after the page reloaded.
    pub resumed: bool,
    pub last_result: Option<ActionResult>,
}

impl DecisionContext {
    pub fn build(
        task: &TaskState,
        page: PageIdentity,
        page_text: String,
        ranked: &[&InteractiveElement],
    ) -> Self {
        Self {
            goal: task.goal().to_string(),
            page,
            page_text,
            elements: ranked.iter().map(|e| ElementSummary::from(*e)).collect(),
            history: task.history(),
            step: task.current_step(),
            attempts: task.attempts(),
            elapsed: task.elapsed(),
            resumed: task.resumed(),
            last_result: task.last_result().cloned(),
        }
    }
}

/// A validated oracle reply.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleDecision {
    pub thought: String,
    pub action: Option<ActionDecision>,
    pub expectation: Option<String>,
    pub is_complete: bool,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn decide(&self, context: &DecisionContext) -> Result<OracleDecision, OracleError>;
}

pub fn format_prompt(ctx: &DecisionContext) -> String {
    let or_na = |s: &str| if s.is_empty() { "N/A".to_string() } else { s.to_string() };

    let mut prompt = String::new();
    let _ = writeln!(prompt, "## WEB PAGE");
    let _ = writeln!(prompt, "Title: {}", or_na(&ctx.page.title));
    let _ = writeln!(prompt, "URL: {}", or_na(&ctx.page.url));
    if !ctx.page.description.is_empty() {
        let _ = writeln!(prompt, "Description: {}", ctx.page.description);
    }

    let _ = writeln!(prompt, "\n## GOAL\n{}", ctx.goal);

    let _ = writeln!(prompt, "\n## PAGE CONTENT (visible text)");
    if ctx.page_text.is_empty() {
        let _ = writeln!(prompt, "No significant text found.");
    } else {
        let _ = writeln!(prompt, "{}", ctx.page_text);
    }

    if !ctx.history.is_empty() {
        let _ = writeln!(
            prompt,
            "\n## ACTIONS ALREADY COMPLETED ({} steps)",
            ctx.history.len()
        );
        for (i, entry) in ctx.history.iter().enumerate() {
            let status = if entry.success { "✅" } else { "❌" };
            let target = entry
                .target
                .as_deref()
                .map(|t| format!(" [{t}]"))
                .unwrap_or_default();
            let _ = write!(
                prompt,
                "{}. {} {}{}: {}",
                i + 1,
                status,
                entry.kind,
                target,
                entry.reasoning
            );
            if let Some(note) = &entry.note {
                let _ = write!(prompt, " ({note})");
            }
            prompt.push('\n');
        }
        let _ = writeln!(prompt, "\nCurrent step: {}", ctx.step + 1);
        let _ = writeln!(prompt, "Elapsed time: {}s", ctx.elapsed.as_secs());
    }

    if ctx.resumed {
        let _ = writeln!(
            prompt,
            "\nNOTE: the page reloaded after the previous action. Assume it succeeded and look for confirmation."
        );
    }
    if let Some(result) = ctx.last_result.as_ref().filter(|r| !r.success) {
        if let Some(error) = result.error() {
            let _ = writeln!(prompt, "\nLast action failed: {error}");
        }
    }
    if ctx.attempts > 0 {
        let _ = writeln!(prompt, "Failed attempts at this step: {}", ctx.attempts);
    }

    let _ = writeln!(
        prompt,
        "\n## AVAILABLE ELEMENTS ({} elements)",
        ctx.elements.len()
    );
    for element in &ctx.elements {
        let _ = write!(prompt, "[{}] {}", element.index, element.tag);
        if let Some(id) = &element.id {
            let _ = write!(prompt, " #{id}");
        }
        if let Some(class) = &element.first_class {
            let _ = write!(prompt, " .{class}");
        }
        let _ = writeln!(prompt, " \"{}\"", element.text);
    }

    prompt.push_str("\n## DECIDE THE NEXT ACTION\nReply in JSON.");
    prompt
}

/// Parse and validate the oracle's reply. Markdown fences are tolerated.
pub fn parse_decision(content: &str) -> Result<OracleDecision, OracleError> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: Value = serde_json::from_str(cleaned)
        .map_err(|e| OracleError::Malformed(format!("not valid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| OracleError::Malformed("expected a JSON object".into()))?;

    let is_complete = object
        .get("isComplete")
        .and_then(Value::as_bool)
        .ok_or_else(|| OracleError::Malformed("missing isComplete".into()))?;

    let action = match object.get("action") {
        None | Some(Value::Null) => None,
        Some(raw) => {
            if raw.get("type").and_then(Value::as_str).is_none() {
                return Err(OracleError::Malformed("missing action.type".into()));
            }
            let action: ActionDecision = serde_json::from_value(raw.clone())
                .map_err(|e| OracleError::Malformed(format!("invalid action: {e}")))?;
            Some(action)
        }
    };

    if !is_complete && action.is_none() {
        return Err(OracleError::Malformed("missing action".into()));
    }

    let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
    Ok(OracleDecision {
        thought: text("thought").unwrap_or_default(),
        action,
        expectation: text("expectation"),
        is_complete,
    })
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiOracle {
    client: Client,
    config: OracleConfig,
    kv: Arc<dyn KeyValueStore>,
    calls: AtomicU32,
}

impl OpenAiOracle {
    pub fn new(config: OracleConfig, kv: Arc<dyn KeyValueStore>) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OracleError::Unknown(e.to_string()))?;
        Ok(Self {
            client,
            config,
            kv,
            calls: AtomicU32::new(0),
        })
    }

    /// Number of requests issued so far.
    pub fn api_calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Environment first, then the key-value store.
    fn api_key(&self) -> Result<String, OracleError> {
        if let Ok(key) = std::env::var(&self.config.api_key_env) {
            if !key.trim().is_empty() {
                return Ok(key.trim().to_string());
            }
        }
        match self.kv.get(API_KEY_KEY) {
            Ok(Some(Value::String(key))) if !key.trim().is_empty() => Ok(key),
            Ok(_) => Err(OracleError::CredentialMissing),
            Err(e) => {
                warn!("failed to read stored API key: {}", e);
                Err(OracleError::CredentialMissing)
            }
        }
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn decide(&self, context: &DecisionContext) -> Result<OracleDecision, OracleError> {
        let api_key = self.api_key()?;
        let prompt = format_prompt(context);

        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        info!(call, step = context.step + 1, model = %self.config.model, "calling oracle");
        debug!(prompt = %prompt.chars().take(500).collect::<String>(), "prompt excerpt");

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&json!({
                "model": self.config.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": prompt},
                ],
                "temperature": self.config.temperature,
                "response_format": {"type": "json_object"},
            }))
            .send()
            .await
            .map_err(|e| OracleError::Network(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => return Err(OracleError::CredentialInvalid),
            StatusCode::TOO_MANY_REQUESTS => return Err(OracleError::RateLimited),
            _ => {}
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| OracleError::Unknown(format!("unreadable response body: {e}")))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            warn!(%status, "oracle API error: {}", message);
            return Err(OracleError::Unknown(message));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| OracleError::Malformed("no content in response".into()))?;
        debug!(content, "oracle replied");

        parse_decision(content)
    }
}
