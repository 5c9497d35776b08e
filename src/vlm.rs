use crate::agent::{render_history, AgentError, Reasoner, Screenshot, ThinkRequest};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const SYSTEM_PROMPT: &str = r#"You are a desktop GUI automation agent. You see a screenshot of the screen and operate the mouse and keyboard, one action per reply, to accomplish the user's task.

Rules:
1. Reply with a single JSON object and nothing else: no markdown, no explanation.
2. Ignore the agent's own window; operate the desktop and other applications.
3. To launch a program, prefer the run dialog (hotkey win+r) or the start menu.

Reply format:
{"thought":"what you see and why","action":{"type":"<action>","params":{...}},"status":"in_progress"}

Actions:
- click: {"x":100,"y":200} optional "button":"left|right|middle", "clicks":2 for a double click
- double_click / right_click: {"x":100,"y":200}
- move: {"x":100,"y":200}
- type: {"text":"notepad"}
- key_press: {"key":"enter"}
- hotkey: {"keys":["win","r"]}
- scroll: {"amount":3} positive scrolls up, negative scrolls down
- wait: {"seconds":1}
- done: {"message":"what was achieved"} with "status":"completed"
- failed: {"reason":"why the task cannot be done"} with "status":"failed"

Example, opening notepad:
{"thought":"open the run dialog","action":{"type":"hotkey","params":{"keys":["win","r"]}},"status":"in_progress"}
{"thought":"type the program name","action":{"type":"type","params":{"text":"notepad"}},"status":"in_progress"}
{"thought":"run it","action":{"type":"key_press","params":{"key":"enter"}},"status":"in_progress"}
{"thought":"notepad is open","action":{"type":"done","params":{"message":"Notepad opened"}},"status":"completed"}"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenAiCompat,
}

impl FromStr for Provider {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "openai_compat" | "openai-compat" | "openai" => Ok(Provider::OpenAiCompat),
            other => Err(AgentError::Config(format!(
                "unknown LLM provider '{other}', use 'ollama' or 'openai_compat'"
            ))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Ollama => f.write_str("ollama"),
            Provider::OpenAiCompat => f.write_str("openai_compat"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VlmConfig {
    pub provider: Provider,
    pub api_base: String,      // e.g. "http://localhost:11434"
    pub api_key: String,       // only sent when non-empty
    pub model: String,         // e.g. "qwen3-vl:8b"
    pub request_timeout: Duration,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self::for_provider(Provider::Ollama)
    }
}

impl VlmConfig {
    /// Provider defaults, overridable through the provider's environment variables.
    pub fn for_provider(provider: Provider) -> Self {
        let (api_base, api_key, model) = match provider {
            Provider::Ollama => (
                env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".into()),
                String::new(),
                env::var("OLLAMA_MODEL").unwrap_or_else(|_| "qwen3-vl:8b".into()),
            ),
            Provider::OpenAiCompat => (
                env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://dashscope.aliyuncs.com/compatible-mode/v1".into()),
                env::var("OPENAI_API_KEY").unwrap_or_default(),
                env::var("OPENAI_MODEL").unwrap_or_else(|_| "qwen3-vl-flash".into()),
            ),
        };
        Self {
            provider,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            model,
            request_timeout: Duration::from_secs(120),
            max_tokens: 1024,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    /// Picks the provider from `LLM_PROVIDER` (default `ollama`).
    pub fn from_env() -> Result<Self, AgentError> {
        let provider = match env::var("LLM_PROVIDER") {
            Ok(p) if !p.trim().is_empty() => p.parse()?,
            _ => Provider::Ollama,
        };
        Ok(Self::for_provider(provider))
    }
}

/// Multimodal chat client for the reasoning backend.
#[derive(Clone)]
pub struct VlmClient {
    http: Client,
    cfg: VlmConfig,
}

impl VlmClient {
    pub fn new(cfg: VlmConfig) -> Result<Self> {
        if cfg.model.trim().is_empty() {
            bail!("model name missing");
        }
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, cfg })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    pub fn provider(&self) -> Provider {
        self.cfg.provider
    }

    fn chat_url(&self) -> String {
        match self.cfg.provider {
            Provider::Ollama => format!("{}/api/chat", self.cfg.api_base),
            Provider::OpenAiCompat => format!("{}/chat/completions", self.cfg.api_base),
        }
    }

    fn models_url(&self) -> String {
        match self.cfg.provider {
            Provider::Ollama => format!("{}/api/tags", self.cfg.api_base),
            Provider::OpenAiCompat => format!("{}/models", self.cfg.api_base),
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.cfg.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.cfg.api_key)
        }
    }

    pub async fn test_connection(&self) -> bool {
        match self.authorized(self.http.get(self.models_url())).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self.authorized(self.http.get(self.models_url())).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("{} error {}: {}", self.cfg.provider, status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse model list JSON")?;
        let (list, key) = match self.cfg.provider {
            Provider::Ollama => ("/models", "name"),
            Provider::OpenAiCompat => ("/data", "id"),
        };
        Ok(v.pointer(list)
            .and_then(|x| x.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get(key).and_then(|x| x.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Sends one turn and returns the assistant's text.
    pub async fn chat(&self, request: &ThinkRequest<'_>) -> Result<String> {
        let body = self.request_body(request);
        let resp = self
            .authorized(self.http.post(self.chat_url()))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("{} error {}: {}", self.cfg.provider, status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse chat response JSON")?;
        let reply = Self::extract_reply(self.cfg.provider, &v)?;
        debug!(model = %self.cfg.model, chars = reply.len(), "model reply received");
        Ok(reply)
    }

    fn request_body(&self, request: &ThinkRequest<'_>) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": self.cfg.system_prompt })];
        let current = if request.first_turn {
            opening_message(request.task)
        } else {
            messages.push(json!({ "role": "user", "content": opening_message(request.task) }));
            follow_up_message(request)
        };
        messages.push(self.image_message(&current, request.screenshot));

        match self.cfg.provider {
            Provider::Ollama => json!({
                "model": self.cfg.model,
                "messages": messages,
                "stream": false,
            }),
            Provider::OpenAiCompat => json!({
                "model": self.cfg.model,
                "messages": messages,
                "max_tokens": self.cfg.max_tokens,
            }),
        }
    }

    fn image_message(&self, text: &str, shot: &Screenshot) -> Value {
        match self.cfg.provider {
            Provider::Ollama => json!({
                "role": "user",
                "content": text,
                "images": [shot.image_base64],
            }),
            Provider::OpenAiCompat => json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": text },
                    { "type": "image_url", "image_url": { "url": shot.data_url() } }
                ]
            }),
        }
    }

    fn extract_reply(provider: Provider, v: &Value) -> Result<String> {
        if let Some(err) = v.get("error") {
            let msg = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            bail!("{provider} returned an error: {msg}");
        }
        let content = match provider {
            Provider::Ollama => v.pointer("/message/content"),
            Provider::OpenAiCompat => v.pointer("/choices/0/message/content"),
        };
        // Some gateways return content as a list of typed parts.
        let text = match content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };
        Ok(text)
    }
}

fn opening_message(task: &str) -> String {
    format!("Task: {task}\n\nThis is the current screenshot. Analyse the screen and decide the first action.")
}

fn follow_up_message(request: &ThinkRequest<'_>) -> String {
    let mut s = String::new();
    if !request.history.is_empty() {
        s.push_str("Previous steps:\n");
        s.push_str(&render_history(request.history));
        s.push('\n');
    }
    s.push_str(
        "This screenshot shows the screen after the previous action. Analyse the current state and decide the next action. If the task is complete, use done.",
    );
    s
}

#[async_trait]
impl Reasoner for VlmClient {
    async fn ask(&self, request: &ThinkRequest<'_>) -> Result<String, AgentError> {
        self.chat(request)
            .await
            .map_err(|e| AgentError::Transport(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::HistoryEntry;

    fn client(provider: Provider) -> VlmClient {
        let cfg = VlmConfig {
            provider,
            api_base: "http://127.0.0.1:9".into(),
            api_key: String::new(),
            model: "qwen3-vl:8b".into(),
            request_timeout: Duration::from_secs(1),
            max_tokens: 256,
            system_prompt: "sys".into(),
        };
        VlmClient::new(cfg).unwrap()
    }

    fn shot() -> Screenshot {
        Screenshot::new("image/png", "AAAA")
    }

    fn history() -> Vec<HistoryEntry> {
        vec![HistoryEntry {
            step: 1,
            thought: "open run".into(),
            action: "hotkey(win, r)".into(),
            result: "Pressed win+r".into(),
            success: true,
        }]
    }

    #[test]
    fn first_turn_ollama_body() {
        let c = client(Provider::Ollama);
        let s = shot();
        let body = c.request_body(&ThinkRequest { task: "open notepad", first_turn: true, screenshot: &s, history: &[] });
        assert_eq!(body["stream"], json!(false));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], json!("sys"));
        assert!(messages[1]["content"].as_str().unwrap().starts_with("Task: open notepad"));
        assert_eq!(messages[1]["images"], json!(["AAAA"]));
    }

    #[test]
    fn later_turn_carries_history_and_one_image() {
        let c = client(Provider::OpenAiCompat);
        let s = shot();
        let h = history();
        let body = c.request_body(&ThinkRequest { task: "open notepad", first_turn: false, screenshot: &s, history: &h });
        assert_eq!(body["max_tokens"], json!(256));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages[1]["content"].as_str().unwrap().contains("open notepad"));
        let parts = messages[2]["content"].as_array().unwrap();
        let text = parts[0]["text"].as_str().unwrap();
        assert!(text.contains("Step 1: thought: open run | action: hotkey(win, r)"));
        assert_eq!(parts[1]["image_url"]["url"], json!("data:image/png;base64,AAAA"));
        assert_eq!(body.to_string().matches("AAAA").count(), 1);
    }

    #[test]
    fn reply_extraction() {
        let v = json!({ "choices": [{ "message": { "content": "Action: done" } }] });
        assert_eq!(VlmClient::extract_reply(Provider::OpenAiCompat, &v).unwrap(), "Action: done");

        let v = json!({ "choices": [{ "message": { "content": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }] } }] });
        assert_eq!(VlmClient::extract_reply(Provider::OpenAiCompat, &v).unwrap(), "ab");

        let v = json!({ "message": { "role": "assistant", "content": "{\"thought\":\"x\"}" } });
        assert_eq!(VlmClient::extract_reply(Provider::Ollama, &v).unwrap(), "{\"thought\":\"x\"}");

        let v = json!({ "choices": [] });
        assert_eq!(VlmClient::extract_reply(Provider::OpenAiCompat, &v).unwrap(), "");

        let v = json!({ "error": "model not found" });
        assert!(VlmClient::extract_reply(Provider::Ollama, &v).is_err());
    }

    #[test]
    fn provider_names() {
        assert_eq!("Ollama".parse::<Provider>().unwrap(), Provider::Ollama);
        assert_eq!("openai_compat".parse::<Provider>().unwrap(), Provider::OpenAiCompat);
        assert!(matches!("bard".parse::<Provider>(), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        let c = client(Provider::Ollama);
        let s = shot();
        let err = c
            .ask(&ThinkRequest { task: "t", first_turn: true, screenshot: &s, history: &[] })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
