//! Fix agent - asks the AI service for a structured repair of a failed command.
//!
//! The agent is built once per run. It is either `Ready` with a provider handle or
//! `Unready` with the reason no handle could be built. An unready agent never
//! contacts the service. Request failures never escape `request_fix`: they yield
//! `None` and are remembered for `explain_unavailable`.

use crate::config::ServiceSettings;
use crate::patch::FileEdit;
use crate::providers::openai::OpenAiProvider;
use crate::providers::{CompletionRequest, Message, Provider};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Characters of stdout/stderr kept (from the end) when building a prompt
pub const OUTPUT_TAIL_CHARS: usize = 4000;

const SYSTEM_INSTRUCTION: &str = "You write JSON patches to fix projects. \
    Reply with a single JSON object and nothing else.";

/// Structured fix returned by the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FixPayload {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub files: Vec<FileEdit>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl FixPayload {
    pub fn is_empty(&self) -> bool {
        self.notes.as_deref().is_none_or(|n| n.trim().is_empty())
            && self.files.is_empty()
            && self.commands.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    MissingCredential,
    InitFailed(String),
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::MissingCredential => {
                write!(f, "No AI service API key is configured.")
            }
            UnavailableReason::InitFailed(err) => {
                write!(f, "Could not initialize the AI service client: {}", err)
            }
        }
    }
}

enum AgentState {
    Ready {
        provider: Box<dyn Provider>,
        last_failure: Option<String>,
    },
    Unready(UnavailableReason),
}

pub struct FixAgent {
    state: AgentState,
    model: String,
    max_output_tokens: u32,
}

impl FixAgent {
    /// Build the agent from the decrypted credential. Never fails: problems become `Unready`.
    pub fn from_credential(api_key: Option<&str>, settings: &ServiceSettings) -> Self {
        let state = match api_key.map(str::trim).filter(|k| !k.is_empty()) {
            None => AgentState::Unready(UnavailableReason::MissingCredential),
            Some(key) => match OpenAiProvider::new(key, settings) {
                Ok(provider) => {
                    let info = provider.info();
                    debug!(
                        provider = %info.name,
                        display_name = %info.display_name,
                        default_model = %info.default_model,
                        "AI service client ready"
                    );
                    AgentState::Ready {
                        provider: Box::new(provider),
                        last_failure: None,
                    }
                }
                Err(e) => AgentState::Unready(UnavailableReason::InitFailed(e.to_string())),
            },
        };

        Self {
            state,
            model: settings.model.clone(),
            max_output_tokens: settings.max_output_tokens,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_provider(provider: Box<dyn Provider>, settings: &ServiceSettings) -> Self {
        Self {
            state: AgentState::Ready {
                provider,
                last_failure: None,
            },
            model: settings.model.clone(),
            max_output_tokens: settings.max_output_tokens,
        }
    }

    #[cfg(test)]
    pub(crate) fn unready(reason: UnavailableReason, settings: &ServiceSettings) -> Self {
        Self {
            state: AgentState::Unready(reason),
            model: settings.model.clone(),
            max_output_tokens: settings.max_output_tokens,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, AgentState::Ready { .. })
    }

    pub fn explain_unavailable(&self) -> String {
        match &self.state {
            AgentState::Unready(reason) => reason.to_string(),
            AgentState::Ready {
                last_failure: Some(err),
                ..
            } => format!("The last request to the AI service failed: {}", err),
            AgentState::Ready {
                last_failure: None, ..
            } => "AI service client unavailable for an unknown reason.".to_string(),
        }
    }

    /// Ask for a fix. `None` means "apply nothing".
    pub async fn request_fix(
        &mut self,
        project_path: &Path,
        command: &str,
        stdout: &str,
        stderr: &str,
    ) -> Option<FixPayload> {
        let AgentState::Ready {
            provider,
            last_failure,
        } = &mut self.state
        else {
            return None;
        };

        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(SYSTEM_INSTRUCTION),
                Message::user(build_fix_prompt(project_path, command, stdout, stderr)),
            ],
            temperature: None,
            max_tokens: Some(self.max_output_tokens),
        };

        let response = match provider.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Fix request failed");
                *last_failure = Some(e.to_string());
                return None;
            }
        };

        debug!(response_id = %response.id, model = %response.model, "Received fix response");

        let Some(text) = response.text() else {
            warn!("AI service returned no text");
            return None;
        };

        let payload = parse_fix_payload(&text);
        if payload.is_none() {
            debug!(response = %text, "Discarding response that is not a valid fix payload");
        }
        payload
    }
}

/// Last `max_chars` characters of `text`, respecting char boundaries.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    match text.char_indices().nth(count - max_chars) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

pub fn build_fix_prompt(project_path: &Path, command: &str, stdout: &str, stderr: &str) -> String {
    format!(
        "You are an autonomous senior software engineer working inside the sandbox directory \
`{path}`. The following command failed: `{command}`.

stdout (last {limit} chars):
{stdout}

stderr (last {limit} chars):
{stderr}

Analyse the failure and propose concrete fixes. Respond strictly in JSON with the schema:
{{
  \"notes\": \"Optional explanation\",
  \"files\": [{{\"path\": \"relative/path.py\", \"content\": \"full new file content\"}}],
  \"commands\": [\"optional shell command to run\"]
}}

Only include files that must be overwritten with the new content. File paths must be \
relative to the project directory. Do not include explanations outside the JSON payload.",
        path = project_path.display(),
        command = command,
        limit = OUTPUT_TAIL_CHARS,
        stdout = tail_chars(stdout, OUTPUT_TAIL_CHARS),
        stderr = tail_chars(stderr, OUTPUT_TAIL_CHARS),
    )
}

/// Decode a response into a fix. Anything that is not a well-typed JSON object,
/// or an object carrying nothing to do, is `None`.
pub fn parse_fix_payload(text: &str) -> Option<FixPayload> {
    let payload: FixPayload = serde_json::from_str(text.trim()).ok()?;
    if payload.is_empty() { None } else { Some(payload) }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{Result, SandfixError};
    use crate::providers::{CompletionResponse, ProviderInfo};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Provider that replays canned responses and records every prompt it receives.
    pub(crate) struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<CompletionResponse>>>,
        pub(crate) prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(responses: Vec<Result<CompletionResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Always answer with the same text.
        pub(crate) fn repeating(text: &str, times: usize) -> Self {
            Self::new(
                (0..times)
                    .map(|_| Ok(CompletionResponse::from_text(text)))
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                name: "scripted".to_string(),
                display_name: "Scripted".to_string(),
                default_model: "test-model".to_string(),
            }
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
            let prompt = request
                .messages
                .iter()
                .map(|m| m.content.clone())
                .collect::<Vec<_>>()
                .join("\n---\n");
            self.prompts.lock().unwrap().push(prompt);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SandfixError::ApiRequest("script exhausted".to_string())))
        }
    }

    fn settings() -> ServiceSettings {
        ServiceSettings::default()
    }

    fn project() -> PathBuf {
        PathBuf::from("/sandbox/demo")
    }

    #[test]
    fn test_missing_credential_is_unready() {
        let agent = FixAgent::from_credential(None, &settings());
        assert!(!agent.is_ready());
        assert_eq!(
            agent.explain_unavailable(),
            "No AI service API key is configured."
        );

        let blank = FixAgent::from_credential(Some("   "), &settings());
        assert!(!blank.is_ready());
    }

    #[test]
    fn test_credential_makes_agent_ready() {
        let agent = FixAgent::from_credential(Some("sk-test"), &settings());
        assert!(agent.is_ready());
        assert!(agent.explain_unavailable().contains("unknown"));
    }

    #[test]
    fn test_init_failure_reason() {
        let agent = FixAgent::unready(
            UnavailableReason::InitFailed("tls backend missing".to_string()),
            &settings(),
        );
        assert!(!agent.is_ready());
        assert!(agent.explain_unavailable().contains("tls backend missing"));
    }

    #[tokio::test]
    async fn test_unready_agent_returns_none() {
        let mut agent = FixAgent::from_credential(None, &settings());
        let fix = agent.request_fix(&project(), "pytest", "", "boom").await;
        assert!(fix.is_none());
    }

    #[tokio::test]
    async fn test_valid_payload_is_decoded() {
        let text = r#"{"notes": "missing dep", "files": [{"path": "req.txt", "content": "pytest\n"}], "commands": ["pip install -r req.txt"]}"#;
        let provider = ScriptedProvider::repeating(text, 1);
        let mut agent = FixAgent::with_provider(Box::new(provider), &settings());

        let fix = agent
            .request_fix(&project(), "pytest", "out", "err")
            .await
            .unwrap();
        assert_eq!(fix.notes.as_deref(), Some("missing dep"));
        assert_eq!(fix.files.len(), 1);
        assert_eq!(fix.files[0].path, "req.txt");
        assert_eq!(fix.commands, vec!["pip install -r req.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_content_blocks_are_concatenated() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::from_blocks(vec![
            "{\"commands\": ".to_string(),
            "[\"make\"]}".to_string(),
        ]))]);
        let mut agent = FixAgent::with_provider(Box::new(provider), &settings());

        let fix = agent.request_fix(&project(), "make test", "", "").await.unwrap();
        assert_eq!(fix.commands, vec!["make".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_text_is_no_fix() {
        let provider = ScriptedProvider::repeating("Sure! Here is the fix: edit main.py", 1);
        let mut agent = FixAgent::with_provider(Box::new(provider), &settings());

        assert!(agent.request_fix(&project(), "pytest", "", "").await.is_none());
        assert!(agent.is_ready());
    }

    #[tokio::test]
    async fn test_empty_response_is_no_fix() {
        let provider = ScriptedProvider::new(vec![Ok(CompletionResponse::default())]);
        let mut agent = FixAgent::with_provider(Box::new(provider), &settings());
        assert!(agent.request_fix(&project(), "pytest", "", "").await.is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_updates_reason_only() {
        let provider = ScriptedProvider::new(vec![Err(SandfixError::ApiRequest(
            "connection reset".to_string(),
        ))]);
        let mut agent = FixAgent::with_provider(Box::new(provider), &settings());

        assert!(agent.request_fix(&project(), "pytest", "", "").await.is_none());
        assert!(agent.is_ready());
        assert!(agent.explain_unavailable().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_prompt_contains_context_and_contract() {
        let provider = ScriptedProvider::repeating("{}", 1);
        let prompts = provider.prompts.clone();
        let mut agent = FixAgent::with_provider(Box::new(provider), &settings());

        agent
            .request_fix(&project(), "npm start", "stdout-marker", "stderr-marker")
            .await;

        let recorded = prompts.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        let prompt = &recorded[0];
        assert!(prompt.contains(SYSTEM_INSTRUCTION));
        assert!(prompt.contains("/sandbox/demo"));
        assert!(prompt.contains("`npm start`"));
        assert!(prompt.contains("stdout-marker"));
        assert!(prompt.contains("stderr-marker"));
        assert!(prompt.contains("\"files\""));
        assert!(prompt.contains("\"commands\""));
    }

    #[test]
    fn test_output_truncated_independently() {
        let stdout = format!("{}{}", "a".repeat(5000), "OUT_END");
        let stderr = format!("{}{}", "DROPPED", "b".repeat(4000));
        let prompt = build_fix_prompt(&project(), "cmd", &stdout, &stderr);

        assert!(prompt.contains("OUT_END"));
        assert!(!prompt.contains("DROPPED"));
        assert!(!prompt.contains(&"a".repeat(4000)));
        assert!(prompt.contains(&"a".repeat(4000 - "OUT_END".len())));
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("héllo wörld", 5), "wörld");
        assert_eq!(tail_chars("short", 10), "short");
        assert_eq!(tail_chars("", 3), "");
        assert_eq!(tail_chars("abc", 0), "");
    }

    #[test]
    fn test_parse_rejects_schema_violations() {
        assert!(parse_fix_payload("not json").is_none());
        assert!(parse_fix_payload("[1, 2]").is_none());
        assert!(parse_fix_payload(r#"{"files": "main.py"}"#).is_none());
        assert!(parse_fix_payload(r#"{"files": [{"path": "a.py"}]}"#).is_none());
        assert!(parse_fix_payload(r#"{"commands": ["ok", 3]}"#).is_none());
        assert!(parse_fix_payload("{}").is_none());
        assert!(parse_fix_payload("```json\n{\"commands\": [\"ls\"]}\n```").is_none());
    }

    #[test]
    fn test_parse_notes_only_payload() {
        let payload = parse_fix_payload(r#"{"notes": "flaky network, retry"}"#).unwrap();
        assert!(payload.files.is_empty());
        assert!(payload.commands.is_empty());
    }
}
