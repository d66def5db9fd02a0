use crate::config::ServiceSettings;
use crate::error::{Result, SandfixError};
use crate::providers::{
    CompletionRequest, CompletionResponse, Message, Provider, ProviderInfo, Role, Usage,
};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Client for the OpenAI Responses API
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: Client,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, settings: &ServiceSettings) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(SandfixError::ServiceUnavailable(
                "API key is empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            api_key: api_key.to_string(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            client,
            default_model: settings.model.clone(),
        })
    }

    pub fn static_info() -> ProviderInfo {
        ProviderInfo {
            name: "openai".to_string(),
            display_name: "OpenAI (Responses API)".to_string(),
            default_model: "gpt-4.1-mini".to_string(),
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "role": match msg.role {
                        Role::System => "system",
                        Role::User => "user",
                    },
                    "content": msg.content
                })
            })
            .collect()
    }
}

/// Pull text out of a Responses API body. `output_text` is only present on some
/// deployments; the canonical shape nests text under `output[].content[]`.
pub fn parse_response_body(data: &serde_json::Value, requested_model: &str) -> CompletionResponse {
    let output_text = data["output_text"].as_str().map(|s| s.to_string());

    let content_blocks: Vec<String> = data["output"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .filter_map(|block| block["text"].as_str())
        .map(|s| s.to_string())
        .collect();

    let usage = data.get("usage").filter(|u| u.is_object()).map(|usage| {
        let input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
        let output = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
        Usage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: usage["total_tokens"]
                .as_u64()
                .map(|t| t as u32)
                .unwrap_or(input + output),
        }
    });

    CompletionResponse {
        id: data["id"].as_str().unwrap_or("unknown").to_string(),
        model: data["model"].as_str().unwrap_or(requested_model).to_string(),
        output_text,
        content_blocks,
        usage,
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            default_model: self.default_model.clone(),
            ..Self::static_info()
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let mut body = serde_json::json!({
            "model": request.model,
            "input": self.convert_messages(&request.messages),
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_output_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(SandfixError::ApiRequest(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let parsed = parse_response_body(&data, &request.model);

        if let Some(usage) = &parsed.usage {
            debug!(
                input_tokens = usage.prompt_tokens,
                output_tokens = usage.completion_tokens,
                "Token usage"
            );
        }

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve exactly one HTTP exchange and hand back the raw request text.
    async fn serve_once(status_line: &'static str, body: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });

        (format!("http://{}/v1", addr), rx)
    }

    fn settings_for(base_url: String) -> ServiceSettings {
        ServiceSettings {
            base_url,
            timeout_secs: 5,
            ..ServiceSettings::default()
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4.1-mini".to_string(),
            messages: vec![Message::system("sys"), Message::user("fix it")],
            temperature: None,
            max_tokens: Some(1200),
        }
    }

    #[test]
    fn test_empty_key_rejected() {
        let result = OpenAiProvider::new("  ", &ServiceSettings::default());
        assert!(matches!(result, Err(SandfixError::ServiceUnavailable(_))));
    }

    #[test]
    fn test_parse_nested_blocks() {
        let data = serde_json::json!({
            "id": "resp_1",
            "model": "gpt-4.1-mini",
            "output": [
                {"type": "reasoning", "summary": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"notes\": "},
                    {"type": "output_text", "text": "\"done\"}"}
                ]}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15}
        });

        let parsed = parse_response_body(&data, "fallback");
        assert_eq!(parsed.id, "resp_1");
        assert!(parsed.output_text.is_none());
        assert_eq!(parsed.text().as_deref(), Some("{\"notes\": \"done\"}"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_parse_consolidated_text() {
        let data = serde_json::json!({"output_text": "{}"});
        let parsed = parse_response_body(&data, "fallback");
        assert_eq!(parsed.model, "fallback");
        assert_eq!(parsed.text().as_deref(), Some("{}"));
    }

    #[test]
    fn test_parse_without_text() {
        let data = serde_json::json!({"id": "resp_2", "output": []});
        assert!(parse_response_body(&data, "m").text().is_none());
    }

    #[tokio::test]
    async fn test_complete_sends_responses_request() {
        let body = serde_json::json!({
            "id": "resp_3",
            "model": "gpt-4.1-mini",
            "output": [{"type": "message", "content": [{"type": "output_text", "text": "{\"files\": []}"}]}]
        })
        .to_string();
        let (base_url, request_rx) = serve_once("200 OK", body).await;

        let provider = OpenAiProvider::new("sk-test", &settings_for(base_url)).unwrap();
        let response = provider.complete(request()).await.unwrap();
        assert_eq!(response.text().as_deref(), Some("{\"files\": []}"));

        let raw_request = request_rx.await.unwrap();
        assert!(raw_request.starts_with("POST /v1/responses"));
        assert!(raw_request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(raw_request.contains("\"max_output_tokens\":1200"));
        assert!(raw_request.contains("\"role\":\"system\""));
    }

    #[tokio::test]
    async fn test_complete_surfaces_api_errors() {
        let (base_url, _rx) =
            serve_once("500 Internal Server Error", "{\"error\": \"boom\"}".to_string()).await;

        let provider = OpenAiProvider::new("sk-test", &settings_for(base_url)).unwrap();
        let result = provider.complete(request()).await;
        match result {
            Err(SandfixError::ApiRequest(msg)) => assert!(msg.contains("500")),
            other => panic!("expected ApiRequest error, got {:?}", other.map(|r| r.id)),
        }
    }
}
