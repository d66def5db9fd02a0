use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod openai;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A completion as returned by the service. Some responses carry one consolidated
/// text field, others only a list of content blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub model: String,
    pub output_text: Option<String>,
    #[serde(default)]
    pub content_blocks: Vec<String>,
    pub usage: Option<Usage>,
}

impl CompletionResponse {
    #[cfg(test)]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            output_text: Some(text.into()),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn from_blocks(blocks: Vec<String>) -> Self {
        Self {
            content_blocks: blocks,
            ..Self::default()
        }
    }

    /// The consolidated text if present, otherwise all blocks concatenated.
    pub fn text(&self) -> Option<String> {
        if let Some(text) = self.output_text.as_ref().filter(|t| !t.is_empty()) {
            return Some(text.clone());
        }
        let joined: String = self.content_blocks.concat();
        if joined.is_empty() { None } else { Some(joined) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub display_name: String,
    pub default_model: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}
