//! Provider-neutral view of a chat model with tool calling.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::claim::{Role, TranscriptEntry};
use crate::error::{ClaimError, Result};

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatMessage {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    /// The model's request to run tools, echoed back to it on the next round.
    ToolRequest {
        #[serde(default)]
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage::Assistant {
            content: content.into(),
        }
    }
}

impl From<&TranscriptEntry> for ChatMessage {
    /// Human-agent entries are plain assistant history for the model.
    fn from(entry: &TranscriptEntry) -> Self {
        match entry.role {
            Role::User => ChatMessage::user(entry.content.clone()),
            Role::Assistant => ChatMessage::assistant(entry.content.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub preamble: String,
    /// Oldest first; the last message is the one being answered.
    pub messages: Vec<ChatMessage>,
    /// Empty disables tool calling for this request.
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Message(String),
    ToolCalls {
        content: Option<String>,
        calls: Vec<ToolCall>,
    },
}

impl ModelReply {
    /// Normalises a reply: a tool-call list that turned out empty is a message.
    pub fn from_parts(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        if calls.is_empty() {
            ModelReply::Message(text.unwrap_or_default())
        } else {
            ModelReply::ToolCalls {
                content: text.filter(|t| !t.trim().is_empty()),
                calls,
            }
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply>;
}

/// Replays canned replies in order and records every request it was given.
/// Drives the orchestrator in tests and offline demos.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ModelReply>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.replies.lock().await.len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply> {
        self.requests.lock().await.push(request);
        self.replies
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ClaimError::Model("scripted model has no replies left".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn empty_tool_call_list_is_a_plain_message() {
        assert_eq!(
            ModelReply::from_parts(Some("Hi".into()), vec![]),
            ModelReply::Message("Hi".into())
        );
        let call = ToolCall {
            id: "c1".into(),
            name: "complete_claim".into(),
            arguments: serde_json::json!({}),
        };
        assert_eq!(
            ModelReply::from_parts(Some("  ".into()), vec![call.clone()]),
            ModelReply::ToolCalls {
                content: None,
                calls: vec![call]
            }
        );
    }

    #[test]
    fn human_agent_history_reads_as_assistant() {
        let mut entry = TranscriptEntry::assistant("This is agent Sam", Utc::now());
        entry.human_authored = true;
        assert_eq!(
            ChatMessage::from(&entry),
            ChatMessage::assistant("This is agent Sam")
        );
    }

    #[tokio::test]
    async fn scripted_model_replays_in_order_then_fails() {
        let model = ScriptedModel::new([ModelReply::Message("first".into())]);
        let request = ModelRequest {
            preamble: "p".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: vec![],
        };
        assert_eq!(
            model.complete(request.clone()).await.unwrap(),
            ModelReply::Message("first".into())
        );
        assert!(matches!(
            model.complete(request).await,
            Err(ClaimError::Model(_))
        ));
        assert_eq!(model.requests().await.len(), 2);
    }
}
