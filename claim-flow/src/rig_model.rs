//! [`ChatModel`] backed by rig's OpenRouter provider.

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::message::{AssistantContent, Message, ToolResultContent, UserContent};
use rig::completion::{CompletionModel, ToolDefinition};
use rig::prelude::*;
use rig::providers::openrouter;
use tracing::debug;

use crate::error::{ClaimError, Result};
use crate::llm::{ChatMessage, ChatModel, ModelReply, ModelRequest, ToolCall};

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Clone)]
pub struct RigChatModel {
    model: openrouter::CompletionModel,
    name: String,
}

impl RigChatModel {
    pub fn openrouter(api_key: &str, model: &str) -> Self {
        let client = openrouter::Client::new(api_key);
        Self {
            model: client.completion_model(model),
            name: model.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn to_rig_message(message: &ChatMessage) -> Result<Message> {
    Ok(match message {
        ChatMessage::User { content } => Message::user(content.clone()),
        ChatMessage::Assistant { content } => Message::assistant(content.clone()),
        ChatMessage::ToolRequest { content, calls } => {
            let mut parts: Vec<AssistantContent> = Vec::new();
            if let Some(text) = content {
                parts.push(AssistantContent::text(text.clone()));
            }
            parts.extend(calls.iter().map(|call| {
                AssistantContent::tool_call(
                    call.id.clone(),
                    call.name.clone(),
                    call.arguments.clone(),
                )
            }));
            Message::Assistant {
                id: None,
                content: OneOrMany::many(parts)
                    .map_err(|_| ClaimError::Model("tool request without content".to_string()))?,
            }
        }
        ChatMessage::ToolResult { call_id, content } => Message::User {
            content: OneOrMany::one(UserContent::tool_result(
                call_id.clone(),
                OneOrMany::one(ToolResultContent::text(content.clone())),
            )),
        },
    })
}

#[async_trait]
impl ChatModel for RigChatModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelReply> {
        let mut history = request
            .messages
            .iter()
            .map(to_rig_message)
            .collect::<Result<Vec<_>>>()?;
        let prompt = history
            .pop()
            .ok_or_else(|| ClaimError::Model("request has no messages".to_string()))?;
        let tools: Vec<ToolDefinition> = request
            .tools
            .into_iter()
            .map(|spec| ToolDefinition {
                name: spec.name,
                description: spec.description,
                parameters: spec.parameters,
            })
            .collect();

        debug!(
            model = %self.name,
            history = history.len(),
            tools = tools.len(),
            "Calling language model"
        );
        let response = self
            .model
            .completion_request(prompt)
            .preamble(request.preamble)
            .messages(history)
            .tools(tools)
            .send()
            .await
            .map_err(|e| ClaimError::Model(e.to_string()))?;

        let mut text: Vec<String> = Vec::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        for content in response.choice.into_iter() {
            match content {
                AssistantContent::Text(t) => text.push(t.text),
                AssistantContent::ToolCall(call) => calls.push(ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                }),
                _ => {}
            }
        }
        let text = (!text.is_empty()).then(|| text.join("\n"));
        Ok(ModelReply::from_parts(text, calls))
    }
}
