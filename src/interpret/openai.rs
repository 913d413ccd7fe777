use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{NormalizeError, Result};
use crate::interpret::{InterpretationContext, InterpreterPort, RawInterpretation};
use crate::schema::TypeDescriptor;

/// Adapter over any OpenAI-compatible chat-completions endpoint. The
/// request pins temperature to zero and demands a JSON object so the
/// same raw text always yields the same structured candidate.
pub struct OpenAiInterpreter {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiInterpreter {
    pub fn new(
        base_url: &str,
        model: &str,
        api_key: String,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    /// The system prompt constrains the response to the field's type.
    fn system_prompt(descriptor: &TypeDescriptor) -> String {
        let value_rule = match descriptor {
            TypeDescriptor::Timestamp => {
                "an ISO 8601 datetime string with no time zone, e.g. \"2005-01-03T14:00:00\". \
                 If the text names no year, take it from the context event date or source year. \
                 If the resulting datetime would precede the context event start, assume the \
                 following year. If only a date is present, assume the time 23:59:59. If only \
                 a time is present, combine it with the context event date."
                    .to_string()
            }
            TypeDescriptor::Date => {
                "an ISO 8601 date string, e.g. \"2005-01-03\". If the text names no year, \
                 take it from the context source year."
                    .to_string()
            }
            TypeDescriptor::Time => {
                "a 24-hour time string, e.g. \"14:00:00\".".to_string()
            }
            TypeDescriptor::Count => {
                "a non-negative integer. If the text specifies a range, return the highest \
                 value in the range. If it spells a number or an approximation in English, \
                 return the closest integer."
                    .to_string()
            }
            TypeDescriptor::Category(set) => format!(
                "exactly one of the following strings: {}.",
                set.values()
                    .iter()
                    .map(|v| format!("\"{}\"", v))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            TypeDescriptor::Text => "a cleaned-up string.".to_string(),
        };
        format!(
            "You interpret one messy field value from a historical power-outage disclosure \
             record. Respond with a JSON object of the form \
             {{\"value\": <value>, \"confidence\": <0.0-1.0>}} and nothing else. \
             The value must be {} \
             If the text is empty, states the value is not available, or cannot be \
             interpreted, respond with {{\"value\": null}}.",
            value_rule
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StructuredContent {
    value: serde_json::Value,
    confidence: Option<f64>,
}

#[async_trait]
impl InterpreterPort for OpenAiInterpreter {
    async fn interpret(
        &self,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        context: &InterpretationContext,
    ) -> Result<RawInterpretation> {
        let context_block = context.render();
        let user_message = if context_block.is_empty() {
            format!("Raw text: {}", raw_text)
        } else {
            format!("{}\nRaw text: {}", context_block, raw_text)
        };

        let body = json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": Self::system_prompt(descriptor) },
                { "role": "user", "content": user_message },
            ],
        });

        debug!(raw_text, "sending interpretation request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NormalizeError::Service(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(NormalizeError::Service(format!(
                "interpretation endpoint returned {}: {}",
                status, detail
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| NormalizeError::Service(e.to_string()))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| NormalizeError::Service("response carried no choices".to_string()))?;

        // A content payload that is not JSON at all counts as a service
        // error (retried with backoff); JSON of the wrong shape is left
        // for the conformance check to reject.
        let structured: StructuredContent = serde_json::from_str(content)
            .map_err(|e| NormalizeError::Service(format!("unparseable content payload: {}", e)))?;

        Ok(RawInterpretation {
            value: structured.value,
            confidence: structured.confidence,
        })
    }
}
