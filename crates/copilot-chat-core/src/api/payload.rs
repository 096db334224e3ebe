//! Request payloads for each model family.
//!
//! OpenAI models take the chat-completions format with multipart
//! `image_url` content. Gemini takes the same format but cannot receive
//! inline images through the proxy, so images become a text note. Claude
//! models go to the Messages endpoint, which wants a top-level `system`,
//! strictly alternating roles, and base64 image blocks.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Endpoints;
use crate::models::{AssembledRequest, Attachment, Message, Role};

/// Sampling temperature for every request.
const TEMPERATURE: f64 = 0.1;

/// Output limit for Claude requests when the model catalog has none.
pub const DEFAULT_CLAUDE_MAX_TOKENS: usize = 16_000;

/// Filler first turn for Claude conversations that open with the assistant.
const CLAUDE_START_TURN: &str = "(start)";

const GEMINI_IMAGE_NOTE: &str =
    "[Image attached - Gemini via Copilot proxy does not support inline images.]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    OpenAi,
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        if id.contains("claude") {
            ModelFamily::Claude
        } else if id.contains("gemini") {
            ModelFamily::Gemini
        } else {
            ModelFamily::OpenAi
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelFamily::OpenAi => "openai",
            ModelFamily::Claude => "claude",
            ModelFamily::Gemini => "gemini",
        };
        f.write_str(name)
    }
}

/// A request ready to send: where it goes and the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreparedRequest {
    pub model: String,
    pub family: ModelFamily,
    pub endpoint: String,
    pub body: Value,
}

/// Build the streaming payload for `model`. `max_output_tokens` is only
/// used by Claude.
pub fn prepare(
    request: &AssembledRequest,
    model: &str,
    endpoints: &Endpoints,
    max_output_tokens: usize,
) -> PreparedRequest {
    let family = ModelFamily::for_model(model);
    let (endpoint, body) = match family {
        ModelFamily::Claude => (
            endpoints.claude_messages.clone(),
            claude_body(request, model, max_output_tokens),
        ),
        ModelFamily::OpenAi | ModelFamily::Gemini => (
            endpoints.chat_completions.clone(),
            chat_body(request, model, family),
        ),
    };
    PreparedRequest {
        model: model.to_string(),
        family,
        endpoint,
        body,
    }
}

fn chat_body(request: &AssembledRequest, model: &str, family: ModelFamily) -> Value {
    let mut messages = Vec::with_capacity(request.messages().len() + 1);
    if let Some(system) = request.system_prompt() {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in request.messages() {
        messages.push(json!({
            "role": message.role().as_str(),
            "content": chat_content(message, family),
        }));
    }

    json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "n": 1,
        "top_p": 1,
        "temperature": TEMPERATURE,
    })
}

fn chat_content(message: &Message, family: ModelFamily) -> Value {
    if message.attachments().is_empty() {
        return Value::String(message.content().to_string());
    }

    let mut parts = Vec::new();
    if !message.content().is_empty() {
        parts.push(text_part(message.content()));
    }
    for attachment in message.attachments() {
        let part = match (attachment, family) {
            (Attachment::Text { content, .. }, _) => text_part(content),
            (Attachment::Image { .. }, ModelFamily::Gemini) => text_part(GEMINI_IMAGE_NOTE),
            (Attachment::Image { .. }, _) => json!({
                "type": "image_url",
                "image_url": {"url": attachment.data_url().unwrap_or_default()},
            }),
        };
        parts.push(part);
    }
    Value::Array(parts)
}

fn claude_body(request: &AssembledRequest, model: &str, max_output_tokens: usize) -> Value {
    let mut system: Option<String> = request.system_prompt().map(str::to_string);
    let mut turns: Vec<(Role, Value)> = Vec::new();

    for message in request.messages() {
        if message.role() == Role::System {
            let text = flatten_text(message);
            system = Some(match system {
                Some(existing) => format!("{}\n{}", existing, text),
                None => text,
            });
            continue;
        }

        let content = claude_content(message);
        match turns.last_mut() {
            Some((role, previous)) if *role == message.role() => {
                *previous = merge_content(std::mem::take(previous), content);
            }
            _ => turns.push((message.role(), content)),
        }
    }

    if turns.first().is_some_and(|(role, _)| *role != Role::User) {
        turns.insert(0, (Role::User, Value::String(CLAUDE_START_TURN.to_string())));
    }

    let messages: Vec<Value> = turns
        .into_iter()
        .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_output_tokens,
        "stream": true,
        "temperature": TEMPERATURE,
    });
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        body["system"] = Value::String(system);
    }
    body
}

fn claude_content(message: &Message) -> Value {
    if message.attachments().is_empty() {
        return Value::String(message.content().to_string());
    }

    let mut parts = Vec::new();
    if !message.content().is_empty() {
        parts.push(text_part(message.content()));
    }
    for attachment in message.attachments() {
        let part = match attachment {
            Attachment::Text { content, .. } => text_part(content),
            Attachment::Image {
                media_type, data, ..
            } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
        };
        parts.push(part);
    }
    Value::Array(parts)
}

/// Join two same-role turns. Two strings join with a newline; otherwise
/// both become part lists.
fn merge_content(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::String(a), Value::String(b)) => Value::String(format!("{}\n{}", a, b)),
        (a, b) => {
            let mut parts = into_parts(a);
            parts.extend(into_parts(b));
            Value::Array(parts)
        }
    }
}

fn into_parts(content: Value) -> Vec<Value> {
    match content {
        Value::Array(parts) => parts,
        Value::String(text) if text.is_empty() => Vec::new(),
        Value::String(text) => vec![text_part(&text)],
        other => vec![other],
    }
}

fn flatten_text(message: &Message) -> String {
    let mut parts = vec![message.content().to_string()];
    for attachment in message.attachments() {
        match attachment {
            Attachment::Text { content, .. } => parts.push(content.clone()),
            Attachment::Image { .. } => parts.push("[image]".to_string()),
        }
    }
    parts.retain(|p| !p.is_empty());
    parts.join("\n")
}

fn text_part(text: &str) -> Value {
    json!({"type": "text", "text": text})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextAssembler, TokenCodec};
    use crate::models::ContextBudget;

    fn assemble(history: &[Message], system: Option<&str>) -> AssembledRequest {
        ContextAssembler::new(TokenCodec::approximate())
            .build(history, system, ContextBudget::new(100_000, 0))
            .unwrap()
    }

    #[test]
    fn test_model_family() {
        assert_eq!(ModelFamily::for_model("gpt-4.1"), ModelFamily::OpenAi);
        assert_eq!(ModelFamily::for_model("o3-mini"), ModelFamily::OpenAi);
        assert_eq!(ModelFamily::for_model("Claude-Sonnet-4"), ModelFamily::Claude);
        assert_eq!(ModelFamily::for_model("gemini-2.5-pro"), ModelFamily::Gemini);
        assert_eq!(ModelFamily::Claude.to_string(), "claude");
    }

    #[test]
    fn test_openai_payload() {
        let history = vec![
            Message::user("Describe this"),
            Message::assistant("Sure."),
            Message::user("Here")
                .with_attachment(Attachment::text("notes.txt", "[File: notes.txt]\nhi"))
                .with_attachment(Attachment::image("cat.png", "image/png", "QUJD")),
        ];
        let request = assemble(&history, Some("Be brief."));
        let prepared = prepare(&request, "gpt-4.1", &Endpoints::default(), 999);

        assert_eq!(prepared.family, ModelFamily::OpenAi);
        assert_eq!(prepared.endpoint, Endpoints::default().chat_completions);
        let body = &prepared.body;
        assert_eq!(body["model"], "gpt-4.1");
        assert_eq!(body["stream"], true);
        assert_eq!(body["n"], 1);
        assert_eq!(body["top_p"], 1);
        assert_eq!(body["temperature"], 0.1);
        assert!(body.get("max_tokens").is_none());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(messages[1]["content"], "Describe this");
        assert_eq!(
            messages[3]["content"],
            json!([
                {"type": "text", "text": "Here"},
                {"type": "text", "text": "[File: notes.txt]\nhi"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}},
            ])
        );
    }

    #[test]
    fn test_gemini_replaces_images() {
        let history = vec![Message::user("")
            .with_attachment(Attachment::image("cat.png", "image/png", "QUJD"))];
        let request = assemble(&history, None);
        let prepared = prepare(&request, "gemini-2.5-pro", &Endpoints::default(), 999);

        assert_eq!(prepared.family, ModelFamily::Gemini);
        let messages = prepared.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0]["content"],
            json!([{"type": "text", "text": GEMINI_IMAGE_NOTE}])
        );
    }

    #[test]
    fn test_claude_payload() {
        let history = vec![
            Message::assistant("Earlier answer"),
            Message::user("first"),
            Message::user("second")
                .with_attachment(Attachment::image("cat.png", "image/jpeg", "QUJD")),
            Message::assistant("reply"),
        ];
        let request = assemble(&history, Some("Be brief."));
        let prepared = prepare(&request, "claude-sonnet-4", &Endpoints::default(), 8192);

        assert_eq!(prepared.family, ModelFamily::Claude);
        assert_eq!(prepared.endpoint, Endpoints::default().claude_messages);
        let body = &prepared.body;
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["max_tokens"], 8192);
        assert!(body.get("n").is_none());
        assert!(body.get("top_p").is_none());

        let messages = body["messages"].as_array().unwrap();
        let roles: Vec<&str> = messages
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
        assert_eq!(messages[0]["content"], "(start)");
        assert_eq!(
            messages[2]["content"],
            json!([
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": "QUJD"}},
            ])
        );
    }

    #[test]
    fn test_claude_merges_plain_turns_and_system_messages() {
        let history = vec![
            Message::system("Extra rule."),
            Message::user("a"),
            Message::user("b"),
        ];
        let request = assemble(&history, None);
        let prepared = prepare(&request, "claude-opus-4.5", &Endpoints::default(), 100);
        let body = &prepared.body;
        assert_eq!(body["system"], "Extra rule.");
        assert_eq!(
            body["messages"],
            json!([{"role": "user", "content": "a\nb"}])
        );
    }
}
