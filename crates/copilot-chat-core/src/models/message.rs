//! Conversation messages and their attachments.
//!
//! Messages are built once (text plus any attachments rendered by the
//! file-handling layer) and are immutable after that. The token cost of a
//! message is computed lazily and cached per codec configuration.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::context::TokenCodec;

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A file attached to a message, already rendered by the file-handling layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    /// Text extracted from a spreadsheet, CSV, or plain file. Counted verbatim.
    Text { name: String, content: String },
    /// Base64-encoded image bytes.
    Image {
        name: String,
        media_type: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
}

impl Attachment {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        Attachment::Text {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn image(
        name: impl Into<String>,
        media_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Attachment::Image {
            name: name.into(),
            media_type: media_type.into(),
            data: data.into(),
            width: None,
            height: None,
        }
    }

    /// Record pixel dimensions on an image attachment (no-op for text).
    pub fn with_dimensions(self, w: u32, h: u32) -> Self {
        match self {
            Attachment::Image {
                name,
                media_type,
                data,
                ..
            } => Attachment::Image {
                name,
                media_type,
                data,
                width: Some(w),
                height: Some(h),
            },
            other => other,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Attachment::Text { name, .. } | Attachment::Image { name, .. } => name,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Attachment::Image { .. })
    }

    /// `data:` URL for an image attachment.
    pub fn data_url(&self) -> Option<String> {
        match self {
            Attachment::Image {
                media_type, data, ..
            } => Some(format!("data:{};base64,{}", media_type, data)),
            Attachment::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedCount {
    codec_id: u64,
    tokens: usize,
}

/// A single conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<Attachment>,
    #[serde(skip)]
    token_count: OnceLock<CachedCount>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            token_count: OnceLock::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Add an attachment while the message is still being built.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self.token_count = OnceLock::new();
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn has_images(&self) -> bool {
        self.attachments.iter().any(Attachment::is_image)
    }

    /// Token cost of this message under `codec`.
    ///
    /// The first count is cached; later calls with a codec of the same
    /// configuration return the cached value.
    pub fn token_count(&self, codec: &TokenCodec) -> usize {
        if let Some(cached) = self.token_count.get() {
            if cached.codec_id == codec.id() {
                return cached.tokens;
            }
            return codec.count_message(self);
        }
        let tokens = codec.count_message(self);
        let _ = self.token_count.set(CachedCount {
            codec_id: codec.id(),
            tokens,
        });
        tokens
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.content == other.content
            && self.attachments == other.attachments
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        let role: Role = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, Role::User);
    }

    #[test]
    fn test_message_serde_skips_cache() {
        let msg = Message::user("hello").with_attachment(Attachment::text("a.csv", "x,y\n1,2"));
        let codec = TokenCodec::approximate();
        let _ = msg.token_count(&codec);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["attachments"][0]["type"], "text");
        assert!(json.get("token_count").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_token_count_cached_per_codec() {
        let msg = Message::user("a".repeat(30));
        let approx = TokenCodec::approximate();
        let first = msg.token_count(&approx);
        assert_eq!(first, msg.token_count(&approx));
        assert_eq!(first, approx.count_message(&msg));

        // A differently configured codec is not served from the cache
        let bare = TokenCodec::approximate().with_framing(crate::context::Framing::none());
        assert_eq!(msg.token_count(&bare), 10);
        assert_eq!(msg.token_count(&approx), first);
    }

    #[test]
    fn test_image_data_url() {
        let img = Attachment::image("cat.png", "image/png", "QUJD");
        assert_eq!(img.data_url().as_deref(), Some("data:image/png;base64,QUJD"));
        assert!(Attachment::text("a.txt", "x").data_url().is_none());

        let sized = img.with_dimensions(640, 480);
        assert!(matches!(
            sized,
            Attachment::Image {
                width: Some(640),
                height: Some(480),
                ..
            }
        ));
    }
}
