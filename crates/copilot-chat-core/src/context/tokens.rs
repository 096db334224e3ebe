//! Token counting for text, attachments, and whole messages.
//!
//! `TokenCodec` is a pure, thread-safe counter. BPE tables are loaded once
//! per process; if they cannot be loaded, counting falls back to a
//! character approximation (1 token ≈ 3 characters).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

use crate::models::{Attachment, Message};

/// Fixed token charge for an image when the backend's rule is unknown.
pub const DEFAULT_IMAGE_TOKENS: usize = 256;

/// Framing tokens charged per message by the chat message format.
pub const TOKENS_PER_MESSAGE: usize = 4;

/// Tokens charged once per request to prime the reply.
pub const REPLY_PRIMING_TOKENS: usize = 3;

/// Characters per token in the approximate fallback.
const APPROX_CHARS_PER_TOKEN: usize = 3;

static NEXT_CODEC_ID: AtomicU64 = AtomicU64::new(1);
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();

/// Tokenization table used for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    O200kBase,
    Cl100kBase,
    Approximate,
}

impl Encoding {
    /// Pick the table for a model identifier.
    ///
    /// Legacy `gpt-3.5` / `gpt-4` models (but not `gpt-4o`, `gpt-4.1`, ...)
    /// use `cl100k_base`; everything else uses `o200k_base`.
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        let legacy = id.starts_with("gpt-3.5")
            || id == "gpt-4"
            || id.starts_with("gpt-4-")
            || id.starts_with("gpt-4-turbo");
        if legacy {
            Encoding::Cl100kBase
        } else {
            Encoding::O200kBase
        }
    }

    fn bpe(&self) -> Option<&'static CoreBPE> {
        match self {
            Encoding::O200kBase => O200K
                .get_or_init(|| load_bpe("o200k_base", tiktoken_rs::o200k_base))
                .as_ref(),
            Encoding::Cl100kBase => CL100K
                .get_or_init(|| load_bpe("cl100k_base", tiktoken_rs::cl100k_base))
                .as_ref(),
            Encoding::Approximate => None,
        }
    }
}

fn load_bpe(name: &str, loader: fn() -> anyhow::Result<CoreBPE>) -> Option<CoreBPE> {
    match loader() {
        Ok(bpe) => {
            debug!(encoding = name, "Loaded BPE tables");
            Some(bpe)
        }
        Err(e) => {
            warn!(
                encoding = name,
                error = %e,
                "BPE tables unavailable, falling back to approximate token counts"
            );
            None
        }
    }
}

/// Per-message and per-request framing overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub per_message: usize,
    pub reply_priming: usize,
}

impl Framing {
    /// No framing overhead; counts are pure content.
    pub fn none() -> Self {
        Self {
            per_message: 0,
            reply_priming: 0,
        }
    }
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            per_message: TOKENS_PER_MESSAGE,
            reply_priming: REPLY_PRIMING_TOKENS,
        }
    }
}

/// Token charge rule for image attachments.
#[derive(Clone)]
pub enum ImageSurcharge {
    /// Same charge for every image.
    Fixed(usize),
    /// Tile accounting: `base + per_tile * tiles`, where the image is scaled
    /// to fit 2048x2048, then its short side to 768px, and cut into
    /// `tile_px` squares. Images without known dimensions are charged as
    /// four tiles.
    Tiled {
        base: usize,
        per_tile: usize,
        tile_px: u32,
    },
    /// Caller-supplied rule.
    Custom(Arc<dyn Fn(&Attachment) -> usize + Send + Sync>),
}

impl ImageSurcharge {
    /// OpenAI high-detail accounting (85 + 170 per 512px tile).
    pub fn openai_tiles() -> Self {
        ImageSurcharge::Tiled {
            base: 85,
            per_tile: 170,
            tile_px: 512,
        }
    }

    fn cost(&self, image: &Attachment) -> usize {
        match self {
            ImageSurcharge::Fixed(tokens) => *tokens,
            ImageSurcharge::Tiled {
                base,
                per_tile,
                tile_px,
            } => {
                let tiles = match image {
                    Attachment::Image {
                        width: Some(w),
                        height: Some(h),
                        ..
                    } => tile_count(*w, *h, *tile_px),
                    _ => 4,
                };
                base + per_tile * tiles
            }
            ImageSurcharge::Custom(rule) => rule(image),
        }
    }
}

impl Default for ImageSurcharge {
    fn default() -> Self {
        ImageSurcharge::Fixed(DEFAULT_IMAGE_TOKENS)
    }
}

impl fmt::Debug for ImageSurcharge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSurcharge::Fixed(tokens) => f.debug_tuple("Fixed").field(tokens).finish(),
            ImageSurcharge::Tiled {
                base,
                per_tile,
                tile_px,
            } => f
                .debug_struct("Tiled")
                .field("base", base)
                .field("per_tile", per_tile)
                .field("tile_px", tile_px)
                .finish(),
            ImageSurcharge::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn tile_count(width: u32, height: u32, tile_px: u32) -> usize {
    if width == 0 || height == 0 || tile_px == 0 {
        return 0;
    }
    let (mut w, mut h) = (width as f64, height as f64);

    let fit = (2048.0 / w).min(2048.0 / h);
    if fit < 1.0 {
        w *= fit;
        h *= fit;
    }
    let short = w.min(h);
    if short > 768.0 {
        let scale = 768.0 / short;
        w *= scale;
        h *= scale;
    }

    let tile = tile_px as f64;
    ((w / tile).ceil() * (h / tile).ceil()) as usize
}

/// Counts the token cost of text, attachments, and messages for a model.
///
/// Cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    id: u64,
    encoding: Encoding,
    framing: Framing,
    image_surcharge: ImageSurcharge,
}

impl TokenCodec {
    /// Codec for a model identifier.
    pub fn for_model(model_id: &str) -> Self {
        Self::with_encoding(Encoding::for_model(model_id))
    }

    /// Codec using only the character approximation.
    pub fn approximate() -> Self {
        Self::with_encoding(Encoding::Approximate)
    }

    pub fn with_encoding(encoding: Encoding) -> Self {
        Self {
            id: next_id(),
            encoding,
            framing: Framing::default(),
            image_surcharge: ImageSurcharge::default(),
        }
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self.id = next_id();
        self
    }

    pub fn with_image_surcharge(mut self, surcharge: ImageSurcharge) -> Self {
        self.image_surcharge = surcharge;
        self.id = next_id();
        self
    }

    /// Identifies this configuration for message-level caching.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Token count of plain text.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoding.bpe() {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => approximate(text),
        }
    }

    /// Token cost of one attachment. Text is counted verbatim; images use
    /// the configured surcharge.
    pub fn count_attachment(&self, attachment: &Attachment) -> usize {
        match attachment {
            Attachment::Text { content, .. } => self.count(content),
            Attachment::Image { .. } => self.image_surcharge.cost(attachment),
        }
    }

    /// Token cost of a whole message including framing.
    pub fn count_message(&self, message: &Message) -> usize {
        self.framing.per_message
            + self.count(message.content())
            + message
                .attachments()
                .iter()
                .map(|a| self.count_attachment(a))
                .sum::<usize>()
    }

    /// Token cost of a system prompt sent as its own message.
    pub fn count_system_prompt(&self, prompt: &str) -> usize {
        self.framing.per_message + self.count(prompt)
    }

    /// Fixed per-request overhead.
    pub fn reply_priming(&self) -> usize {
        self.framing.reply_priming
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::with_encoding(Encoding::O200kBase)
    }
}

fn next_id() -> u64 {
    NEXT_CODEC_ID.fetch_add(1, Ordering::Relaxed)
}

fn approximate(text: &str) -> usize {
    let chars = text.chars().count();
    ((chars + APPROX_CHARS_PER_TOKEN - 1) / APPROX_CHARS_PER_TOKEN).max(1)
}
