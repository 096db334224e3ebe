//! Token accounting and context-window assembly.

mod assembler;
mod tokens;

pub use assembler::{ContextAssembler, ContextOverflowError};
pub use tokens::{
    Encoding, Framing, ImageSurcharge, TokenCodec, DEFAULT_IMAGE_TOKENS, REPLY_PRIMING_TOKENS,
    TOKENS_PER_MESSAGE,
};
