//! Chat backend client for the Copilot API.
//!
//! This module provides the `ChatClient`, which turns an assembled request
//! into a streamed reply. Requests are authenticated with the short-lived
//! bearer token from `AuthSessionManager`; OpenAI and Gemini models use the
//! chat-completions endpoint and Claude models use the Messages endpoint.

pub mod client;
pub mod error;
pub mod models;
pub mod payload;
pub mod sse;
pub mod stream;
pub mod transport;

pub use client::ChatClient;
pub use error::ApiError;
pub use models::{ModelCatalog, ModelLimits};
pub use payload::{ModelFamily, PreparedRequest, DEFAULT_CLAUDE_MAX_TOKENS};
pub use sse::{SseDecoder, SseEvent};
pub use stream::ChatStream;
pub use transport::{copilot_headers, ByteStream, ChatTransport, HttpTransport};
