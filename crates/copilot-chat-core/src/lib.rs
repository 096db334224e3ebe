//! Core library for copilot-chat.
//!
//! Signs in to GitHub with the OAuth device flow, exchanges the identity
//! token for short-lived Copilot bearer tokens, fits conversation history
//! into a model's context window, and streams replies back as text
//! increments.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use copilot_chat_core::{AuthSessionManager, ChatClient, Config, ContextAssembler, Message, TokenCodec};
//! use futures::StreamExt;
//!
//! let config = Config::load()?;
//! let auth = AuthSessionManager::from_config(&config)?;
//! let client = ChatClient::from_config(&config, auth)?;
//!
//! let history = vec![Message::user("Hello")];
//! let assembler = ContextAssembler::new(TokenCodec::for_model(&config.model));
//! let request = assembler.build(&history, None, client.budget_for(&config.model))?;
//!
//! let mut reply = client.send(&request, &config.model);
//! while let Some(delta) = reply.next().await {
//!     print!("{}", delta?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod models;
pub mod utils;

#[cfg(test)]
mod testing;

pub use api::{ApiError, ChatClient, ChatStream, ModelCatalog, ModelLimits};
pub use auth::{AuthError, AuthSessionManager, AuthState, BearerToken, CredentialStore, PollStatus};
pub use config::Config;
pub use context::{ContextAssembler, ContextOverflowError, TokenCodec};
pub use models::{AssembledRequest, Attachment, ContextBudget, Message, Role};
