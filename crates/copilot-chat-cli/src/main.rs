//! copilot-chat - chat with GitHub Copilot models from the terminal.
//!
//! Commands:
//! - `login`: sign in with the GitHub device flow
//! - `logout`: forget stored credentials
//! - `status`: show sign-in state and bearer token expiry
//! - `models`: list per-model token limits
//! - `chat [MODEL]`: interactive chat (the default)

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use copilot_chat_core::{
    ApiError, AssembledRequest, AuthError, AuthSessionManager, AuthState, ChatClient, Config,
    ContextAssembler, Message, TokenCodec,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file name prefix in the cache directory; the appender adds the date.
const LOG_FILE_PREFIX: &str = "copilot-chat";

const USAGE: &str = "\
Usage: copilot-chat [COMMAND]

Commands:
  login          Sign in with GitHub
  logout         Forget stored credentials
  status         Show sign-in state
  models         List available models and their token limits
  chat [MODEL]   Interactive chat (default)

Set RUST_LOG to control stderr logging (default: warn).";

/// Initialize logging to stderr plus a daily log file in the cache directory.
///
/// The returned guard flushes the file writer when dropped, so it must live
/// until the program exits.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let appender = config.cache_dir().ok().and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(dir)
            .ok()
    });
    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("chat");
    info!(command, "copilot-chat starting");

    let auth = AuthSessionManager::from_config(&config)?;
    match command {
        "login" => login(&auth).await,
        "logout" => logout(&auth),
        "status" => status(&auth).await,
        "models" => models(&config, auth).await,
        "chat" => {
            let model = args.get(1).cloned().unwrap_or_else(|| config.model.clone());
            chat(&config, auth, &model).await
        }
        "help" | "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

async fn login(auth: &AuthSessionManager) -> Result<()> {
    if auth.is_authenticated() {
        println!("Already signed in. Run `copilot-chat logout` to switch accounts.");
        return Ok(());
    }

    let device = auth
        .start_device_flow()
        .await
        .context("Failed to start sign-in")?;
    println!(
        "Open {} and enter the code: {}",
        device.verification_uri, device.user_code
    );
    println!(
        "Waiting for approval (code expires at {}, Ctrl-C to cancel)...",
        device
            .expires_at
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S")
    );

    let cancel = CancellationToken::new();
    let flow = tokio::spawn({
        let auth = auth.clone();
        let cancel = cancel.clone();
        async move { auth.run_device_flow(cancel).await }
    });

    tokio::select! {
        result = flow => {
            result.context("Sign-in task failed")?.context("Sign-in failed")?;
            println!("Signed in.");
        }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            println!("\nSign-in cancelled.");
        }
    }
    Ok(())
}

fn logout(auth: &AuthSessionManager) -> Result<()> {
    auth.sign_out().context("Failed to remove stored credentials")?;
    println!("Signed out.");
    Ok(())
}

async fn status(auth: &AuthSessionManager) -> Result<()> {
    let state = auth.state();
    println!("Sign-in state: {:?}", state);
    if matches!(state, AuthState::Unauthenticated | AuthState::Revoked) {
        println!("Run `copilot-chat login` to sign in.");
        return Ok(());
    }

    match auth.get_bearer_token().await {
        Ok(bearer) => println!(
            "Bearer token valid until {} ({} min)",
            bearer
                .expires_at()
                .with_timezone(&chrono::Local)
                .format("%H:%M:%S"),
            bearer.minutes_until_expiry()
        ),
        Err(e) => println!("Bearer token unavailable: {}", e),
    }
    Ok(())
}

async fn models(config: &Config, auth: AuthSessionManager) -> Result<()> {
    let client = ChatClient::from_config(config, auth)?;
    client
        .refresh_model_limits()
        .await
        .context("Failed to fetch model list")?;

    println!("{:<36} {:>10} {:>10} {:>10}", "MODEL", "CONTEXT", "PROMPT", "OUTPUT");
    for (id, limits) in client.catalog().entries() {
        println!(
            "{:<36} {:>10} {:>10} {:>10}",
            id,
            limits.max_context_window_tokens,
            limits.max_prompt_tokens,
            limits.max_output_tokens
        );
    }
    Ok(())
}

async fn chat(config: &Config, auth: AuthSessionManager, model: &str) -> Result<()> {
    if !auth.is_authenticated() {
        bail!("Not signed in. Run `copilot-chat login` first.");
    }

    let client = ChatClient::from_config(config, auth)?;
    if let Err(e) = client.refresh_model_limits().await {
        warn!(error = %e, "Using default context budget");
    }
    let assembler = ContextAssembler::new(TokenCodec::for_model(model));
    let budget = client.budget_for(model);
    info!(model, available = budget.available(), "Chat session started");

    let mut history: Vec<Message> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Chatting with {}. Ctrl-C stops a reply, Ctrl-D quits.", model);

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        history.push(Message::user(line));
        let request = match assembler.build(&history, config.system_prompt.as_deref(), budget) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("{}", e);
                history.pop();
                continue;
            }
        };
        if request.is_newest_dropped() {
            eprintln!(
                "Your message is too large for {}'s context window. Please shorten it.",
                model
            );
            history.pop();
            continue;
        }
        if request.dropped() > 0 {
            eprintln!(
                "({} older messages left out to fit the context window)",
                request.dropped()
            );
        }

        let (reply, error) = stream_reply(&client, &request, model).await;
        println!();
        if let Some(e) = error {
            eprintln!("Error: {}", e);
            if matches!(e, ApiError::Auth(AuthError::Rejected | AuthError::Unauthenticated)) {
                eprintln!("Run `copilot-chat login` to sign in again.");
            }
        }

        // Partial replies stay in the history
        if reply.is_empty() {
            history.pop();
        } else {
            history.push(Message::assistant(reply));
        }
    }
    Ok(())
}

/// Print the reply as it arrives. Ctrl-C stops this reply only.
async fn stream_reply(
    client: &ChatClient,
    request: &AssembledRequest,
    model: &str,
) -> (String, Option<ApiError>) {
    let mut stream = client.send(request, model);
    let mut text = String::new();
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(delta)) => {
                    print!("{}", delta);
                    let _ = stdout.flush();
                    text.push_str(&delta);
                }
                Some(Err(e)) => return (text, Some(e)),
                None => return (text, None),
            },
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                print!(" [stopped]");
                return (text, None);
            }
        }
    }
}
