//! Chorus main binary.
//!
//! Loads the persona table, provisions missing access tokens, and runs one
//! persona runtime per configured bot.

mod aliases;
mod bot;
mod config;
mod reactions;
mod reply;
mod room;
#[cfg(test)]
mod testutil;

use crate::bot::{BotContext, BotRuntime};
use crate::config::BotsFile;
use anyhow::{Context, Result, bail};
use chorus_channels::{MatrixClient, RoomClient};
use chorus_llm::{ChatBackend, OllamaClient};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "chorus", version, about = "Chorus chat-room persona bots")]
struct Cli {
    /// Path to the persona configuration file.
    #[arg(long, env = "CHORUS_CONFIG", default_value = "bots.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every configured persona (default).
    Serve,
    /// Validate config and report what would run.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing()?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cli.config).await,
        Command::Doctor => doctor(&cli.config).await,
    }
}

async fn serve(config_path: &PathBuf) -> Result<()> {
    let mut file = BotsFile::load(config_path).await?;
    if file.bots.is_empty() {
        bail!("no bots configured in {}", config_path.display());
    }

    if provision_access_tokens(&mut file).await? {
        file.save(config_path).await?;
        tracing::info!(path = %config_path.display(), "persisted provisioned access tokens");
    }

    let mut handles = Vec::new();
    for persona in file.bots {
        let username = persona.username.clone();
        let token = persona
            .access_token
            .as_deref()
            .context("access token missing after provisioning")?;
        let client = MatrixClient::new(&persona.homeserver_url, token, &persona.user_id)
            .with_context(|| format!("matrix client for {username}"))?;
        let backend = OllamaClient::new(&persona.ollama_url);
        let ctx = Arc::new(BotContext::new(
            persona,
            Arc::new(client) as Arc<dyn RoomClient>,
            Arc::new(backend) as Arc<dyn ChatBackend>,
        )?);
        let runtime = BotRuntime::new(ctx);
        handles.push(tokio::spawn(async move {
            runtime
                .run()
                .await
                .with_context(|| format!("persona {username}"))
        }));
    }

    for handle in handles {
        handle.await.context("persona task panicked")??;
    }
    Ok(())
}

/// Register (or log in, for accounts that already exist) every persona that
/// has no access token yet. Returns true when the config needs saving.
async fn provision_access_tokens(file: &mut BotsFile) -> Result<bool> {
    let mut changed = false;
    for bot in &mut file.bots {
        if bot.access_token.is_some() {
            continue;
        }
        tracing::info!(username = %bot.username, "provisioning access token");
        let credentials = match MatrixClient::register(
            &bot.homeserver_url,
            &bot.username,
            &bot.password,
        )
        .await
        {
            Ok(credentials) => credentials,
            Err(register_error) => {
                tracing::debug!(%register_error, username = %bot.username, "register failed, trying login");
                MatrixClient::login(&bot.homeserver_url, &bot.username, &bot.password)
                    .await
                    .with_context(|| format!("neither register nor login worked for {}", bot.username))?
            }
        };
        bot.user_id = credentials.user_id.to_string();
        bot.access_token = Some(credentials.access_token);
        changed = true;
    }
    Ok(changed)
}

async fn doctor(config_path: &PathBuf) -> Result<()> {
    let file = BotsFile::load(config_path).await?;
    println!("chorus doctor: {} ({} bot(s))", config_path.display(), file.bots.len());
    for bot in &file.bots {
        aliases::compile_rules(&bot.message_aliases)
            .with_context(|| format!("message aliases for {}", bot.username))?;
        println!(
            "  {}: model={} homeserver={} respond={:?} reactions={} token={}",
            bot.username,
            bot.model,
            bot.homeserver_url,
            bot.respond,
            bot.reactions,
            if bot.access_token.is_some() { "present" } else { "will provision" },
        );
    }
    println!("config ok");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("info,chorus=debug,chorus_channels=debug,chorus_llm=debug"),
    };
    let log_format = std::env::var("CHORUS_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            bail!("unsupported CHORUS_LOG_FORMAT={other:?}; expected one of: json, pretty, compact");
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}
