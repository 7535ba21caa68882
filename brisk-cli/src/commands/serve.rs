use std::path::PathBuf;

use anyhow::{Context, Result};
use brisk::prelude::*;
use clap::Args;
use colored::Colorize;

#[derive(Args)]
pub struct ServeArgs {
    /// Read this file instead of searching the config paths
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Service name used for the config search path
    #[arg(short, long, default_value = "brisk")]
    service: String,

    /// Override the bind address
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Shared token clients must send when authentication is enabled
    #[arg(long, env = "BRISK_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Send every message back to its sender
    #[arg(long)]
    echo: bool,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let mut config = super::config::load(args.config.as_deref(), &args.service)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    init_tracing(&config.logging).context("Failed to initialize logging")?;

    let auth = config.server.auth;
    let mut builder = ServerBuilder::new()
        .config(config)
        .hooks(CliHooks { echo: args.echo });

    if auth == AuthMode::Enabled {
        let token = args
            .token
            .context("Authentication is enabled; pass --token or set BRISK_AUTH_TOKEN")?;
        builder = builder.authenticator(TokenAuthenticator { token });
    }

    let server = builder.build().await.context("Failed to build server")?;
    println!(
        "{} {} on {}",
        "Serving".green().bold(),
        server.config().server.name.cyan(),
        server.addr()
    );

    server.serve().await?;
    brisk::observability::shutdown_tracing();
    Ok(())
}

/// Logging hooks, optionally echoing messages
struct CliHooks {
    echo: bool,
}

#[async_trait]
impl ServerHooks for CliHooks {
    async fn on_message_received(&self, server: &ServerHandle, client_id: &str, message: &Message) {
        tracing::debug!(client_id, event = %message.event, "Message received");
        if self.echo {
            if let Err(e) = server.send_to(client_id, message).await {
                tracing::warn!(client_id, error = %e, "Echo failed");
            }
        }
    }
}

/// Accepts auth messages carrying the shared token
///
/// The client id comes from the payload's `client_id`, falling back to the
/// connection's provisional id.
struct TokenAuthenticator {
    token: String,
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, client_id: &str, message: &Message) -> AuthOutcome {
        if message.payload_str("token") != Some(self.token.as_str()) {
            return AuthOutcome::reject("invalid token");
        }
        let id = message.payload_str("client_id").unwrap_or(client_id);
        AuthOutcome::accept(id)
    }
}
