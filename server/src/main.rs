/*
 * main.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of mailcore, a self-hosted multi-tenant mail server.
 *
 * mailcore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * mailcore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with mailcore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! mailserverd: binds the SMTP, IMAP and POP3 listeners (§4.H) over a shared
//! `Store` and spawns one session task per accepted connection (§5).

mod config;

use clap::Parser;
use config::AppConfig;
use mailcore::auth::LockoutPolicy;
use mailcore::protocol::imap::ImapSession;
use mailcore::protocol::pop3::Pop3Session;
use mailcore::protocol::smtp::SmtpSession;
use mailcore::{Authenticator, DeliveryEngine, FolderManager, JwtCodec, MessageService, RefreshTokenStore, Store, SystemClock};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const HOSTNAME: &str = "mailcore";

#[derive(Parser, Debug)]
#[command(name = "mailserverd", about = "SMTP/IMAP/POP3 daemon for mailcore")]
struct Cli {
    /// Path (without extension) to a TOML configuration file.
    #[arg(long, env = "MAILCORE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    info!(smtp = config.ports.smtp, imap = config.ports.imap, pop3 = config.ports.pop3, "mailserverd starting");

    let store = Arc::new(Store::connect(&config.storage.connection_string).await?);

    let lockout_policy = LockoutPolicy {
        max_failed_attempts: config.account_lockout.max_failed_attempts as i64,
        lockout_duration: chrono::Duration::minutes(config.account_lockout.lockout_duration_minutes),
        reset_window: chrono::Duration::minutes(config.account_lockout.reset_window_minutes),
    };
    let authenticator = Arc::new(Authenticator::new(store.clone(), Arc::new(SystemClock), lockout_policy));
    let folder_manager = Arc::new(FolderManager::new(store.clone()));
    let message_service = Arc::new(MessageService::new(store.clone()));
    let delivery = Arc::new(DeliveryEngine::new(store.clone()));
    // Wired for future signing use; not yet consumed by the protocol sessions.
    let _jwt = Arc::new(JwtCodec::new(config.jwt.secret.clone().into_bytes()));
    let _refresh_tokens = Arc::new(RefreshTokenStore::new());

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            ctrl_c_token.cancel();
        }
    });

    let smtp_task = tokio::spawn(run_smtp_listener(
        config.bind_host.clone(),
        config.ports.smtp,
        authenticator.clone(),
        delivery.clone(),
        shutdown.clone(),
    ));
    let imap_task = tokio::spawn(run_imap_listener(
        config.bind_host.clone(),
        config.ports.imap,
        authenticator.clone(),
        folder_manager.clone(),
        message_service.clone(),
        store.clone(),
        shutdown.clone(),
    ));
    let pop3_task = tokio::spawn(run_pop3_listener(
        config.bind_host.clone(),
        config.ports.pop3,
        authenticator.clone(),
        message_service.clone(),
        store.clone(),
        shutdown.clone(),
    ));

    let _ = tokio::join!(smtp_task, imap_task, pop3_task);
    info!("mailserverd stopped");
    Ok(())
}

async fn run_smtp_listener(
    bind_host: String,
    port: u16,
    authenticator: Arc<Authenticator>,
    delivery: Arc<DeliveryEngine>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind_host.as_str(), port)).await?;
    info!(port, "smtp listener bound");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let session = SmtpSession::new(HOSTNAME, authenticator.clone(), delivery.clone());
                tokio::spawn(async move {
                    if let Err(e) = session.run(socket).await {
                        warn!(peer = %peer, error = %e, "smtp session ended with error");
                    }
                });
            }
        }
    }
}

async fn run_imap_listener(
    bind_host: String,
    port: u16,
    authenticator: Arc<Authenticator>,
    folder_manager: Arc<FolderManager>,
    message_service: Arc<MessageService>,
    store: Arc<Store>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind_host.as_str(), port)).await?;
    info!(port, "imap listener bound");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let session = ImapSession::new(HOSTNAME, authenticator.clone(), folder_manager.clone(), message_service.clone(), store.clone());
                tokio::spawn(async move {
                    if let Err(e) = session.run(socket).await {
                        warn!(peer = %peer, error = %e, "imap session ended with error");
                    }
                });
            }
        }
    }
}

async fn run_pop3_listener(
    bind_host: String,
    port: u16,
    authenticator: Arc<Authenticator>,
    message_service: Arc<MessageService>,
    store: Arc<Store>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind_host.as_str(), port)).await?;
    info!(port, "pop3 listener bound");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let session = Pop3Session::new(authenticator.clone(), message_service.clone(), store.clone());
                tokio::spawn(async move {
                    if let Err(e) = session.run(socket).await {
                        warn!(peer = %peer, error = %e, "pop3 session ended with error");
                    }
                });
            }
        }
    }
}
