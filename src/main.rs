/*
 * main.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a Microsoft 365 mail gateway.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Thin CLI around the gateway core: load and validate the configuration,
//! make sure a token exists (running the device login when needed), start
//! the watcher, flusher and listeners, and wait for ctrl-c.
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2 authentication
//! required but not obtainable, 3 unrecoverable startup error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use portalettere::api::{ErrorClass, MailBackend, MailError};
use portalettere::config::{Config, CONFIG_FILE_ENV};
use portalettere::graph::GraphClient;
use portalettere::listener::{self, Gateway};
use portalettere::net;
use portalettere::queue::{flusher, OutboundQueue};
use portalettere::reach;

#[derive(Parser)]
#[command(name = "portalettere", about = "SMTP/POP3 gateway for Microsoft 365")]
struct Cli {
    /// Path of the configuration file. Falls back to $M365_PROXY_CONFIG_FILE,
    /// then ./config.json.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let path = config_path(&cli);
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    net::install_crypto_provider();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let tls = match &config.tls {
        Some(material) => match net::load_tls_acceptor(material) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                eprintln!("configuration error: {}", e);
                return ExitCode::from(1);
            }
        },
        None => None,
    };

    let queue = match OutboundQueue::open(&config.queue_dir) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!("cannot open queue directory {}: {}", config.queue_dir.display(), e);
            return ExitCode::from(3);
        }
    };
    match queue.depth() {
        Ok(0) => {}
        Ok(depth) => info!("{} message(s) pending in the outbound queue", depth),
        Err(_) => {}
    }

    let client = match GraphClient::new(&config) {
        Ok(client) => client.with_device_prompt(Box::new(|url, code| {
            println!("To sign in, open {} in a browser and enter the code {}", url, code);
        })),
        Err(e) => {
            error!("cannot initialize the Graph client: {}", e);
            return ExitCode::from(3);
        }
    };

    // Make sure a token exists before accepting clients. A merely
    // unreachable Graph is fine: the queue covers the outage.
    match client.ensure_token().await {
        Ok(()) => {}
        Err(e) if e.class() == ErrorClass::Auth => {
            info!("no usable token; starting device sign-in for {}", config.upstream_user);
            match client.login_interactive().await {
                Ok(()) => {}
                Err(MailError::LoginRequired(reason)) => {
                    error!("sign-in not completed: {}", reason);
                    return ExitCode::from(2);
                }
                Err(e) => {
                    error!("sign-in failed: {}", e);
                    return ExitCode::from(3);
                }
            }
        }
        Err(e) if e.class() == ErrorClass::Retryable => {
            info!("Graph unreachable at startup ({}); continuing offline", e);
        }
        Err(e) => {
            error!("unrecoverable Graph error at startup: {}", e);
            return ExitCode::from(3);
        }
    }

    let backend: Arc<dyn MailBackend> = Arc::new(client);
    let cancel = CancellationToken::new();
    let (reachability, watcher) = reach::spawn_watcher(backend.clone(), cancel.clone());
    let flusher = flusher::spawn(
        queue.clone(),
        backend.clone(),
        reachability.clone(),
        cancel.clone(),
    );

    let gateway = Arc::new(Gateway {
        config,
        backend,
        queue,
        reach: reachability,
        tls,
    });

    let mut supervisor = tokio::spawn(listener::run(gateway, cancel.clone()));

    let mut exit = ExitCode::SUCCESS;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("interrupt received"),
                Err(e) => error!("cannot listen for ctrl-c: {}", e),
            }
        }
        result = &mut supervisor => {
            // The supervisor only returns early when binding failed.
            match result {
                Ok(Err(e)) => error!("listener error: {}", e),
                Err(e) => error!("supervisor task failed: {}", e),
                Ok(Ok(())) => {}
            }
            exit = ExitCode::from(3);
        }
    }

    // Stop Graph traffic sources first, then drain the sessions.
    cancel.cancel();
    let _ = watcher.await;
    let _ = flusher.await;
    if !supervisor.is_finished() {
        match supervisor.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("listener error: {}", e);
                exit = ExitCode::from(3);
            }
            Err(e) => {
                error!("supervisor task failed: {}", e);
                exit = ExitCode::from(3);
            }
        }
    }
    exit
}
