// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod handlers;

use logservice::{Config, Pipeline};
use std::{env, process, sync::Arc};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(false)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("LOGSERVICE | Error creating server: {e}");
            process::exit(1);
        }
    };

    let listen_addr = env::var("LISTEN_ADDR")
        .ok()
        .filter(|val| !val.is_empty())
        .unwrap_or(DEFAULT_LISTEN_ADDR.to_string());
    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let address = format!("{listen_addr}:{port}");
    info!("LOGSERVICE | Server starting at {address}...");

    let pipeline = match Pipeline::new(&config) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            error!("LOGSERVICE | Error creating server: {e}");
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("LOGSERVICE | Error starting server: {e}");
            process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_signal(cancel.clone()));

    if let Err(e) = handlers::serve(listener, Arc::clone(&pipeline), cancel).await {
        error!("LOGSERVICE | Error serving requests: {e}");
    }

    if let Err(e) = pipeline.shutdown(SHUTDOWN_TIMEOUT).await {
        error!("LOGSERVICE | Error flushing buffered documents: {e}");
    }

    let stats = pipeline.stats();
    info!(
        "LOGSERVICE | Indexed [{}] documents from [{}] added with [{}] errors",
        stats.flushed, stats.added, stats.failed
    );
}

/// Cancels `cancel` on SIGINT, or SIGTERM on unix.
async fn wait_for_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("LOGSERVICE | Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("LOGSERVICE | Unable to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = interrupt => {
            debug!("LOGSERVICE | Received SIGINT");
        }
        () = terminate => {
            debug!("LOGSERVICE | Received SIGTERM");
        }
    }

    info!("LOGSERVICE | Server shutting down...");
    cancel.cancel();
}
