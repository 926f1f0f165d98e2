/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devsandbox_proxy::ask::AskChannel;
use devsandbox_proxy::ca::CertificateAuthority;
use devsandbox_proxy::creds::CredentialRegistry;
use devsandbox_proxy::filter::FilterEngine;
use devsandbox_proxy::lock::FileLock;
use devsandbox_proxy::logging::{
    FileFanoutRemoteLogWriter, NoopRemoteLogWriter, RequestLogger, RotatingLogWriter, WarningLog,
};
use devsandbox_proxy::redact::RedactionEngine;
use devsandbox_proxy::{Config, ProxyServer};

fn parse_config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

fn install_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_thread_names(false)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to install tracing subscriber");
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    install_tracing();

    let config = match Config::from_env_and_file(parse_config_path()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let sandbox_root = config.sandbox_root();
    if let Err(err) = std::fs::create_dir_all(&sandbox_root) {
        tracing::error!(error = %err, dir = ?sandbox_root, "failed to create sandbox root");
        std::process::exit(1);
    }

    let lock_path = sandbox_root.join("proxy.lock");
    let _lock = match FileLock::try_acquire(&lock_path) {
        Ok(lock) => lock,
        Err(err) => {
            tracing::error!(error = %err, "another proxy instance is already running in this sandbox");
            std::process::exit(1);
        }
    };

    let ca = match CertificateAuthority::load_or_create(&config.ca_dir()) {
        Ok(ca) => Arc::new(ca),
        Err(err) => {
            tracing::error!(error = %err, "failed to load or create certificate authority");
            std::process::exit(1);
        }
    };

    let filter = match FilterEngine::from_config(&config.filter) {
        Ok(filter) => Arc::new(filter),
        Err(err) => {
            tracing::error!(error = %err, "invalid filter configuration");
            std::process::exit(1);
        }
    };

    let redaction = match RedactionEngine::from_config(&config.redaction) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            tracing::error!(error = %err, "invalid redaction configuration");
            std::process::exit(1);
        }
    };

    let credentials = match CredentialRegistry::from_config(&config.credentials) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            tracing::error!(error = %err, "invalid credentials configuration");
            std::process::exit(1);
        }
    };

    if let Err(err) = credentials.validate_against_redaction(&redaction) {
        tracing::error!(error = %err, "credential injector collides with a redaction rule");
        std::process::exit(1);
    }

    let ask_timeout = Duration::from_secs(config.ask.timeout_secs());
    let _ask_lock = match FileLock::try_acquire(&config.ask_lock_path()) {
        Ok(lock) => Some(lock),
        Err(err) => {
            tracing::warn!(error = %err, "ask lock unavailable, continuing without it");
            None
        }
    };
    let ask = match AskChannel::connect(&config.ask_socket_path(), ask_timeout).await {
        Ok(channel) => Some(Arc::new(channel)),
        Err(err) => {
            tracing::warn!(error = %err, "ask channel unavailable, ask-action rules will be treated as blocks");
            None
        }
    };

    let writer = match RotatingLogWriter::open(
        &config.log_dir(),
        "requests",
        ".jsonl",
        config.log.max_segment_bytes(),
        config.log.max_files(),
    )
    .await
    {
        Ok(writer) => writer,
        Err(err) => {
            tracing::error!(error = %err, "failed to open request log");
            std::process::exit(1);
        }
    };

    let logger = if config.remote_log.is_enabled() {
        match FileFanoutRemoteLogWriter::open(&config.log_dir().join("remote")).await {
            Ok(remote) => Arc::new(RequestLogger::new(writer, Arc::new(remote))),
            Err(err) => {
                tracing::warn!(error = %err, "failed to open remote log fanout, continuing without it");
                Arc::new(RequestLogger::new(writer, Arc::new(NoopRemoteLogWriter)))
            }
        }
    } else {
        Arc::new(RequestLogger::without_remote(writer))
    };

    let warning_writer = match RotatingLogWriter::open(
        &config.log_dir(),
        "proxy",
        ".log",
        config.log.max_segment_bytes(),
        config.log.max_files(),
    )
    .await
    {
        Ok(writer) => writer,
        Err(err) => {
            tracing::error!(error = %err, "failed to open proxy warning log");
            std::process::exit(1);
        }
    };
    let warning_log = Arc::new(WarningLog::new(warning_writer));

    let server = Arc::new(ProxyServer::new(
        config.listen_addr().to_string(),
        ca,
        filter,
        redaction,
        credentials,
        ask,
        logger,
        warning_log,
        ask_timeout,
    ));

    let addr = match server.clone().run().await {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, "failed to start proxy");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "devsandbox-proxy is listening");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    server.stop().await;
}
