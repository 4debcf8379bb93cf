// ABOUTME: `receive` command - listens for senders and applies frames to the target table
// ABOUTME: Verifies the target connection before accepting anything

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{self, DatabaseConfig, ReceiverConfig};
use crate::postgres::{ApplyMode, PgHandle, PostgresTarget};
use crate::sync::{ReceiverOptions, SyncReceiver};
use crate::transport::{bind, tls_acceptor};

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    #[arg(long, env = "LISTEN_HOST", default_value = "127.0.0.1")]
    pub listen_host: String,
    #[arg(long, env = "LISTEN_PORT", default_value_t = 443)]
    pub listen_port: u16,
    /// Certificate chain (PEM) presented to senders; enables TLS
    #[arg(long, env = "TLS_CERT", value_name = "PATH")]
    pub tls_cert: Option<PathBuf>,
    /// PKCS#8 private key (PEM) matching --tls-cert
    #[arg(long, env = "TLS_KEY", value_name = "PATH")]
    pub tls_key: Option<PathBuf>,

    /// Target PostgreSQL host
    #[arg(long, env = "TARGET_HOST", default_value = "localhost")]
    pub target_host: String,
    #[arg(long, env = "TARGET_PORT", default_value_t = 5432)]
    pub target_port: u16,
    #[arg(long = "target-db", env = "TARGET_DB_NAME")]
    pub target_db: Option<String>,
    #[arg(long = "target-user", env = "TARGET_DB_USER")]
    pub target_user: Option<String>,
    #[arg(long = "target-password", env = "TARGET_DB_PASSWORD", hide_env_values = true)]
    pub target_password: Option<String>,
    #[arg(long, env = "TARGET_SCHEMA", default_value = "public")]
    pub target_schema: String,
    /// Connect to the target database over TLS
    #[arg(long, env = "TARGET_DB_TLS")]
    pub target_tls: bool,

    /// Table every received frame is written to
    #[arg(long, env = "TABLE_NAME")]
    pub table: Option<String>,
    #[arg(long, env = "APPLY_MODE", value_enum, default_value_t = ApplyMode::Insert)]
    pub apply_mode: ApplyMode,
    /// Conflict column for --apply-mode upsert
    #[arg(long, env = "KEY_COLUMN", default_value = "id")]
    pub key_column: String,
    /// Bytes requested per socket read
    #[arg(
        long,
        env = "RECV_BUFFER_SIZE",
        default_value_t = crate::sync::receiver::DEFAULT_RECV_BUFFER_SIZE
    )]
    pub recv_buffer_size: usize,
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = relay_protocol::DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_bytes: usize,
    /// Seconds an open connection may take to finish a partial frame after Ctrl+C
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 10)]
    pub drain_timeout_secs: u64,

    #[arg(skip)]
    pub allow_self_signed_certs: bool,
}

impl TryFrom<ReceiveArgs> for ReceiverConfig {
    type Error = anyhow::Error;

    fn try_from(args: ReceiveArgs) -> Result<Self> {
        let target = DatabaseConfig {
            dbname: config::require(args.target_db, "target database name", "target-db", "TARGET_DB_NAME")?,
            user: config::require(args.target_user, "target database user", "target-user", "TARGET_DB_USER")?,
            password: config::require(
                args.target_password,
                "target database password",
                "target-password",
                "TARGET_DB_PASSWORD",
            )?,
            host: args.target_host,
            port: args.target_port,
            schema: args.target_schema,
            tls: args.target_tls,
        };
        let table = config::require(args.table, "table name", "table", "TABLE_NAME")?;
        config::validate_identifiers([
            ("target schema", target.schema.as_str()),
            ("table name", table.as_str()),
            ("key column", args.key_column.as_str()),
        ])?;

        if args.recv_buffer_size == 0 {
            anyhow::bail!("--recv-buffer-size must be greater than zero");
        }
        if args.max_frame_bytes == 0 {
            anyhow::bail!("--max-frame-bytes must be greater than zero");
        }

        Ok(Self {
            target,
            listen_host: args.listen_host,
            listen_port: args.listen_port,
            key_column: args.key_column,
            apply_mode: args.apply_mode,
            tls: config::server_tls(args.tls_cert, args.tls_key)?,
            allow_self_signed_certs: args.allow_self_signed_certs,
            options: ReceiverOptions {
                table,
                recv_buffer_size: args.recv_buffer_size,
                max_frame_size: args.max_frame_bytes,
                drain_timeout: Duration::from_secs(args.drain_timeout_secs),
            },
        })
    }
}

pub async fn command(args: ReceiveArgs) -> Result<()> {
    let config = ReceiverConfig::try_from(args)?;

    let acceptor = match &config.tls {
        Some(tls) => Some(tls_acceptor(&tls.cert, &tls.key)?),
        None => None,
    };

    let handle = PgHandle::new(
        config.target.pg_config(),
        config.target.tls_connector(config.allow_self_signed_certs)?,
    );
    handle
        .warm_up()
        .await
        .with_context(|| format!("Target database {} is not reachable", handle.describe()))?;

    let target = PostgresTarget::new(
        handle,
        &config.target.schema,
        config.apply_mode,
        &config.key_column,
    )?;
    let listener = bind(&config.listen_host, config.listen_port).await?;
    let receiver = SyncReceiver::new(Arc::new(target), config.options.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        mode = ?config.apply_mode,
        "Press Ctrl+C to stop"
    );
    let stats = receiver.serve(listener, acceptor, shutdown_rx).await;
    println!(
        "{} connections, {} rows applied, {} rows failed",
        stats.connections, stats.rows_applied, stats.rows_failed
    );
    Ok(())
}
