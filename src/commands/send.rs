// ABOUTME: `send` command - runs the sender against a source table
// ABOUTME: Every flag has an environment fallback; missing credentials fail before any I/O

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::{self, ClientTlsConfig, DatabaseConfig, SenderConfig};
use crate::postgres::{PgHandle, PostgresRowSource};
use crate::sync::{CursorFile, SchemaPolicy, SenderOptions, SyncSender};
use crate::transport::{tls_connector, ClientTls, TcpDialer};

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Source PostgreSQL host
    #[arg(long, env = "SOURCE_HOST", default_value = "localhost")]
    pub source_host: String,
    #[arg(long, env = "SOURCE_PORT", default_value_t = 5432)]
    pub source_port: u16,
    #[arg(long = "source-db", env = "SOURCE_DB_NAME")]
    pub source_db: Option<String>,
    #[arg(long = "source-user", env = "SOURCE_DB_USER")]
    pub source_user: Option<String>,
    #[arg(long = "source-password", env = "SOURCE_DB_PASSWORD", hide_env_values = true)]
    pub source_password: Option<String>,
    #[arg(long, env = "SOURCE_SCHEMA", default_value = "public")]
    pub source_schema: String,
    /// Connect to the source database over TLS
    #[arg(long, env = "SOURCE_DB_TLS")]
    pub source_tls: bool,

    /// Table to ship
    #[arg(long, env = "TABLE_NAME")]
    pub table: Option<String>,
    /// Integer column that orders rows and drives the cursor
    #[arg(long, env = "KEY_COLUMN", default_value = "id")]
    pub key_column: String,
    /// Max rows per frame (0 = unlimited)
    #[arg(long, env = "BATCH_SIZE", default_value_t = 10_000)]
    pub batch_size: usize,
    /// Also re-send rows whose COLUMN changed within --lookback-interval
    #[arg(long, env = "LOOKBACK_COLUMN", value_name = "COLUMN")]
    pub lookback_column: Option<String>,
    /// PostgreSQL interval, e.g. "1 hour"
    #[arg(long, env = "LOOKBACK_INTERVAL", value_name = "INTERVAL")]
    pub lookback_interval: Option<String>,

    #[arg(long, env = "RECEIVER_HOST", default_value = "localhost")]
    pub receiver_host: String,
    #[arg(long, env = "RECEIVER_PORT", default_value_t = 443)]
    pub receiver_port: u16,
    /// Wrap the receiver connection in TLS
    #[arg(long, env = "TLS")]
    pub tls: bool,
    /// Extra CA certificate (PEM) trusted for the receiver
    #[arg(long, env = "TLS_CA_CERT", value_name = "PATH")]
    pub tls_ca_cert: Option<PathBuf>,
    /// Name to verify on the receiver certificate (defaults to --receiver-host)
    #[arg(long, env = "TLS_DOMAIN")]
    pub tls_domain: Option<String>,

    /// Seconds between sync cycles
    #[arg(
        long = "interval",
        env = "SYNC_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval_secs: u64,
    #[arg(long, env = "CURSOR_PATH", value_name = "PATH")]
    pub cursor_path: Option<PathBuf>,
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = relay_protocol::DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_bytes: usize,
    #[arg(long, env = "SCHEMA_POLICY", value_enum, default_value_t = SchemaPolicy::EveryFrame)]
    pub schema_policy: SchemaPolicy,
    /// Seconds one transmission (connect, TLS handshake, write, close) may take
    #[arg(
        long = "transmit-timeout",
        env = "TRANSMIT_TIMEOUT_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub transmit_timeout_secs: u64,
    /// Run one cycle and exit
    #[arg(long)]
    pub once: bool,

    #[arg(skip)]
    pub allow_self_signed_certs: bool,
}

impl TryFrom<SendArgs> for SenderConfig {
    type Error = anyhow::Error;

    fn try_from(args: SendArgs) -> Result<Self> {
        let source = DatabaseConfig {
            dbname: config::require(args.source_db, "source database name", "source-db", "SOURCE_DB_NAME")?,
            user: config::require(args.source_user, "source database user", "source-user", "SOURCE_DB_USER")?,
            password: config::require(
                args.source_password,
                "source database password",
                "source-password",
                "SOURCE_DB_PASSWORD",
            )?,
            host: args.source_host,
            port: args.source_port,
            schema: args.source_schema,
            tls: args.source_tls,
        };
        let table = config::require(args.table, "table name", "table", "TABLE_NAME")?;
        config::validate_identifiers([
            ("source schema", source.schema.as_str()),
            ("table name", table.as_str()),
            ("key column", args.key_column.as_str()),
        ])?;
        let lookback = config::lookback(args.lookback_column, args.lookback_interval)?;

        if args.max_frame_bytes == 0 {
            anyhow::bail!("--max-frame-bytes must be greater than zero");
        }

        let tls = args.tls.then(|| ClientTlsConfig {
            ca_cert: args.tls_ca_cert,
            domain: args
                .tls_domain
                .unwrap_or_else(|| args.receiver_host.clone()),
        });

        Ok(Self {
            source,
            table,
            key_column: args.key_column,
            batch_size: (args.batch_size > 0).then_some(args.batch_size),
            lookback,
            receiver_host: args.receiver_host,
            receiver_port: args.receiver_port,
            tls,
            allow_self_signed_certs: args.allow_self_signed_certs,
            cursor_path: args.cursor_path.unwrap_or_else(CursorFile::default_path),
            options: SenderOptions {
                interval: Duration::from_secs(args.interval_secs),
                max_frame_size: args.max_frame_bytes,
                schema_policy: args.schema_policy,
                transmit_timeout: Duration::from_secs(args.transmit_timeout_secs),
            },
            once: args.once,
        })
    }
}

pub async fn command(args: SendArgs) -> Result<()> {
    let config = SenderConfig::try_from(args)?;

    let handle = PgHandle::new(
        config.source.pg_config(),
        config.source.tls_connector(config.allow_self_signed_certs)?,
    );
    let source = PostgresRowSource::new(
        handle,
        &config.source.schema,
        &config.table,
        &config.key_column,
    )?
    .with_batch_size(config.batch_size)
    .with_lookback(config.lookback.clone())?;

    let mut dialer = TcpDialer::new(config.receiver_host.clone(), config.receiver_port);
    if let Some(tls) = &config.tls {
        dialer = dialer.with_tls(ClientTls {
            connector: tls_connector(tls.ca_cert.as_deref(), config.allow_self_signed_certs)?,
            domain: tls.domain.clone(),
        });
    }

    let mut sender = SyncSender::open(
        source,
        dialer,
        CursorFile::new(config.cursor_path.clone()),
        config.options.clone(),
    )
    .await?;

    if config.once {
        let report = sender.run_cycle().await.context("Sync cycle failed")?;
        println!(
            "{} rows sent, cursor: {}",
            report.rows,
            report
                .cursor
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    tracing::info!("Press Ctrl+C to stop");
    sender.run(shutdown_rx).await
}
