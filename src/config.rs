// ABOUTME: Validated runtime configuration for the send and receive commands
// ABOUTME: Built once from CLI/env arguments and handed to constructors, never global

use anyhow::{bail, Result};
use postgres_native_tls::MakeTlsConnector;
use std::path::PathBuf;

use crate::postgres::{make_tls, ApplyMode, Lookback};
use crate::sync::{ReceiverOptions, SenderOptions};
use crate::utils::validate_postgres_identifier;

/// Connection settings for one PostgreSQL store.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Schema holding the synced table
    pub schema: String,
    /// Connect with TLS
    pub tls: bool,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"***")
            .field("schema", &self.schema)
            .field("tls", &self.tls)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.dbname)
            .user(&self.user)
            .password(&self.password)
            .application_name("table-relay")
            .connect_timeout(std::time::Duration::from_secs(10));
        config
    }

    pub fn tls_connector(&self, accept_invalid_certs: bool) -> Result<Option<MakeTlsConnector>> {
        if self.tls {
            make_tls(accept_invalid_certs).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// TLS settings for the link to the receiver.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    /// Extra root certificate (PEM)
    pub ca_cert: Option<PathBuf>,
    /// Name the receiver certificate must match
    pub domain: String,
}

/// TLS identity the receiver presents.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    pub cert: PathBuf,
    /// PKCS#8 PEM private key
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub source: DatabaseConfig,
    pub table: String,
    pub key_column: String,
    pub batch_size: Option<usize>,
    pub lookback: Option<Lookback>,
    pub receiver_host: String,
    pub receiver_port: u16,
    pub tls: Option<ClientTlsConfig>,
    pub allow_self_signed_certs: bool,
    pub cursor_path: PathBuf,
    pub options: SenderOptions,
    /// Run a single cycle and exit
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub target: DatabaseConfig,
    pub listen_host: String,
    pub listen_port: u16,
    pub key_column: String,
    pub apply_mode: ApplyMode,
    pub tls: Option<ServerTlsConfig>,
    pub allow_self_signed_certs: bool,
    pub options: ReceiverOptions,
}

/// Unwrap a required setting or fail with a message naming both the flag and
/// the environment variable.
pub fn require(value: Option<String>, what: &str, flag: &str, env: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("Missing {}: pass --{} or set {}", what, flag, env),
    }
}

/// Check every identifier that will be spliced into SQL.
pub fn validate_identifiers<'a>(names: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<()> {
    for (what, name) in names {
        validate_postgres_identifier(name)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {:#}", what, e))?;
    }
    Ok(())
}

/// Lookback needs both a column and an interval, or neither.
pub fn lookback(column: Option<String>, interval: Option<String>) -> Result<Option<Lookback>> {
    match (column, interval) {
        (None, None) => Ok(None),
        (Some(column), Some(interval)) => {
            validate_postgres_identifier(&column)?;
            if interval.trim().is_empty() {
                bail!("Lookback interval cannot be empty");
            }
            Ok(Some(Lookback { column, interval }))
        }
        (Some(_), None) => bail!("--lookback-column requires --lookback-interval"),
        (None, Some(_)) => bail!("--lookback-interval requires --lookback-column"),
    }
}

/// The receiver certificate and key come as a pair.
pub fn server_tls(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<Option<ServerTlsConfig>> {
    match (cert, key) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(ServerTlsConfig { cert, key })),
        _ => bail!("--tls-cert and --tls-key must be given together"),
    }
}
