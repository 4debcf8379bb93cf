// ABOUTME: PostgreSQL connection handling shared by the row source and the target store
// ABOUTME: Spawns the connection task and reconnects lazily after the link drops

pub mod source;
pub mod target;

pub use source::{Lookback, PostgresRowSource};
pub use target::{ApplyMode, PostgresTarget};

use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config, NoTls};

use crate::utils::retry_with_backoff;

/// Connect to PostgreSQL and drive the connection on a background task.
///
/// `tls` of `None` connects in plain text.
pub async fn connect(config: &Config, tls: Option<MakeTlsConnector>) -> Result<Client> {
    let client = match tls {
        None => {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .with_context(|| format!("Failed to connect to {}", describe(config)))?;
            spawn_connection(connection);
            client
        }
        Some(tls) => {
            let (client, connection) = config
                .connect(tls)
                .await
                .with_context(|| format!("Failed to connect to {} over TLS", describe(config)))?;
            spawn_connection(connection);
            client
        }
    };
    Ok(client)
}

/// TLS connector for store connections.
pub fn make_tls(accept_invalid_certs: bool) -> Result<MakeTlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .context("Failed to build TLS connector for PostgreSQL")?;
    Ok(MakeTlsConnector::new(connector))
}

fn spawn_connection<F>(connection: F)
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "PostgreSQL connection error");
        }
    });
}

/// `user@host:port/dbname`, without the password.
pub fn describe(config: &Config) -> String {
    let host = config
        .get_hosts()
        .first()
        .map(|h| match h {
            tokio_postgres::config::Host::Tcp(name) => name.clone(),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(path) => path.display().to_string(),
        })
        .unwrap_or_else(|| "localhost".to_string());
    let port = config.get_ports().first().copied().unwrap_or(5432);
    format!(
        "{}@{}:{}/{}",
        config.get_user().unwrap_or(""),
        host,
        port,
        config.get_dbname().unwrap_or("")
    )
}

/// A client that is (re)opened on demand.
///
/// After the server or network drops the link, the next call to
/// [`PgHandle::client`] opens a fresh connection.
pub struct PgHandle {
    config: Config,
    tls: Option<MakeTlsConnector>,
    client: Mutex<Option<Arc<Client>>>,
}

impl PgHandle {
    pub fn new(config: Config, tls: Option<MakeTlsConnector>) -> Self {
        Self {
            config,
            tls,
            client: Mutex::new(None),
        }
    }

    pub fn describe(&self) -> String {
        describe(&self.config)
    }

    pub async fn client(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            tracing::warn!(db = %self.describe(), "PostgreSQL connection lost, reconnecting");
        }

        let client = Arc::new(connect(&self.config, self.tls.clone()).await?);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Open the connection now, retrying with backoff.
    pub async fn warm_up(&self) -> Result<()> {
        retry_with_backoff(|| self.client(), 3, Duration::from_secs(1))
            .await
            .map(|_| ())
    }
}
