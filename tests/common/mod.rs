// ABOUTME: Shared fixtures for integration tests - in-memory source/target and a fault-injecting dialer
// ABOUTME: The dialer runs the real receiver connection handler on the other end of an in-process pipe
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use relay_protocol::{ColumnDescriptor, RowMap, Schema};
use serde_json::json;
use table_relay::sync::{
    handle_connection, ConnectionReport, Cursor, Extracted, ReceiverOptions, RowSource,
    TargetStore,
};
use table_relay::transport::{BoxedStream, Dialer};
use table_relay::SyncError;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const TABLE: &str = "users";

pub fn users_schema() -> Schema {
    Schema::new(vec![
        ColumnDescriptor::new("id", "integer"),
        ColumnDescriptor::new("name", "text"),
    ])
}

pub fn user(id: i64) -> RowMap {
    let mut row = RowMap::new();
    row.insert("id".into(), json!(id));
    row.insert("name".into(), json!(format!("user-{id}")));
    row
}

pub fn ids(rows: &[RowMap]) -> Vec<i64> {
    rows.iter()
        .map(|r| r["id"].as_i64().expect("integer id"))
        .collect()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Table held in memory. Clones share the same rows so a test can keep
/// inserting after the source moved into a sender.
#[derive(Clone)]
pub struct MemorySource {
    rows: Arc<Mutex<Vec<RowMap>>>,
    failures_left: Arc<AtomicUsize>,
    schema_reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            failures_left: Arc::new(AtomicUsize::new(0)),
            schema_reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        let source = Self::new();
        source.insert(ids);
        source
    }

    pub fn insert(&self, ids: impl IntoIterator<Item = i64>) {
        let mut rows = self.rows.lock().unwrap();
        rows.extend(ids.into_iter().map(user));
        rows.sort_by_key(|r| r["id"].as_i64());
    }

    /// Make the next `n` reads fail as if the database were down.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn schema_reads(&self) -> usize {
        self.schema_reads.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), SyncError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SyncError::SourceUnavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn read_since(&mut self, last: Option<Cursor>) -> Result<Extracted, SyncError> {
        self.check_available()?;
        let rows: Vec<RowMap> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| last.map_or(true, |c| r["id"].as_i64().unwrap() > c.value()))
            .cloned()
            .collect();
        let max = rows.iter().filter_map(|r| r["id"].as_i64()).max();
        Ok(Extracted {
            cursor: max.map(Cursor).or(last),
            rows,
        })
    }

    async fn read_schema(&mut self) -> Result<Schema, SyncError> {
        self.check_available()?;
        self.schema_reads.fetch_add(1, Ordering::SeqCst);
        Ok(users_schema())
    }

    fn table(&self) -> &str {
        TABLE
    }
}

/// Target store that keeps everything in memory and behaves like a table
/// without a primary key: every insert adds a row.
#[derive(Default)]
pub struct MemoryTarget {
    tables: Mutex<Vec<(String, Schema)>>,
    rows: Mutex<Vec<RowMap>>,
    creates: AtomicUsize,
    pub poison_id: Option<i64>,
    pub fail_schema: AtomicBool,
}

impl MemoryTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_poison(id: i64) -> Arc<Self> {
        Arc::new(Self {
            poison_id: Some(id),
            ..Default::default()
        })
    }

    pub fn rows(&self) -> Vec<RowMap> {
        self.rows.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<i64> {
        ids(&self.rows())
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn schema_of(&self, table: &str) -> Option<Schema> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, schema)| schema.clone())
    }
}

#[async_trait]
impl TargetStore for MemoryTarget {
    async fn apply_schema(&self, table: &str, schema: &Schema) -> Result<bool, SyncError> {
        if self.fail_schema.load(Ordering::SeqCst) {
            return Err(SyncError::SchemaApplyFailure {
                table: table.to_string(),
                detail: "permission denied for schema public".into(),
            });
        }
        let mut tables = self.tables.lock().unwrap();
        if tables.iter().any(|(name, _)| name == table) {
            return Ok(false);
        }
        tables.push((table.to_string(), schema.clone()));
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn insert_row(&self, table: &str, row: &RowMap) -> Result<(), SyncError> {
        if self.schema_of(table).is_none() {
            return Err(SyncError::RowApplyFailure {
                table: table.to_string(),
                detail: format!("relation \"{table}\" does not exist"),
            });
        }
        if self.poison_id.is_some() && row.get("id").and_then(|v| v.as_i64()) == self.poison_id {
            return Err(SyncError::RowApplyFailure {
                table: table.to_string(),
                detail: "value too long for type".into(),
            });
        }
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

/// What goes wrong on a particular dial.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// The connection cannot be opened.
    Refuse,
    /// Writes fail after this percentage of the first write reached the peer.
    CutAt(usize),
    /// Every byte arrives but closing the connection reports an error.
    FailShutdown,
    /// The peer accepts the connection and never reads: writes stay pending.
    Stall,
}

/// Dialer whose connections end in [`handle_connection`] running against a
/// target store, over an in-process pipe.
pub struct ChannelDialer {
    target: Arc<MemoryTarget>,
    options: ReceiverOptions,
    faults: Mutex<VecDeque<Fault>>,
    dials: AtomicUsize,
    handlers: Mutex<Vec<JoinHandle<ConnectionReport>>>,
    shutdown: watch::Sender<bool>,
}

impl ChannelDialer {
    pub fn new(target: Arc<MemoryTarget>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            target,
            options: ReceiverOptions::new(TABLE),
            faults: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Queue a fault for the next dial that has none queued before it.
    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push_back(fault);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Wait for every receiver-side handler spawned so far.
    pub async fn reports(&self) -> Vec<ConnectionReport> {
        let handlers: Vec<_> = self.handlers.lock().unwrap().drain(..).collect();
        let mut reports = Vec::new();
        for handler in handlers {
            reports.push(handler.await.expect("handler panicked"));
        }
        reports
    }
}

#[async_trait]
impl Dialer for ChannelDialer {
    async fn dial(&self) -> Result<BoxedStream, SyncError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let fault = self.faults.lock().unwrap().pop_front();
        if let Some(Fault::Refuse) = fault {
            return Err(SyncError::ConnectionFailure("connection refused".into()));
        }

        let (client, server) = tokio::io::duplex(64);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let target = Arc::clone(&self.target);
        let options = self.options.clone();
        let shutdown = self.shutdown.subscribe();
        let handler = tokio::spawn(async move {
            handle_connection(server, peer, target.as_ref(), &options, shutdown).await
        });
        self.handlers.lock().unwrap().push(handler);

        Ok(Box::new(FaultyStream::new(client, fault)))
    }

    fn peer(&self) -> String {
        "in-process receiver".to_string()
    }
}

/// Client end of the pipe with optional write or close failures.
pub struct FaultyStream {
    inner: DuplexStream,
    fault: Option<Fault>,
    budget: Option<usize>,
}

impl FaultyStream {
    fn new(inner: DuplexStream, fault: Option<Fault>) -> Self {
        Self {
            inner,
            fault,
            budget: None,
        }
    }
}

impl AsyncRead for FaultyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if let Some(Fault::Stall) = this.fault {
            return Poll::Pending;
        }
        if let Some(Fault::CutAt(percent)) = this.fault {
            let budget = *this.budget.get_or_insert(buf.len() * percent / 100);
            if budget == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection reset by peer",
                )));
            }
            let allowed = buf.len().min(budget);
            return match Pin::new(&mut this.inner).poll_write(cx, &buf[..allowed]) {
                Poll::Ready(Ok(n)) => {
                    this.budget = Some(budget - n);
                    Poll::Ready(Ok(n))
                }
                other => other,
            };
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let fail = matches!(self.fault, Some(Fault::FailShutdown));
        match Pin::new(&mut self.inner).poll_shutdown(cx) {
            Poll::Ready(Ok(())) if fail => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset while closing",
            ))),
            other => other,
        }
    }
}
