// ABOUTME: SyncReceiver - accepts sender connections and applies their frames
// ABOUTME: One task per connection; shutdown stops accepting and drains in-flight applies

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_protocol::{read_frame, FrameDecoder, Schema, DEFAULT_MAX_FRAME_SIZE};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_native_tls::TlsAcceptor;

use super::target::{apply_frame, TargetStore};
use crate::error::SyncError;
use crate::transport::{accept_stream, RelayStream};

pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Target table every frame is applied to
    pub table: String,
    /// Bytes requested per socket read
    pub recv_buffer_size: usize,
    pub max_frame_size: usize,
    /// How long a connection may keep reading after shutdown to complete a
    /// partially received frame
    pub drain_timeout: Duration,
}

impl ReceiverOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// What happened on one accepted connection.
#[derive(Debug)]
pub struct ConnectionReport {
    pub peer: SocketAddr,
    pub frames: usize,
    /// Frames dropped because their schema could not be applied.
    pub frames_rejected: usize,
    pub rows_applied: usize,
    pub rows_failed: usize,
    /// Why the connection ended, if not a clean close or shutdown.
    pub error: Option<SyncError>,
}

impl ConnectionReport {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            frames: 0,
            frames_rejected: 0,
            rows_applied: 0,
            rows_failed: 0,
            error: None,
        }
    }
}

/// Totals over the lifetime of [`SyncReceiver::serve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub connections: usize,
    pub failed_connections: usize,
    pub frames: usize,
    pub rows_applied: usize,
    pub rows_failed: usize,
}

impl ReceiverStats {
    fn record(&mut self, report: &ConnectionReport) {
        self.connections += 1;
        if report.error.is_some() {
            self.failed_connections += 1;
        }
        self.frames += report.frames;
        self.rows_applied += report.rows_applied;
        self.rows_failed += report.rows_failed;
    }
}

/// Read frames from one connection and apply them until the peer closes,
/// the stream fails, or `shutdown` flips to `true`.
///
/// Shutdown is only observed between frames: an apply in progress finishes,
/// and a frame that is partially received keeps being read for up to
/// `options.drain_timeout` so its rows are not lost.
pub async fn handle_connection<S, T>(
    mut stream: S,
    peer: SocketAddr,
    store: &T,
    options: &ReceiverOptions,
    mut shutdown: watch::Receiver<bool>,
) -> ConnectionReport
where
    S: RelayStream,
    T: TargetStore + ?Sized,
{
    let mut report = ConnectionReport::new(peer);
    let mut decoder = FrameDecoder::new(options.max_frame_size);
    let mut last_schema: Option<Schema> = None;
    let table = options.table.as_str();
    let mut drain_deadline: Option<Instant> = None;

    tracing::debug!(%peer, "Connection opened");

    loop {
        if drain_deadline.is_none() && *shutdown.borrow() {
            drain_deadline = Some(Instant::now() + options.drain_timeout);
        }

        let next = match drain_deadline {
            Some(deadline) => {
                let buffered = decoder.buffered();
                if buffered == 0 {
                    tracing::debug!(%peer, "Shutdown requested, closing connection");
                    break;
                }
                tracing::info!(
                    %peer,
                    table,
                    buffered,
                    "Shutdown requested, finishing partially received frame"
                );
                let read = read_frame(&mut stream, &mut decoder, options.recv_buffer_size);
                match tokio::time::timeout_at(deadline, read).await {
                    Ok(next) => next,
                    Err(_) => {
                        let e = SyncError::StreamClosed {
                            buffered: decoder.buffered(),
                        };
                        tracing::error!(
                            %peer,
                            table,
                            buffered = decoder.buffered(),
                            drain_timeout = ?options.drain_timeout,
                            kind = e.kind(),
                            "Partial frame discarded: peer did not finish it before the drain timeout"
                        );
                        report.error = Some(e);
                        break;
                    }
                }
            }
            None => tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Shutdown handle dropped: treat as a shutdown request.
                        drain_deadline = Some(Instant::now() + options.drain_timeout);
                    }
                    continue;
                }
                next = read_frame(&mut stream, &mut decoder, options.recv_buffer_size) => next,
            },
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(%peer, frames = report.frames, "Peer closed connection");
                break;
            }
            Err(e) => {
                let e = SyncError::from(e);
                tracing::warn!(
                    %peer,
                    table,
                    kind = e.kind(),
                    error = %e,
                    "Dropping connection"
                );
                report.error = Some(e);
                break;
            }
        };

        report.frames += 1;
        match apply_frame(store, table, &frame, &mut last_schema).await {
            Ok(applied) => {
                report.rows_applied += applied.rows_applied;
                report.rows_failed += applied.rows_failed();
                tracing::info!(
                    %peer,
                    table,
                    rows = applied.rows_applied,
                    failed = applied.rows_failed(),
                    schema = applied.schema_received,
                    "Frame applied"
                );
            }
            Err(e) => {
                report.frames_rejected += 1;
                tracing::error!(
                    %peer,
                    table,
                    rows = frame.row_count(),
                    kind = e.kind(),
                    error = %e,
                    "Frame rejected"
                );
            }
        }
    }

    report
}

/// Receiver side of a table relay.
pub struct SyncReceiver<T> {
    store: Arc<T>,
    options: Arc<ReceiverOptions>,
}

impl<T> SyncReceiver<T>
where
    T: TargetStore + 'static,
{
    pub fn new(store: Arc<T>, options: ReceiverOptions) -> Self {
        Self {
            store,
            options: Arc::new(options),
        }
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// connection task to finish.
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> ReceiverStats {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks: JoinSet<ConnectionReport> = JoinSet::new();
        let mut stats = ReceiverStats::default();

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            table = %self.options.table,
            tls = tls.is_some(),
            "Receiver listening"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_joined(&mut stats, joined);
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = Arc::clone(&self.store);
                        let options = Arc::clone(&self.options);
                        let tls = tls.clone();
                        let stop = stop_rx.clone();
                        tasks.spawn(async move {
                            match accept_stream(stream, peer, tls.as_ref()).await {
                                Ok(stream) => {
                                    handle_connection(stream, peer, store.as_ref(), &options, stop).await
                                }
                                Err(e) => {
                                    tracing::warn!(%peer, kind = e.kind(), error = %e, "Connection setup failed");
                                    let mut report = ConnectionReport::new(peer);
                                    report.error = Some(e);
                                    report
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        let _ = stop_tx.send(true);
        if !tasks.is_empty() {
            tracing::info!(connections = tasks.len(), "Waiting for open connections to finish");
        }
        while let Some(joined) = tasks.join_next().await {
            record_joined(&mut stats, joined);
        }

        tracing::info!(
            connections = stats.connections,
            frames = stats.frames,
            rows_applied = stats.rows_applied,
            rows_failed = stats.rows_failed,
            "Receiver stopped"
        );
        stats
    }
}

fn record_joined(
    stats: &mut ReceiverStats,
    joined: Result<ConnectionReport, tokio::task::JoinError>,
) {
    match joined {
        Ok(report) => stats.record(&report),
        Err(e) => {
            stats.connections += 1;
            stats.failed_connections += 1;
            tracing::error!(error = %e, "Connection task panicked");
        }
    }
}
