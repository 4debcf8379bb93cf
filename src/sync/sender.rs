// ABOUTME: SyncSender - pulls new rows on a timer and ships them as frames
// ABOUTME: The cursor only advances after the frame was fully written and the connection closed

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use relay_protocol::{write_frame, Frame, Row, DEFAULT_MAX_FRAME_SIZE};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use super::cursor::{Cursor, CursorFile, CursorState};
use super::source::{Extracted, RowSource};
use crate::error::SyncError;
use crate::transport::Dialer;

/// When the table schema travels with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SchemaPolicy {
    /// With every frame that carries rows.
    #[default]
    EveryFrame,
    /// With the first committed frame of every sender process, even one without rows.
    Once,
}

#[derive(Debug, Clone)]
pub struct SenderOptions {
    /// Time between cycles
    pub interval: Duration,
    pub max_frame_size: usize,
    pub schema_policy: SchemaPolicy,
    /// Upper bound on one transmission, from dial to close
    pub transmit_timeout: Duration,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            schema_policy: SchemaPolicy::EveryFrame,
            transmit_timeout: Duration::from_secs(30),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// False when there was nothing to send and no connection was opened.
    pub transmitted: bool,
    pub rows: usize,
    pub schema_sent: bool,
    pub bytes: usize,
    /// Cursor after the cycle.
    pub cursor: Option<Cursor>,
    pub duration_ms: u64,
}

/// Sender side of a table relay.
///
/// Each cycle moves `Idle -> Extracting -> Transmitting -> Committed | Failed`.
/// A failed cycle leaves the cursor where it was and the next tick retries.
pub struct SyncSender<S, D> {
    source: S,
    dialer: D,
    cursor_file: CursorFile,
    options: SenderOptions,
    cursor: Option<Cursor>,
    schema_sent: bool,
}

impl<S, D> SyncSender<S, D>
where
    S: RowSource,
    D: Dialer,
{
    /// Create a sender, resuming from the cursor file if one exists.
    ///
    /// A corrupt cursor file, or one that tracks another table, is an error.
    pub async fn open(
        source: S,
        dialer: D,
        cursor_file: CursorFile,
        options: SenderOptions,
    ) -> Result<Self> {
        let cursor = cursor_file
            .load_for_table(source.table())
            .await
            .context("Failed to load sender cursor")?;

        match cursor {
            Some(c) => tracing::info!(
                table = source.table(),
                cursor = %c,
                path = ?cursor_file.path(),
                "Resuming from saved cursor"
            ),
            None => tracing::info!(
                table = source.table(),
                "No saved cursor, starting from the beginning"
            ),
        }

        Ok(Self {
            source,
            dialer,
            cursor_file,
            options,
            cursor,
            schema_sent: false,
        })
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    fn schema_pending(&self, extracted: &Extracted) -> bool {
        match self.options.schema_policy {
            SchemaPolicy::Once => !self.schema_sent,
            SchemaPolicy::EveryFrame => !extracted.is_empty(),
        }
    }

    /// Run one extract/transmit/commit cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        let start = Instant::now();
        let table = self.source.table().to_string();
        let cursor_text = display_cursor(self.cursor);

        let (extracted, schema) = match self.extract().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(
                    table = %table,
                    cursor = %cursor_text,
                    kind = e.kind(),
                    error = %e,
                    "Extraction failed, will retry next cycle"
                );
                return Err(e);
            }
        };

        if extracted.is_empty() && schema.is_none() {
            tracing::debug!(table = %table, cursor = %cursor_text, "No new rows");
            return Ok(CycleReport {
                cursor: self.cursor,
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        let rows = extracted.len();
        let next_cursor = Cursor::advance(self.cursor, extracted.cursor);
        let schema_attached = schema.is_some();
        let frame = Frame::new(schema, extracted.rows.into_iter().map(Row::Keyed).collect());

        let bytes = match self.transmit(&frame).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    table = %table,
                    cursor = %cursor_text,
                    rows,
                    peer = %self.dialer.peer(),
                    kind = e.kind(),
                    error = %e,
                    "Transmit failed, cursor not advanced"
                );
                return Err(e);
            }
        };

        if let Err(e) = self.commit(next_cursor, rows).await {
            tracing::error!(
                table = %table,
                cursor = %cursor_text,
                rows,
                kind = e.kind(),
                error = %e,
                "Frame sent but cursor could not be saved, rows will be sent again"
            );
            return Err(e);
        }
        if schema_attached {
            self.schema_sent = true;
        }

        let report = CycleReport {
            transmitted: true,
            rows,
            schema_sent: schema_attached,
            bytes,
            cursor: self.cursor,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            table = %table,
            rows,
            bytes,
            schema = schema_attached,
            cursor = %display_cursor(self.cursor),
            duration_ms = report.duration_ms,
            "Frame committed"
        );
        Ok(report)
    }

    async fn extract(&mut self) -> Result<(Extracted, Option<relay_protocol::Schema>), SyncError> {
        let extracted = self.source.read_since(self.cursor).await?;
        let schema = if self.schema_pending(&extracted) {
            Some(self.source.read_schema().await?)
        } else {
            None
        };
        Ok((extracted, schema))
    }

    /// Dial, write and close under `transmit_timeout`. A receiver that
    /// accepts but stops reading fails the cycle instead of stalling it.
    async fn transmit(&self, frame: &Frame) -> Result<usize, SyncError> {
        let limit = self.options.transmit_timeout;
        match tokio::time::timeout(limit, self.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ConnectionFailure(format!(
                "Timed out after {:?} sending frame to {}",
                limit,
                self.dialer.peer()
            ))),
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<usize, SyncError> {
        let mut stream = self.dialer.dial().await?;
        let bytes = write_frame(&mut stream, frame, self.options.max_frame_size).await?;
        stream.shutdown().await.map_err(|e| {
            SyncError::connection(anyhow::Error::new(e).context("Failed to close connection"))
        })?;
        Ok(bytes)
    }

    async fn commit(&mut self, next: Option<Cursor>, rows: usize) -> Result<(), SyncError> {
        if rows > 0 {
            if let Some(cursor) = next {
                let state = CursorState::new(self.source.table(), cursor, rows as u64);
                self.cursor_file
                    .save(&state)
                    .await
                    .map_err(|e| SyncError::CursorStore(format!("{:#}", e)))?;
            }
        }
        self.cursor = next;
        Ok(())
    }

    /// Run cycles on the configured interval until `shutdown` fires.
    ///
    /// The stop signal is only observed between cycles; a cycle in progress
    /// always runs to completion.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        tracing::info!(
            table = self.source.table(),
            peer = %self.dialer.peer(),
            interval = ?self.options.interval,
            schema_policy = ?self.options.schema_policy,
            transmit_timeout = ?self.options.transmit_timeout,
            "Starting sender"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping sender");
                    break;
                }
                _ = ticker.tick() => {}
            }

            cycles += 1;
            tracing::debug!(cycle = cycles, "Starting sync cycle");
            // Failures are logged inside the cycle.
            let _ = self.run_cycle().await;
        }

        tracing::info!(
            table = self.source.table(),
            cursor = %display_cursor(self.cursor),
            cycles,
            "Sender stopped"
        );
        Ok(())
    }
}

fn display_cursor(cursor: Option<Cursor>) -> String {
    cursor
        .map(|c| c.to_string())
        .unwrap_or_else(|| "beginning".to_string())
}
