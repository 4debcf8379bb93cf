// ABOUTME: Error taxonomy shared by the sender and receiver sessions
// ABOUTME: Classifies failures so callers know whether to drop a cycle, a connection or a row

use relay_protocol::ProtocolError;

/// Every failure a sync session can observe.
///
/// Store and transport adapters map their native errors into one of these
/// variants; messages keep the full cause chain (`{:#}`) for the logs.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// Dial, accept, TLS handshake, read or write failure.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream closed with {buffered} bytes of an incomplete frame")]
    StreamClosed { buffered: usize },

    #[error("failed to apply schema to {table}: {detail}")]
    SchemaApplyFailure { table: String, detail: String },

    #[error("failed to apply row to {table}: {detail}")]
    RowApplyFailure { table: String, detail: String },

    #[error("cursor store error: {0}")]
    CursorStore(String),
}

impl SyncError {
    pub fn source_unavailable(err: impl Into<anyhow::Error>) -> Self {
        SyncError::SourceUnavailable(format!("{:#}", err.into()))
    }

    pub fn target_unavailable(err: impl Into<anyhow::Error>) -> Self {
        SyncError::TargetUnavailable(format!("{:#}", err.into()))
    }

    pub fn connection(err: impl Into<anyhow::Error>) -> Self {
        SyncError::ConnectionFailure(format!("{:#}", err.into()))
    }

    /// Short machine-friendly label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::TargetUnavailable(_) => "target_unavailable",
            SyncError::ConnectionFailure(_) => "connection_failure",
            SyncError::MalformedFrame(_) => "malformed_frame",
            SyncError::FrameTooLarge { .. } => "frame_too_large",
            SyncError::StreamClosed { .. } => "stream_closed",
            SyncError::SchemaApplyFailure { .. } => "schema_apply_failure",
            SyncError::RowApplyFailure { .. } => "row_apply_failure",
            SyncError::CursorStore(_) => "cursor_store",
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::FrameTooLarge { size, limit } => SyncError::FrameTooLarge { size, limit },
            ProtocolError::StreamClosed { buffered } => SyncError::StreamClosed { buffered },
            ProtocolError::Io(io) => SyncError::ConnectionFailure(io.to_string()),
            other @ (ProtocolError::Malformed(_)
            | ProtocolError::MissingSchema
            | ProtocolError::ArityMismatch { .. }) => SyncError::MalformedFrame(other.to_string()),
        }
    }
}
