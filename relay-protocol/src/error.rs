use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A complete frame body was received but could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// The stream ended while a frame was only partially received.
    #[error("stream closed with {buffered} bytes of an incomplete frame buffered")]
    StreamClosed { buffered: usize },

    #[error("positional row cannot be resolved without a schema")]
    MissingSchema,

    #[error("positional row has {actual} values but the schema has {expected} columns")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the error only concerns a single row, not the frame or stream.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            ProtocolError::MissingSchema | ProtocolError::ArityMismatch { .. }
        )
    }
}
