pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{
    encode_frame, read_frame, write_frame, DecodeStatus, FrameDecoder, DEFAULT_MAX_FRAME_SIZE,
    LENGTH_PREFIX_SIZE,
};
pub use error::ProtocolError;
pub use frame::{ColumnDescriptor, Frame, Row, RowMap, Schema, Value};
