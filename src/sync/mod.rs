// ABOUTME: Sync sessions and the seams they talk through
// ABOUTME: Sender pulls rows and ships frames; receiver applies them to the target store

pub mod cursor;
pub mod receiver;
pub mod sender;
pub mod source;
pub mod target;

pub use cursor::{Cursor, CursorFile, CursorState};
pub use receiver::{handle_connection, ConnectionReport, ReceiverOptions, ReceiverStats, SyncReceiver};
pub use sender::{CycleReport, SchemaPolicy, SenderOptions, SyncSender};
pub use source::{Extracted, RowSource};
pub use target::{apply_frame, ApplyReport, TargetStore};
