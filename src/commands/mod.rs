// ABOUTME: Command implementations for the table-relay CLI
// ABOUTME: Exports the send, receive and cursor commands

pub mod cursor;
pub mod receive;
pub mod send;

pub use cursor::CursorArgs;
pub use receive::ReceiveArgs;
pub use send::SendArgs;
