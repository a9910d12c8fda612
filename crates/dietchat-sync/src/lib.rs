//! Client-side conversation sync.
//!
//! A [`SyncSession`] keeps one conversation's message list consistent while
//! messages arrive from a bulk load, realtime events, polling and the
//! viewer's own sends. It also drives presence heartbeats and batched read
//! receipts.

pub mod api;
pub mod error;
pub mod merge;
pub mod realtime;
pub mod receipts;
pub mod session;

pub use api::{ConversationApi, FetchPage, HttpConversationApi};
pub use error::{RealtimeError, SyncError};
pub use realtime::{RealtimeFeed, RealtimeTransport, WsRealtime};
pub use receipts::ReceiptBatcher;
pub use session::{SyncCommand, SyncConfig, SyncMode, SyncSession, SyncSnapshot};
