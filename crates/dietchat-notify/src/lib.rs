//! Push notifications for new chat messages.
//!
//! [`NotificationDispatcher`] runs after a message is committed. It resolves
//! the other party, skips delivery when that user is currently viewing the
//! conversation, and otherwise fans out to the native and web channels.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod expo;
pub mod web;

pub use channel::{
    DeliveryStatus, NativeNotification, NativePushChannel, NullNativePush, NullWebPush, PushData,
    WebNotification, WebPushChannel, WebTarget,
};
pub use dispatcher::{DispatchReport, NotificationDispatcher, SkipReason};
pub use error::PushError;
pub use expo::ExpoPushChannel;
pub use web::VapidWebPushChannel;
