//! Work channel: fire-and-forget transport of "a chunk is ready" notifications.

pub mod channel;
pub mod in_memory;
pub mod notification;

pub use channel::{Subscription, WorkChannel};
pub use in_memory::{InMemoryChannelError, InMemoryWorkChannel};
pub use notification::JobWorkNotification;
