//! Notification routing: filter policies, messages, the broadcast channel,
//! and durable queues.

mod channel;
mod filter;
mod message;
mod queue;

pub use channel::{NotificationChannel, SubscriptionId};
pub use filter::{NotificationFilterPolicy, StringFilter, ACCOUNT_ATTRIBUTE, ALL, REGION_ATTRIBUTE};
pub use message::{ArtifactNotification, NotificationMessage};
pub use queue::{DeadLetter, DurableQueue, ReceivedMessage, RedrivePolicy, MAX_VISIBILITY_TIMEOUT};
