//! Messaging adapters and the inbound fan-in.

pub mod discord;
pub mod manager;
pub mod traits;

pub use manager::{AdapterSink, MessagingManager};
pub use traits::{Messaging, MessagingDyn};
