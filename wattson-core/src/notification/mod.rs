//! The Notification Bus (spec §4.4, C4): topic-tagged publish with
//! per-recipient filtering, bounded history, and optional export.

pub mod bus;
pub mod export;
pub mod topic;

pub use bus::{NotificationBus, NotificationReceiver};
pub use export::NotificationExporter;
