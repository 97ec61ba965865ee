//! Session lifecycle tracking.
//!
//! The control loop reports what happens during a run through
//! [`SessionTracker`]; the tracker keeps a live [`SessionSnapshot`] and
//! [`SessionAnalytics`] per session and takes care of getting that state into
//! storage (through the event bus, direct writes, buffered updates and
//! periodic auto-saves).

mod analytics;
mod snapshot;
mod tracker;


pub use analytics::{CostPoint, FileActivity, SessionAnalytics, ToolStats};
pub use snapshot::{SessionSnapshot, RECENT_EVENT_CAPACITY};
pub use tracker::{SessionTracker, TrackerHealth};
