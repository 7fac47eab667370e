//! Best-effort page telemetry: a page-view record on load and beacon events
//! for outbound and file-download link clicks.

pub mod config;
pub mod event;
pub mod hooks;
pub mod page;
pub mod selector;
pub mod sender;
pub mod tracker;

pub use event::{InteractionEvent, PageViewEvent};
pub use page::{Anchor, PageEnvironment, StaticPage};
pub use sender::{BestEffortSender, HttpSender, RecordingSender, TransportFailure};
pub use tracker::{Endpoints, InitReport, Tracker, TrackerError};
