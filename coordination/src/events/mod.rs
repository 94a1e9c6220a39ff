//! Job progress events
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Orchestrator │────▶│ ProgressBus  │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │ EventHistory │
//!                      │ (last 256)   │
//!                      └──────────────┘
//! ```
//!
//! A subscriber that misses events (joined late, lagged) calls
//! [`ProgressBus::replay`] to resync. The job row in the document store is
//! the authoritative status.

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{
    EventBusError, EventBusResult, EventFilter, FilteredReceiver, ProgressBus, SharedProgressBus,
};
pub use history::{EventHistory, EventStats, DEFAULT_HISTORY_CAPACITY};
pub use types::{ProgressEvent, ProgressStage};
