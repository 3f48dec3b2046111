//! Metadata managers.
//!
//! The primary runs the [`DataManager`] (topic placement, produce routing and
//! the broker registry), the [`HealthMonitor`] and the [`PendingRequestQueue`].
//! Read-only managers run a [`ReadonlyManager`] that serves the consume path
//! from a pushed routing cache.

mod data;
mod health;
pub mod primary_http;
mod readonly;
pub mod readonly_http;
mod request_queue;

pub use data::{DataManager, ProduceReceipt};
pub use health::{HealthMonitor, CheckOutcome, TickReport};
pub use readonly::{ConsumeOutcome, ReadonlyManager};
pub use request_queue::{PendingRequestQueue, ReplayOutcome};
