#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Shared types for insight synchronization.
//!
//! Defines the managed [`Resource`], the time windows metrics are fetched
//! for, metric specifications and values, and the per-window
//! [`SyncState`] that is loaded from and persisted to a sink.

mod metric;
mod record;
mod window;

pub use metric::{AttemptOutcome, FetchAttempt, MetricSource, MetricSpec, MetricValue};
pub use record::{
    COMMENT_COLUMN, ID_COLUMN, NAME_COLUMN, RecordStatus, ResultRecord, STATUS_COLUMN, SyncState,
};
pub use window::{FetchWindow, InvalidWindowKeyError, Period, WindowKey};

use serde::{Deserialize, Serialize};

/// A managed page reachable through the master token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    /// Opaque identifier assigned by the API.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
}

impl Resource {
    /// Creates a new resource.
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}
