//! View records.

use crate::{NodeId, ViewNumber};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A consensus epoch with one designated primary.
///
/// Views are created by the view-change coordinator and retired (but kept in
/// history) when the next view is adopted. A closed view is never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub number: ViewNumber,
    pub primary: NodeId,
    /// Local time at which this replica adopted the view.
    pub started_at: Duration,
}

impl View {
    pub fn new(number: ViewNumber, primary: NodeId, started_at: Duration) -> Self {
        Self {
            number,
            primary,
            started_at,
        }
    }
}
