//! Print job records
//!
//! One record is kept per print attempt, opened when streaming starts and
//! closed when the print finishes, is canceled, or the link is lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bookkeeping for a single print attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJobRecord {
    /// Unique identifier of the attempt
    pub id: Uuid,
    /// Display name of the printed item
    pub name: String,
    /// Program file, when the print streams from the host
    pub source: Option<String>,
    /// When streaming started
    pub print_start: DateTime<Utc>,
    /// When the attempt ended
    pub print_end: Option<DateTime<Utc>>,
    /// Whether the program ran to completion
    pub print_complete: bool,
}

impl PrintJobRecord {
    /// Open a record for a print starting now
    pub fn start(name: impl Into<String>, source: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source,
            print_start: Utc::now(),
            print_end: None,
            print_complete: false,
        }
    }

    /// Close the record
    pub fn finish(&mut self, complete: bool) {
        self.print_end = Some(Utc::now());
        self.print_complete = complete;
    }

    /// Whether the record has been closed
    pub fn is_closed(&self) -> bool {
        self.print_end.is_some()
    }

    /// Wall time between start and end, if closed
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.print_end.map(|end| end - self.print_start)
    }
}
