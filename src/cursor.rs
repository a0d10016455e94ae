//! The three-valued connection cursor: unknown (never fetched), known-null
//! (empty connection / at start), known-string.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndCursor {
    /// The connection has never been fetched.
    Unknown,
    /// The connection was fetched and is empty, or we are paging from the start.
    KnownNull,
    /// The connection was fetched and has a cursor.
    Known(String),
}

impl EndCursor {
    /// Reconstructs an `EndCursor` from the raw nullable SQL columns
    /// `(last_update_is_null, end_cursor)`.
    pub fn from_row(last_update_is_null: bool, end_cursor: Option<String>) -> Self {
        if last_update_is_null {
            EndCursor::Unknown
        } else {
            match end_cursor {
                Some(s) => EndCursor::Known(s),
                None => EndCursor::KnownNull,
            }
        }
    }

    /// The GraphQL `after:` argument this cursor should produce: `None` means
    /// omit the argument entirely (unknown state); `Some(None)` means pass
    /// `after: null` explicitly (known-null state).
    pub fn after_argument(&self) -> Option<Option<&str>> {
        match self {
            EndCursor::Unknown => None,
            EndCursor::KnownNull => Some(None),
            EndCursor::Known(s) => Some(Some(s.as_str())),
        }
    }
}
