//! Persisted results of settled invocations.
//!
//! A [`Snapshot`] is the `{value?, error?, input?, time?}` tuple exported by
//! [`Registry::serialize`](crate::Registry::serialize) and fed back through
//! [`Registry::restore`](crate::Registry::restore). Absent fields are skipped
//! when serialized, so a resolved snapshot encodes as e.g.
//! `{"value": "X", "input": 1, "time": 1700000000000}`.
//!
//! How the pairs are stored or transported is up to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ActionError;
use crate::future::Status;

/// Exported registry state: `(canonical id, snapshot)` pairs.
pub type SnapshotPairs<D, I> = Vec<(String, Snapshot<D, I>)>;

/// The persisted outcome of one settled invocation.
///
/// A field that is present always restores as `Some`, even when its payload
/// encodes as `null` (`()`, `Option<T>`, unit structs). Only a missing field
/// means `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "D: Deserialize<'de>, I: Deserialize<'de>"))]
pub struct Snapshot<D, I> {
    /// Resolved value.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub value: Option<D>,
    /// Rejection error.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub error: Option<ActionError>,
    /// Input the invocation ran with.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub input: Option<I>,
    /// Settlement time in epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

fn present<'de, T, De>(deserializer: De) -> Result<Option<T>, De::Error>
where
    T: Deserialize<'de>,
    De: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl<D, I> Snapshot<D, I> {
    /// A resolved snapshot.
    pub fn resolved(value: D, input: Option<I>, time: Option<DateTime<Utc>>) -> Self {
        Self {
            value: Some(value),
            error: None,
            input,
            time: time.map(|t| t.timestamp_millis()),
        }
    }

    /// A rejected snapshot.
    pub fn rejected(error: ActionError, input: Option<I>, time: Option<DateTime<Utc>>) -> Self {
        Self {
            value: None,
            error: Some(error),
            input,
            time: time.map(|t| t.timestamp_millis()),
        }
    }

    /// Status this snapshot restores to, or `None` if it carries no outcome.
    ///
    /// An error wins over a value when both are present.
    pub fn status(&self) -> Option<Status> {
        match (&self.error, &self.value) {
            (Some(_), _) => Some(Status::Rejected),
            (None, Some(_)) => Some(Status::Resolved),
            (None, None) => None,
        }
    }

    /// Settlement time, if recorded and representable.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time.and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    /// Split into the settled result and the remaining fields.
    pub(crate) fn into_parts(self) -> Option<(Result<D, ActionError>, Option<I>, Option<DateTime<Utc>>)> {
        let time = self.time();
        let result = match (self.error, self.value) {
            (Some(error), _) => Err(error),
            (None, Some(value)) => Ok(value),
            (None, None) => return None,
        };
        Some((result, self.input, time))
    }
}
