// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use chrono::Utc;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::utils::error::IngestError;

/// Version tag written into every queue entry, so that producers and
/// consumers can evolve the wire format independently.
pub const ENTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
/// The wire form of an accepted payload.
///
/// The payload is carried verbatim as the caller sent it; consumers must
/// tolerate it being any JSON type.
pub struct QueueEntry<'a> {
  version: u32,
  received_at: i64,
  payload: &'a RawValue,
}

impl<'a> QueueEntry<'a> {
  /// Wrap a validated payload, stamping the receipt time in epoch milliseconds.
  pub fn new(payload: &'a RawValue) -> Self {
    QueueEntry {
      version: ENTRY_VERSION,
      received_at: Utc::now().timestamp_millis(),
      payload,
    }
  }

  /// Serialize the entry to the JSON text that is appended to the queue.
  pub fn to_json(&self) -> Result<String, IngestError> {
    serde_json::to_string(self).map_err(|e| IngestError::QueueProtocolError(e.to_string()))
  }
}
