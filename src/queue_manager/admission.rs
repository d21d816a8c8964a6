// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use crate::queue_manager::queue::{ConnectionState, QueueClient};
use crate::utils::error::IngestError;

/// Admission control for the enqueue path.
///
/// Decides, per entry, whether the queue may take it. Keeps no entry-level
/// state; it only reads the adapter's health and depth estimate. This layer
/// is what bounds queue growth and keeps requests from waiting on a dead
/// connection.
pub struct AdmissionPolicy {
  depth_threshold: u64,
}

impl AdmissionPolicy {
  /// Create a policy that rejects entries once the queue depth reaches the
  /// given threshold.
  pub fn new(depth_threshold: u64) -> Self {
    AdmissionPolicy { depth_threshold }
  }

  /// Decide whether a new entry may be forwarded to the queue.
  pub fn admit(&self, queue: &dyn QueueClient) -> Result<(), IngestError> {
    // Fail fast while the connection is down - never park the caller waiting
    // for a reconnect.
    if queue.connection_state() != ConnectionState::Connected {
      return Err(IngestError::QueueUnavailable(
        "Queue connection is down".to_owned(),
      ));
    }

    let depth = queue.depth_estimate();
    if depth >= self.depth_threshold {
      return Err(IngestError::Overloaded {
        depth,
        threshold: self.depth_threshold,
      });
    }

    Ok(())
  }
}
